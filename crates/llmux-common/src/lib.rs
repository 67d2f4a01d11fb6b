//! Shared vocabulary for the llmux data and control planes.
//!
//! Everything here is plain data: the error model that every stage feeds into
//! the error center, the closed set of error codes, and the client-visible
//! HTTP status mapping. No IO, no runtime dependencies.

pub mod context;
pub mod error;
pub mod ids;

pub use context::ExecutionContext;
pub use error::{
    ErrorCategory, ErrorImpact, ErrorResponse, ErrorSeverity, PipelineError, Recoverability,
    codes, http_status,
};
pub use ids::{CompositeId, InstanceId, PipelineId, composite_id, now_epoch_ms};
