//! The four-stage pipeline executor and the streaming adapter.
//!
//! One call to [`PipelineExecutor::execute`] takes a dialected chat request
//! through protocol switch, streaming conformance, compatibility mapping and
//! provider IO, honoring the wall-clock deadline and cancellation, and feeds
//! every failure into the error center.

pub mod cancel;
pub mod executor;
pub mod stream;

pub use cancel::{CancelHandle, CancelToken, cancel_pair};
pub use executor::{
    AdapterRegistry, ExecutionResult, ExecutorConfig, InstanceMappings, PipelineExecutor,
    PipelineOutcome,
};
pub use stream::{ChunkEnvelope, ChunkMetadata, StreamCombineError, chunk_value, combine_chunks};
