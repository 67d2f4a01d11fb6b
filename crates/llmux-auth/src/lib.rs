//! Provider authentication lifecycle: persisted credentials, OAuth device
//! flow enrollment, proactive refresh, and reactive 401 recovery.
//!
//! IO happens through two seams: the filesystem (credential store) and the
//! [`TokenTransport`] trait (token endpoints), so tests run against fakes.

pub mod device;
pub mod handler;
pub mod refresh;
pub mod store;
pub mod transport;

pub use device::{DeviceAuthorization, DeviceFlow, DeviceFlowConfig};
pub use handler::{
    AuthAction, AuthHandler, AuthHandlerConfig, AuthOutcome, HealthReport, HealthStatus,
    Reauthenticator, Refresher, TokenStatus, UpstreamProbe,
};
pub use refresh::{RefreshConfig, RefreshError, refresh_tokens};
pub use store::{CredentialHandle, CredentialStore, StoreError, TokenSet};
pub use transport::{FormResponse, TokenTransport};
