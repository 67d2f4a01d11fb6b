//! Provider adapters: HTTP IO against one upstream family.
//!
//! Adapters never route; they translate an already-dialected request into an
//! HTTP call, run the 401 recovery loop with the auth handler, and lift the
//! body (or SSE stream) back into typed shapes.

pub mod adapter;
pub mod anthropic;
pub mod auth_support;
pub mod catalog;
pub mod client;
pub mod instance;
pub mod openai_compat;
pub mod transport;

pub use adapter::{AdapterConfig, CallContext, ChunkStream, ProviderAdapter};
pub use anthropic::AnthropicAdapter;
pub use auth_support::{DeviceFlowReauthenticator, NoReauthenticator, NoRefresher, TokenRefresher};
pub use catalog::{OAuthEndpoints, oauth_endpoints};
pub use client::{
    ReqwestUpstreamClient, TransportErrorKind, UpstreamBody, UpstreamClient, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse,
};
pub use instance::{AuthMode, Capabilities, ProviderInstance};
pub use openai_compat::OpenAiCompatAdapter;
pub use transport::HttpTokenTransport;
