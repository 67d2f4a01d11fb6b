use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use llmux_auth::{
    DeviceFlow, DeviceFlowConfig, Reauthenticator, RefreshConfig, RefreshError, Refresher,
    TokenSet, TokenTransport, refresh_tokens,
};

/// Refresher bound to one dialect's token endpoint.
pub struct TokenRefresher {
    transport: Arc<dyn TokenTransport>,
    config: RefreshConfig,
}

impl TokenRefresher {
    pub fn new(transport: Arc<dyn TokenTransport>, config: RefreshConfig) -> Self {
        Self { transport, config }
    }
}

#[async_trait]
impl Refresher for TokenRefresher {
    async fn refresh(&self, current: &TokenSet) -> Result<TokenSet, RefreshError> {
        refresh_tokens(self.transport.as_ref(), &self.config, current).await
    }
}

/// Re-enrollment through the device flow; verification instructions go to
/// the operator via the log stream.
pub struct DeviceFlowReauthenticator {
    transport: Arc<dyn TokenTransport>,
    config: DeviceFlowConfig,
}

impl DeviceFlowReauthenticator {
    pub fn new(transport: Arc<dyn TokenTransport>, config: DeviceFlowConfig) -> Self {
        Self { transport, config }
    }
}

#[async_trait]
impl Reauthenticator for DeviceFlowReauthenticator {
    async fn reauthenticate(&self) -> Result<TokenSet, String> {
        DeviceFlow::new(self.transport.as_ref(), self.config.clone())
            .on_verification(|authorization| {
                info!(
                    event = "reauth_verification_required",
                    user_code = %authorization.user_code,
                    url = %authorization.open_url()
                );
            })
            .run()
            .await
            .map_err(|err| err.to_string())
    }
}

/// For credentials that have nothing to refresh (API keys, anonymous).
pub struct NoRefresher;

#[async_trait]
impl Refresher for NoRefresher {
    async fn refresh(&self, _current: &TokenSet) -> Result<TokenSet, RefreshError> {
        Err(RefreshError::Transport(
            "no token endpoint for this credential".to_string(),
        ))
    }
}

/// For instances that cannot re-enroll unattended (API keys, lmstudio).
pub struct NoReauthenticator;

#[async_trait]
impl Reauthenticator for NoReauthenticator {
    async fn reauthenticate(&self) -> Result<TokenSet, String> {
        Err("re-enrollment requires the login command".to_string())
    }
}
