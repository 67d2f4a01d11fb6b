use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use llmux_common::now_epoch_ms;

use crate::refresh::RefreshError;
use crate::store::{CredentialHandle, CredentialStore, SAFETY_MARGIN_MS, StoreError, TokenSet};

#[async_trait]
pub trait Refresher: Send + Sync {
    async fn refresh(&self, current: &TokenSet) -> Result<TokenSet, RefreshError>;
}

#[async_trait]
pub trait Reauthenticator: Send + Sync {
    /// Full re-enrollment (e.g. a device flow); may take minutes.
    async fn reauthenticate(&self) -> Result<TokenSet, String>;
}

/// Optional upstream liveness probe for the health check.
#[async_trait]
pub trait UpstreamProbe: Send + Sync {
    async fn probe(&self) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    None,
    Refresh,
    Reauth,
}

#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub ok: bool,
    pub action: AuthAction,
    pub handle: CredentialHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Valid,
    ExpiringSoon,
    Expired,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub needs_reauth: bool,
    pub token_status: TokenStatus,
}

#[derive(Debug, Clone)]
pub struct AuthHandlerConfig {
    pub max_refresh_attempts: u32,
    pub auto_reauth: bool,
    pub reauth_timeout: Duration,
}

impl Default for AuthHandlerConfig {
    fn default() -> Self {
        Self {
            max_refresh_attempts: 3,
            auto_reauth: true,
            reauth_timeout: Duration::from_secs(300),
        }
    }
}

struct HandlerState {
    handle: CredentialHandle,
    refresh_attempts: u32,
}

/// Owns one credential handle and drives its recovery state machine.
///
/// All refresh/reauth traffic for the handle is serialized through the inner
/// mutex: while one caller refreshes, peers wait and then observe the result.
pub struct AuthHandler {
    store: CredentialStore,
    path: PathBuf,
    config: AuthHandlerConfig,
    state: Mutex<HandlerState>,
}

impl AuthHandler {
    pub fn new(
        store: CredentialStore,
        path: PathBuf,
        handle: CredentialHandle,
        config: AuthHandlerConfig,
    ) -> Self {
        Self {
            store,
            path,
            config,
            state: Mutex::new(HandlerState {
                handle,
                refresh_attempts: 0,
            }),
        }
    }

    pub async fn handle(&self) -> CredentialHandle {
        self.state.lock().await.handle.clone()
    }

    /// Proactive path: make the handle valid before a request goes out.
    pub async fn ensure_valid(
        &self,
        refresher: &dyn Refresher,
        reauthenticator: &dyn Reauthenticator,
    ) -> AuthOutcome {
        let mut state = self.state.lock().await;
        if state.handle.is_valid(now_epoch_ms()) {
            return AuthOutcome {
                ok: true,
                action: AuthAction::None,
                handle: state.handle.clone(),
            };
        }
        self.recover(&mut state, refresher, reauthenticator).await
    }

    /// Reactive path: the upstream answered 401 for this handle.
    pub async fn handle_auth_error(
        &self,
        refresher: &dyn Refresher,
        reauthenticator: &dyn Reauthenticator,
    ) -> AuthOutcome {
        let mut state = self.state.lock().await;
        self.recover(&mut state, refresher, reauthenticator).await
    }

    /// Recovery state machine: Refreshing until the attempt budget is spent,
    /// then Reauthing (when enabled) under a hard deadline.
    async fn recover(
        &self,
        state: &mut HandlerState,
        refresher: &dyn Refresher,
        reauthenticator: &dyn Reauthenticator,
    ) -> AuthOutcome {
        if let CredentialHandle::OAuth(tokens) = &state.handle
            && !tokens.refresh_token.is_empty()
            && state.refresh_attempts < self.config.max_refresh_attempts
        {
            state.refresh_attempts += 1;
            match refresher.refresh(tokens).await {
                Ok(refreshed) => {
                    state.handle = CredentialHandle::OAuth(refreshed);
                    state.refresh_attempts = 0;
                    self.persist(&state.handle);
                    info!(event = "token_refreshed", path = %self.path.display());
                    return AuthOutcome {
                        ok: true,
                        action: AuthAction::Refresh,
                        handle: state.handle.clone(),
                    };
                }
                Err(RefreshError::InvalidGrant) => {
                    // Dead refresh token: one atomic wipe, then re-enrollment
                    // is the only way back.
                    warn!(event = "refresh_token_invalid", path = %self.path.display());
                    state.handle = CredentialHandle::Empty;
                    self.persist(&state.handle);
                }
                Err(err) => {
                    warn!(event = "token_refresh_failed", error = %err);
                    if state.refresh_attempts < self.config.max_refresh_attempts {
                        return AuthOutcome {
                            ok: false,
                            action: AuthAction::Refresh,
                            handle: state.handle.clone(),
                        };
                    }
                }
            }
        }

        if !self.config.auto_reauth {
            return AuthOutcome {
                ok: false,
                action: AuthAction::Refresh,
                handle: state.handle.clone(),
            };
        }

        match tokio::time::timeout(self.config.reauth_timeout, reauthenticator.reauthenticate())
            .await
        {
            Ok(Ok(tokens)) => {
                state.handle = CredentialHandle::OAuth(tokens);
                state.refresh_attempts = 0;
                self.persist(&state.handle);
                info!(event = "reauth_succeeded", path = %self.path.display());
                AuthOutcome {
                    ok: true,
                    action: AuthAction::Reauth,
                    handle: state.handle.clone(),
                }
            }
            Ok(Err(err)) => {
                warn!(event = "reauth_failed", error = %err);
                AuthOutcome {
                    ok: false,
                    action: AuthAction::Reauth,
                    handle: state.handle.clone(),
                }
            }
            Err(_) => {
                warn!(event = "reauth_timeout", timeout_s = self.config.reauth_timeout.as_secs());
                AuthOutcome {
                    ok: false,
                    action: AuthAction::Reauth,
                    handle: state.handle.clone(),
                }
            }
        }
    }

    /// Health check that attempts recovery first: an invalid handle goes
    /// through the refresh/reauth machinery before the status is computed.
    pub async fn enhanced_health_check(
        &self,
        refresher: &dyn Refresher,
        reauthenticator: &dyn Reauthenticator,
        probe: Option<&dyn UpstreamProbe>,
    ) -> HealthReport {
        let needs_recovery = {
            let state = self.state.lock().await;
            !state.handle.is_valid(now_epoch_ms())
        };
        if needs_recovery {
            let outcome = self.ensure_valid(refresher, reauthenticator).await;
            if !outcome.ok {
                warn!(event = "health_recovery_failed", path = %self.path.display());
            }
        }
        self.health_check(probe).await
    }

    pub async fn health_check(&self, probe: Option<&dyn UpstreamProbe>) -> HealthReport {
        let state = self.state.lock().await;
        let now = now_epoch_ms();
        let token_status = match &state.handle {
            CredentialHandle::Empty => TokenStatus::Missing,
            CredentialHandle::ApiKey(key) => {
                if key.is_empty() {
                    TokenStatus::Missing
                } else {
                    TokenStatus::Valid
                }
            }
            CredentialHandle::OAuth(tokens) => {
                let remaining = tokens.expiry_date - now;
                if remaining <= 0 {
                    TokenStatus::Expired
                } else if remaining <= SAFETY_MARGIN_MS * 2 {
                    TokenStatus::ExpiringSoon
                } else {
                    TokenStatus::Valid
                }
            }
        };
        let needs_reauth = match &state.handle {
            CredentialHandle::Empty => true,
            CredentialHandle::OAuth(tokens) => {
                token_status == TokenStatus::Expired && tokens.refresh_token.is_empty()
            }
            CredentialHandle::ApiKey(_) => false,
        };
        drop(state);

        let probe_failed = match probe {
            Some(probe) => probe.probe().await.is_err(),
            None => false,
        };

        let status = if probe_failed
            || needs_reauth
            || matches!(token_status, TokenStatus::Expired | TokenStatus::Missing)
        {
            HealthStatus::Unhealthy
        } else if token_status == TokenStatus::ExpiringSoon {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            needs_reauth,
            token_status,
        }
    }

    fn persist(&self, handle: &CredentialHandle) {
        if let Err(err) = self.store.save(handle, &self.path) {
            match err {
                StoreError::NotFound => {}
                other => warn!(event = "credential_persist_failed", error = %other),
            }
        }
    }
}
