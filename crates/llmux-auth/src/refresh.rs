use llmux_common::now_epoch_ms;

use crate::store::TokenSet;
use crate::transport::TokenTransport;

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RefreshError {
    /// The refresh token is dead; the handle must be wiped and re-enrolled.
    #[error("refresh token rejected (invalid_grant)")]
    InvalidGrant,
    #[error("token endpoint returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("token endpoint unreachable: {0}")]
    Transport(String),
    #[error("malformed token response: {0}")]
    Malformed(String),
}

/// One refresh round-trip. Serialization per handle is the caller's job
/// (the auth handler holds the per-handle mutex).
pub async fn refresh_tokens(
    transport: &dyn TokenTransport,
    config: &RefreshConfig,
    current: &TokenSet,
) -> Result<TokenSet, RefreshError> {
    let mut fields = vec![
        ("grant_type", "refresh_token".to_string()),
        ("client_id", config.client_id.clone()),
        ("refresh_token", current.refresh_token.clone()),
    ];
    if let Some(secret) = &config.client_secret {
        fields.push(("client_secret", secret.clone()));
    }

    let response = transport
        .post_form(&config.token_url, &fields)
        .await
        .map_err(RefreshError::Transport)?;

    if response.status >= 400 {
        if response.status == 400 && response.error_code() == Some("invalid_grant") {
            return Err(RefreshError::InvalidGrant);
        }
        return Err(RefreshError::Upstream {
            status: response.status,
            message: response
                .error_code()
                .unwrap_or("refresh failed")
                .to_string(),
        });
    }

    let access_token = response
        .body
        .get("access_token")
        .and_then(|value| value.as_str())
        .ok_or_else(|| RefreshError::Malformed("missing access_token".to_string()))?
        .to_string();
    let expires_in = response
        .body
        .get("expires_in")
        .and_then(|value| value.as_i64())
        .ok_or_else(|| RefreshError::Malformed("missing expires_in".to_string()))?;

    // The refresh token rotates only when the upstream hands out a new one;
    // expiry never moves backwards across successful refreshes.
    let refresh_token = response
        .body
        .get("refresh_token")
        .and_then(|value| value.as_str())
        .map(|value| value.to_string())
        .unwrap_or_else(|| current.refresh_token.clone());
    let expiry_date = (now_epoch_ms() + expires_in * 1000).max(current.expiry_date);

    Ok(TokenSet {
        access_token,
        refresh_token,
        expiry_date,
        token_type: response
            .body
            .get("token_type")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| current.token_type.clone()),
        scope: response
            .body
            .get("scope")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| current.scope.clone()),
        api_key: current.api_key.clone(),
    })
}
