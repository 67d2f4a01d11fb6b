use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::info;

use llmux_common::now_epoch_ms;

use crate::store::TokenSet;
use crate::transport::TokenTransport;

const DEVICE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

#[derive(Debug, Clone)]
pub struct DeviceFlowConfig {
    pub device_code_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_interval() -> u64 {
    5
}

impl DeviceAuthorization {
    /// URL the user should open; prefers the pre-filled variant.
    pub fn open_url(&self) -> &str {
        self.verification_uri_complete
            .as_deref()
            .unwrap_or(&self.verification_uri)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceFlowError {
    #[error("device authorization timed out")]
    Timeout,
    #[error("device authorization rejected: {0}")]
    Rejected(String),
    #[error("device endpoint unreachable: {0}")]
    Transport(String),
    #[error("malformed device response: {0}")]
    Malformed(String),
}

type VerificationCallback = Box<dyn Fn(&DeviceAuthorization) + Send + Sync>;

/// OAuth 2.0 device flow with PKCE.
pub struct DeviceFlow<'a> {
    transport: &'a dyn TokenTransport,
    config: DeviceFlowConfig,
    on_verification: Option<VerificationCallback>,
}

impl<'a> DeviceFlow<'a> {
    pub fn new(transport: &'a dyn TokenTransport, config: DeviceFlowConfig) -> Self {
        Self {
            transport,
            config,
            on_verification: None,
        }
    }

    /// Called once with the user code and verification URL; the CLI uses this
    /// to print instructions or open the browser.
    pub fn on_verification(
        mut self,
        callback: impl Fn(&DeviceAuthorization) + Send + Sync + 'static,
    ) -> Self {
        self.on_verification = Some(Box::new(callback));
        self
    }

    pub async fn run(&self) -> Result<TokenSet, DeviceFlowError> {
        let verifier = URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>());
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));

        let authorization = self.request_device_code(&challenge).await?;
        info!(
            event = "device_flow_started",
            user_code = %authorization.user_code,
            verification_uri = %authorization.verification_uri,
            expires_in = authorization.expires_in
        );
        if let Some(callback) = &self.on_verification {
            callback(&authorization);
        }

        self.poll_for_tokens(&authorization, &verifier).await
    }

    async fn request_device_code(
        &self,
        challenge: &str,
    ) -> Result<DeviceAuthorization, DeviceFlowError> {
        let fields = [
            ("client_id", self.config.client_id.clone()),
            ("scope", self.config.scopes.join(" ")),
            ("code_challenge", challenge.to_string()),
            ("code_challenge_method", "S256".to_string()),
        ];
        let response = self
            .transport
            .post_form(&self.config.device_code_url, &fields)
            .await
            .map_err(DeviceFlowError::Transport)?;
        if response.status >= 400 {
            return Err(DeviceFlowError::Rejected(
                response
                    .error_code()
                    .unwrap_or("device_code request failed")
                    .to_string(),
            ));
        }
        serde_json::from_value(response.body)
            .map_err(|err| DeviceFlowError::Malformed(err.to_string()))
    }

    async fn poll_for_tokens(
        &self,
        authorization: &DeviceAuthorization,
        verifier: &str,
    ) -> Result<TokenSet, DeviceFlowError> {
        let deadline = Instant::now() + Duration::from_secs(authorization.expires_in);
        let mut interval = authorization.interval.max(1);

        loop {
            tokio::time::sleep(Duration::from_secs(interval)).await;
            if Instant::now() >= deadline {
                return Err(DeviceFlowError::Timeout);
            }

            let mut fields = vec![
                ("grant_type", DEVICE_GRANT.to_string()),
                ("client_id", self.config.client_id.clone()),
                ("device_code", authorization.device_code.clone()),
                ("code_verifier", verifier.to_string()),
            ];
            if let Some(secret) = &self.config.client_secret {
                fields.push(("client_secret", secret.clone()));
            }
            let response = self
                .transport
                .post_form(&self.config.token_url, &fields)
                .await
                .map_err(DeviceFlowError::Transport)?;

            if response.status < 400 {
                return tokens_from_body(&response.body);
            }
            match response.error_code() {
                Some("authorization_pending") => continue,
                Some("slow_down") => {
                    interval += 2;
                    continue;
                }
                Some(other) => return Err(DeviceFlowError::Rejected(other.to_string())),
                None => {
                    return Err(DeviceFlowError::Rejected(format!(
                        "status {}",
                        response.status
                    )));
                }
            }
        }
    }
}

fn tokens_from_body(body: &serde_json::Value) -> Result<TokenSet, DeviceFlowError> {
    let access_token = body
        .get("access_token")
        .and_then(|value| value.as_str())
        .ok_or_else(|| DeviceFlowError::Malformed("missing access_token".to_string()))?;
    let expires_in = body
        .get("expires_in")
        .and_then(|value| value.as_i64())
        .ok_or_else(|| DeviceFlowError::Malformed("missing expires_in".to_string()))?;
    Ok(TokenSet {
        access_token: access_token.to_string(),
        refresh_token: body
            .get("refresh_token")
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string(),
        expiry_date: now_epoch_ms() + expires_in * 1000,
        token_type: body
            .get("token_type")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string()),
        scope: body
            .get("scope")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string()),
        api_key: body
            .get("apiKey")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FormResponse;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct ScriptedTransport {
        responses: Mutex<Vec<FormResponse>>,
        polls: Mutex<u32>,
    }

    #[async_trait]
    impl TokenTransport for ScriptedTransport {
        async fn post_form(
            &self,
            url: &str,
            fields: &[(&str, String)],
        ) -> Result<FormResponse, String> {
            if url.contains("/device") {
                assert!(
                    fields
                        .iter()
                        .any(|(name, value)| *name == "code_challenge_method" && value == "S256")
                );
            } else {
                *self.polls.lock().unwrap() += 1;
                assert!(
                    fields
                        .iter()
                        .any(|(name, value)| *name == "grant_type" && value == DEVICE_GRANT)
                );
            }
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err("no scripted response".to_string());
            }
            Ok(responses.remove(0))
        }
    }

    fn config() -> DeviceFlowConfig {
        DeviceFlowConfig {
            device_code_url: "https://auth.example.test/device/code".to_string(),
            token_url: "https://auth.example.test/token".to_string(),
            client_id: "client-1".to_string(),
            client_secret: None,
            scopes: vec!["openid".to_string(), "profile".to_string()],
        }
    }

    fn device_response(expires_in: u64, interval: u64) -> FormResponse {
        FormResponse {
            status: 200,
            body: json!({
                "device_code": "dev-1",
                "user_code": "ABCD-1234",
                "verification_uri": "https://auth.example.test/activate",
                "verification_uri_complete": "https://auth.example.test/activate?code=ABCD-1234",
                "expires_in": expires_in,
                "interval": interval
            }),
        }
    }

    fn pending() -> FormResponse {
        FormResponse {
            status: 400,
            body: json!({"error": "authorization_pending"}),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_tokens_arrive() {
        let transport = ScriptedTransport {
            responses: Mutex::new(vec![
                device_response(600, 5),
                pending(),
                pending(),
                FormResponse {
                    status: 200,
                    body: json!({"access_token": "at", "refresh_token": "rt", "expires_in": 3600}),
                },
            ]),
            polls: Mutex::new(0),
        };
        let tokens = DeviceFlow::new(&transport, config()).run().await.unwrap();
        assert_eq!(tokens.access_token, "at");
        assert_eq!(*transport.polls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_down_extends_the_interval() {
        let transport = ScriptedTransport {
            responses: Mutex::new(vec![
                device_response(600, 5),
                FormResponse {
                    status: 400,
                    body: json!({"error": "slow_down"}),
                },
                FormResponse {
                    status: 200,
                    body: json!({"access_token": "at", "expires_in": 60}),
                },
            ]),
            polls: Mutex::new(0),
        };
        let started = Instant::now();
        DeviceFlow::new(&transport, config()).run().await.unwrap();
        // 5s first poll + 7s second poll under paused time.
        assert!(started.elapsed() >= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_bound_yields_timeout() {
        let transport = ScriptedTransport {
            responses: Mutex::new(vec![
                device_response(7, 5),
                pending(),
                pending(),
                pending(),
            ]),
            polls: Mutex::new(0),
        };
        let err = DeviceFlow::new(&transport, config()).run().await.unwrap_err();
        assert_eq!(err, DeviceFlowError::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_error_aborts() {
        let transport = ScriptedTransport {
            responses: Mutex::new(vec![
                device_response(600, 1),
                FormResponse {
                    status: 400,
                    body: json!({"error": "access_denied"}),
                },
            ]),
            polls: Mutex::new(0),
        };
        let err = DeviceFlow::new(&transport, config()).run().await.unwrap_err();
        assert_eq!(err, DeviceFlowError::Rejected("access_denied".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn verification_callback_sees_user_code() {
        let transport = ScriptedTransport {
            responses: Mutex::new(vec![
                device_response(600, 1),
                FormResponse {
                    status: 200,
                    body: json!({"access_token": "at", "expires_in": 60}),
                },
            ]),
            polls: Mutex::new(0),
        };
        let seen = std::sync::Arc::new(Mutex::new(String::new()));
        let seen_clone = seen.clone();
        DeviceFlow::new(&transport, config())
            .on_verification(move |auth| {
                *seen_clone.lock().unwrap() = auth.user_code.clone();
            })
            .run()
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), "ABCD-1234");
    }
}
