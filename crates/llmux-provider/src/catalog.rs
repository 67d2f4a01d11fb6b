use llmux_auth::{DeviceFlowConfig, RefreshConfig};
use llmux_transform::Dialect;

/// OAuth endpoint sets for the dialects that enroll via device flow.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub device: DeviceFlowConfig,
    pub refresh: RefreshConfig,
}

/// Known device-flow endpoints per dialect. API-key dialects return `None`;
/// the caller configures their key directly.
pub fn oauth_endpoints(dialect: Dialect) -> Option<OAuthEndpoints> {
    match dialect {
        Dialect::Qwen => Some(OAuthEndpoints {
            device: DeviceFlowConfig {
                device_code_url: "https://chat.qwen.ai/api/v1/oauth2/device/code".to_string(),
                token_url: "https://chat.qwen.ai/api/v1/oauth2/token".to_string(),
                client_id: "f0304373b74a44d2b584a3fb70ca9e56".to_string(),
                client_secret: None,
                scopes: vec!["openid".to_string(), "profile".to_string(), "model.completion".to_string()],
            },
            refresh: RefreshConfig {
                token_url: "https://chat.qwen.ai/api/v1/oauth2/token".to_string(),
                client_id: "f0304373b74a44d2b584a3fb70ca9e56".to_string(),
                client_secret: None,
            },
        }),
        Dialect::IFlow => Some(OAuthEndpoints {
            device: DeviceFlowConfig {
                device_code_url: "https://iflow.cn/oauth/device/code".to_string(),
                token_url: "https://iflow.cn/oauth/token".to_string(),
                client_id: "10009311001".to_string(),
                client_secret: Some("4Z3YjXycVsQvyGF2etnNyZ3PWIzBJKKmDBhN2TNykQF".to_string()),
                scopes: vec!["openid".to_string(), "profile".to_string()],
            },
            refresh: RefreshConfig {
                token_url: "https://iflow.cn/oauth/token".to_string(),
                client_id: "10009311001".to_string(),
                client_secret: Some("4Z3YjXycVsQvyGF2etnNyZ3PWIzBJKKmDBhN2TNykQF".to_string()),
            },
        }),
        Dialect::Anthropic | Dialect::OpenAi | Dialect::LmStudio => None,
    }
}
