use serde::{Deserialize, Serialize};

use llmux_common::InstanceId;
use llmux_transform::Dialect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMode {
    #[serde(rename = "oauth")]
    OAuth,
    #[serde(rename = "api_key")]
    ApiKey,
    #[serde(rename = "none")]
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub tools: bool,
    #[serde(default)]
    pub vision: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// One concrete upstream configuration.
///
/// Exactly one credential handle belongs to an instance; the handle itself
/// lives in the instance's `AuthHandler`, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInstance {
    pub id: InstanceId,
    pub dialect: Dialect,
    pub endpoint: String,
    pub default_model: String,
    #[serde(default)]
    pub supported_models: Vec<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    pub auth_mode: AuthMode,
}

impl ProviderInstance {
    pub fn supports_model(&self, model: &str) -> bool {
        self.default_model == model
            || self
                .supported_models
                .iter()
                .any(|supported| supported == model)
    }

    pub fn chat_url(&self) -> String {
        join_endpoint(&self.endpoint, "chat/completions")
    }

    pub fn messages_url(&self) -> String {
        join_endpoint(&self.endpoint, "v1/messages")
    }
}

fn join_endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
