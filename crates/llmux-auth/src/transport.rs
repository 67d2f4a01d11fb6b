use async_trait::async_trait;
use serde_json::Value;

/// One form-urlencoded POST to an OAuth endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct FormResponse {
    pub status: u16,
    pub body: Value,
}

impl FormResponse {
    /// OAuth error code from the response body, when present.
    pub fn error_code(&self) -> Option<&str> {
        self.body.get("error").and_then(|value| value.as_str())
    }
}

/// IO seam for the token endpoints. The production implementation lives next
/// to the upstream HTTP client; tests substitute scripted fakes.
#[async_trait]
pub trait TokenTransport: Send + Sync {
    async fn post_form(
        &self,
        url: &str,
        fields: &[(&str, String)],
    ) -> Result<FormResponse, String>;
}
