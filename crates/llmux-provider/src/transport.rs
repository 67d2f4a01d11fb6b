use async_trait::async_trait;
use serde_json::Value;

use llmux_auth::{FormResponse, TokenTransport};

/// reqwest-backed token transport for the OAuth endpoints.
#[derive(Clone)]
pub struct HttpTokenTransport {
    client: reqwest::Client,
}

impl HttpTokenTransport {
    pub fn new(proxy: Option<&str>) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl TokenTransport for HttpTokenTransport {
    async fn post_form(
        &self,
        url: &str,
        fields: &[(&str, String)],
    ) -> Result<FormResponse, String> {
        let response = self
            .client
            .post(url)
            .form(fields)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = response.status().as_u16();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok(FormResponse { status, body })
    }
}
