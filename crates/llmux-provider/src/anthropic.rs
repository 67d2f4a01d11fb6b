use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use llmux_auth::{AuthHandler, CredentialHandle, Reauthenticator, Refresher};
use llmux_common::{PipelineError, codes};
use llmux_protocol::anthropic::messages::{CreateMessageRequest, CreateMessageResponse};
use llmux_protocol::anthropic::stream::StreamEvent;
use llmux_protocol::sse::SseParser;
use llmux_transform::{ChatRequest, ChatResponse, StreamFrame};

use crate::adapter::{AdapterConfig, CallContext, ChunkStream, ProviderAdapter};
use crate::client::{
    TransportErrorKind, UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest,
};
use crate::instance::{AuthMode, ProviderInstance};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Passthrough adapter for upstreams that speak the Anthropic dialect
/// natively. API keys go out as `x-api-key`, OAuth tokens as a bearer.
pub struct AnthropicAdapter {
    instance: ProviderInstance,
    client: Arc<dyn UpstreamClient>,
    auth: Arc<AuthHandler>,
    refresher: Arc<dyn Refresher>,
    reauthenticator: Arc<dyn Reauthenticator>,
    config: AdapterConfig,
}

impl AnthropicAdapter {
    pub fn new(
        instance: ProviderInstance,
        client: Arc<dyn UpstreamClient>,
        auth: Arc<AuthHandler>,
        refresher: Arc<dyn Refresher>,
        reauthenticator: Arc<dyn Reauthenticator>,
        config: AdapterConfig,
    ) -> Self {
        Self {
            instance,
            client,
            auth,
            refresher,
            reauthenticator,
            config,
        }
    }

    fn prepare(&self, req: ChatRequest, stream: bool) -> Result<CreateMessageRequest, PipelineError> {
        let ChatRequest::Anthropic(mut req) = req else {
            return Err(self.error(
                codes::DATA_INVALID_FORMAT,
                "adapter expects the anthropic dialect",
            ));
        };
        req.model = self.instance.default_model.clone();
        req.stream = Some(stream);
        Ok(req)
    }

    async fn auth_headers(&self) -> Result<Vec<(String, String)>, PipelineError> {
        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
        ];
        if self.instance.auth_mode == AuthMode::None {
            return Ok(headers);
        }
        let outcome = self
            .auth
            .ensure_valid(self.refresher.as_ref(), self.reauthenticator.as_ref())
            .await;
        if !outcome.ok {
            return Err(self.error(
                codes::AUTHENTICATION_FAILED,
                "credential is invalid and could not be recovered",
            ));
        }
        match outcome.handle {
            CredentialHandle::ApiKey(key) => {
                headers.push(("x-api-key".to_string(), key));
            }
            CredentialHandle::OAuth(tokens) => {
                headers.push((
                    "Authorization".to_string(),
                    format!("Bearer {}", tokens.access_token),
                ));
            }
            CredentialHandle::Empty => {
                return Err(self.error(
                    codes::INVALID_CREDENTIALS,
                    "no credential enrolled for this instance",
                ));
            }
        }
        Ok(headers)
    }

    async fn send_with_recovery(
        &self,
        body: &CreateMessageRequest,
        stream: bool,
    ) -> Result<crate::client::UpstreamHttpResponse, PipelineError> {
        let rendered = serde_json::to_vec(body).map_err(|err| {
            self.error(codes::DATA_INVALID_FORMAT, format!("encode request: {err}"))
        })?;
        let mut attempt: u32 = 0;
        loop {
            let request = UpstreamHttpRequest {
                url: self.instance.messages_url(),
                headers: self.auth_headers().await?,
                body: Bytes::from(rendered.clone()),
                is_stream: stream,
                timeout: if stream {
                    self.config.stream_timeout
                } else {
                    self.config.chat_timeout
                },
            };
            match self.client.send(request).await {
                Ok(response) => return Ok(response),
                Err(UpstreamFailure::Http { status: 401, .. })
                    if attempt < self.config.max_retries =>
                {
                    attempt += 1;
                    debug!(event = "upstream_401", instance = %self.instance.id, attempt);
                    let outcome = self
                        .auth
                        .handle_auth_error(self.refresher.as_ref(), self.reauthenticator.as_ref())
                        .await;
                    if !outcome.ok {
                        return Err(self.error(
                            codes::AUTHENTICATION_FAILED,
                            "401 recovery exhausted",
                        ));
                    }
                }
                Err(failure) => return Err(self.failure_to_error(failure)),
            }
        }
    }

    fn failure_to_error(&self, failure: UpstreamFailure) -> PipelineError {
        match failure {
            UpstreamFailure::Transport { kind, message } => {
                let code = match kind {
                    TransportErrorKind::Timeout => codes::REQUEST_TIMEOUT,
                    TransportErrorKind::Connect => codes::CONNECTION_FAILED,
                    TransportErrorKind::Other => codes::NETWORK_UNREACHABLE,
                };
                self.error(code, message)
            }
            UpstreamFailure::Http { status, body, .. } => {
                let message = String::from_utf8_lossy(&body).into_owned();
                let code = match status {
                    401 => codes::AUTHENTICATION_FAILED,
                    403 => codes::ACCESS_DENIED,
                    429 => codes::RATE_LIMIT_EXCEEDED,
                    400..=499 => codes::DATA_INVALID_FORMAT,
                    _ => codes::INTERNAL_ERROR,
                };
                self.error(code, message)
            }
        }
    }

    fn error(&self, code: &str, message: impl Into<String>) -> PipelineError {
        PipelineError::new(code, message, "provider_adapter")
            .with_instance(self.instance.id.clone())
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn instance(&self) -> &ProviderInstance {
        &self.instance
    }

    async fn execute(
        &self,
        req: ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChatResponse, PipelineError> {
        let body = self.prepare(req, false)?;
        debug!(
            event = "upstream_messages",
            execution_id = %ctx.execution_id,
            instance = %self.instance.id,
            model = %body.model
        );
        let response = self.send_with_recovery(&body, false).await?;
        let bytes = match response.body {
            UpstreamBody::Bytes(bytes) => bytes,
            UpstreamBody::Stream(_) => {
                return Err(self.error(
                    codes::PROTOCOL_ERROR,
                    "unexpected streamed body for a messages call",
                ));
            }
        };
        let parsed: CreateMessageResponse = serde_json::from_slice(&bytes).map_err(|err| {
            self.error(codes::PROTOCOL_ERROR, format!("decode response: {err}"))
        })?;
        Ok(ChatResponse::Anthropic(parsed))
    }

    async fn execute_streaming(
        &self,
        req: ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChunkStream, PipelineError> {
        let body = self.prepare(req, true)?;
        debug!(
            event = "upstream_messages_stream",
            execution_id = %ctx.execution_id,
            instance = %self.instance.id,
            model = %body.model
        );
        let response = self.send_with_recovery(&body, true).await?;
        let instance_id = self.instance.id.clone();
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        let mut upstream = match response.body {
            UpstreamBody::Stream(upstream) => upstream,
            UpstreamBody::Bytes(bytes) => {
                tokio::spawn(async move {
                    let mut parser = SseParser::new();
                    let mut events = parser.push_bytes(&bytes);
                    events.extend(parser.finish());
                    for event in events {
                        if let Some(frame) = decode_event(&event.data)
                            && tx.send(Ok(frame)).await.is_err()
                        {
                            return;
                        }
                    }
                });
                return Ok(rx);
            }
        };

        tokio::spawn(async move {
            let mut parser = SseParser::new();
            while let Some(next) = upstream.recv().await {
                let chunk = match next {
                    Ok(chunk) => chunk,
                    Err(message) => {
                        let err =
                            PipelineError::new(codes::CONNECTION_FAILED, message, "provider_adapter")
                                .with_instance(instance_id.clone());
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };
                for event in parser.push_bytes(&chunk) {
                    if let Some(frame) = decode_event(&event.data) {
                        let done = matches!(
                            frame,
                            StreamFrame::Anthropic(StreamEvent::MessageStop)
                        );
                        if tx.send(Ok(frame)).await.is_err() {
                            return;
                        }
                        if done {
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

fn decode_event(data: &str) -> Option<StreamFrame> {
    match serde_json::from_str::<StreamEvent>(data) {
        Ok(event) => Some(StreamFrame::Anthropic(event)),
        Err(err) => {
            warn!(event = "stream_event_skipped", error = %err);
            None
        }
    }
}
