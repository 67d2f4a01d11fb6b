use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use llmux_auth::{AuthHandler, CredentialHandle, Reauthenticator, Refresher};
use llmux_common::{PipelineError, codes};
use llmux_protocol::openai::chat::{ChatCompletionRequest, ChatCompletionResponse};
use llmux_protocol::openai::stream::ChatCompletionChunk;
use llmux_protocol::sse::SseParser;
use llmux_transform::{ChatRequest, ChatResponse, Dialect, StreamFrame};

use crate::adapter::{AdapterConfig, CallContext, ChunkStream, ProviderAdapter};
use crate::client::{
    TransportErrorKind, UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse,
};
use crate::instance::{AuthMode, ProviderInstance};

const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Adapter for every upstream speaking the OpenAI chat-completions wire
/// shape (openai, qwen, iflow, lmstudio).
pub struct OpenAiCompatAdapter {
    instance: ProviderInstance,
    client: Arc<dyn UpstreamClient>,
    auth: Arc<AuthHandler>,
    refresher: Arc<dyn Refresher>,
    reauthenticator: Arc<dyn Reauthenticator>,
    config: AdapterConfig,
}

impl OpenAiCompatAdapter {
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

    /// Pins the upstream-facing request: always the instance's configured
    /// default model (never the virtual model id), and explicit
    /// `strict: false` on tool definitions for compatible upstreams.
    fn prepare(&self, req: ChatRequest, stream: bool) -> Result<ChatCompletionRequest, PipelineError> {
        let ChatRequest::OpenAi(mut req) = req else {
            return Err(self.error(
                codes::DATA_INVALID_FORMAT,
                "adapter expects the openai dialect",
            ));
        };
        req.model = self.instance.default_model.clone();
        req.stream = Some(stream);
        if let Some(tools) = &mut req.tools {
            for tool in tools {
                tool.function.strict = Some(false);
            }
        }
        Ok(req)
    }

    /// Bearer token for the upstream call. iFlow keeps an API key next to
    /// its OAuth tokens and tool calling only works with the key, so the key
    /// wins when both are present.
    async fn bearer(&self) -> Result<Option<String>, PipelineError> {
        let handle = match self.instance.auth_mode {
            AuthMode::None => return Ok(None),
            AuthMode::ApiKey | AuthMode::OAuth => {
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
                outcome.handle
            }
        };

        match handle {
            CredentialHandle::ApiKey(key) => Ok(Some(key)),
            CredentialHandle::OAuth(tokens) => {
                let prefer_api_key =
                    self.instance.dialect == Dialect::IFlow && tokens.api_key.is_some();
                if prefer_api_key {
                    Ok(tokens.api_key)
                } else {
                    Ok(Some(tokens.access_token))
                }
            }
            CredentialHandle::Empty => Err(self.error(
                codes::INVALID_CREDENTIALS,
                "no credential enrolled for this instance",
            )),
        }
    }

    async fn build_request(
        &self,
        body: &ChatCompletionRequest,
        stream: bool,
    ) -> Result<UpstreamHttpRequest, PipelineError> {
        let rendered = serde_json::to_vec(body).map_err(|err| {
            self.error(codes::DATA_INVALID_FORMAT, format!("encode request: {err}"))
        })?;
        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        if let Some(token) = self.bearer().await? {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        if stream {
            headers.push(("Accept".to_string(), "text/event-stream".to_string()));
        }
        Ok(UpstreamHttpRequest {
            url: self.instance.chat_url(),
            headers,
            body: Bytes::from(rendered),
            is_stream: stream,
            timeout: if stream {
                self.config.stream_timeout
            } else {
                self.config.chat_timeout
            },
        })
    }

    /// Sends the request, recovering from 401 through the auth handler and
    /// retrying the identical request within the retry budget.
    async fn send_with_recovery(
        &self,
        body: &ChatCompletionRequest,
        stream: bool,
    ) -> Result<UpstreamHttpResponse, PipelineError> {
        let mut attempt: u32 = 0;
        loop {
            let request = self.build_request(body, stream).await?;
            match self.client.send(request).await {
                Ok(response) => return Ok(response),
                Err(UpstreamFailure::Http { status: 401, body, .. })
                    if attempt < self.config.max_retries =>
                {
                    attempt += 1;
                    debug!(
                        event = "upstream_401",
                        instance = %self.instance.id,
                        attempt,
                        body = %String::from_utf8_lossy(&body)
                    );
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
                    429 if message.contains("quota") => codes::QUOTA_EXCEEDED,
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
impl ProviderAdapter for OpenAiCompatAdapter {
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
            event = "upstream_chat",
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
                    "unexpected streamed body for a chat call",
                ));
            }
        };
        let parsed: ChatCompletionResponse = serde_json::from_slice(&bytes).map_err(|err| {
            self.error(codes::PROTOCOL_ERROR, format!("decode response: {err}"))
        })?;
        Ok(ChatResponse::OpenAi(parsed))
    }

    async fn execute_streaming(
        &self,
        req: ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChunkStream, PipelineError> {
        let body = self.prepare(req, true)?;
        debug!(
            event = "upstream_chat_stream",
            execution_id = %ctx.execution_id,
            instance = %self.instance.id,
            model = %body.model
        );
        let response = self.send_with_recovery(&body, true).await?;
        let instance_id = self.instance.id.clone();
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        match response.body {
            UpstreamBody::Stream(mut upstream) => {
                tokio::spawn(async move {
                    let mut parser = SseParser::new();
                    while let Some(next) = upstream.recv().await {
                        let chunk = match next {
                            Ok(chunk) => chunk,
                            Err(message) => {
                                let err = PipelineError::new(
                                    codes::CONNECTION_FAILED,
                                    message,
                                    "provider_adapter",
                                )
                                .with_instance(instance_id.clone());
                                let _ = tx.send(Err(err)).await;
                                return;
                            }
                        };
                        for event in parser.push_bytes(&chunk) {
                            if event.is_done() {
                                return;
                            }
                            if let Some(frame) = decode_chunk(&event.data)
                                && tx.send(Ok(frame)).await.is_err()
                            {
                                // Consumer cancelled; dropping `upstream`
                                // closes the connection.
                                return;
                            }
                        }
                    }
                    for event in parser.finish() {
                        if event.is_done() {
                            break;
                        }
                        if let Some(frame) = decode_chunk(&event.data) {
                            let _ = tx.send(Ok(frame)).await;
                        }
                    }
                });
            }
            UpstreamBody::Bytes(bytes) => {
                // Upstream ignored stream=true; decode the buffered SSE body.
                tokio::spawn(async move {
                    let mut parser = SseParser::new();
                    let mut events = parser.push_bytes(&bytes);
                    events.extend(parser.finish());
                    for event in events {
                        if event.is_done() {
                            break;
                        }
                        if let Some(frame) = decode_chunk(&event.data)
                            && tx.send(Ok(frame)).await.is_err()
                        {
                            return;
                        }
                    }
                });
            }
        }
        Ok(rx)
    }
}

/// Unparseable payloads are dropped silently per the streaming contract.
fn decode_chunk(data: &str) -> Option<StreamFrame> {
    match serde_json::from_str::<ChatCompletionChunk>(data) {
        Ok(chunk) => Some(StreamFrame::OpenAi(chunk)),
        Err(err) => {
            warn!(event = "stream_chunk_skipped", error = %err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use llmux_auth::{
        AuthHandlerConfig, CredentialStore, RefreshError, TokenSet,
    };
    use llmux_common::now_epoch_ms;
    use llmux_protocol::openai::chat::{
        ChatMessage, ChatRole, FunctionDefinition, Tool, ToolType,
    };
    use llmux_transform::Dialect;

    use crate::instance::Capabilities;

    struct ScriptedClient {
        responses: Mutex<Vec<Result<(u16, String), UpstreamFailure>>>,
        requests: Mutex<Vec<UpstreamHttpRequest>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<(u16, &str), UpstreamFailure>>) -> Self {
            Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|entry| entry.map(|(status, body)| (status, body.to_string())))
                        .collect(),
                ),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl UpstreamClient for ScriptedClient {
        fn send<'a>(
            &'a self,
            req: UpstreamHttpRequest,
        ) -> Pin<
            Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>,
        > {
            self.requests.lock().unwrap().push(req);
            let next = self.responses.lock().unwrap().remove(0);
            Box::pin(async move {
                next.map(|(status, body)| UpstreamHttpResponse {
                    status,
                    headers: Vec::new(),
                    body: UpstreamBody::Bytes(Bytes::from(body)),
                })
            })
        }
    }

    struct StaticRefresher {
        outcome: Result<TokenSet, RefreshError>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl Refresher for StaticRefresher {
        async fn refresh(&self, _current: &TokenSet) -> Result<TokenSet, RefreshError> {
            *self.calls.lock().unwrap() += 1;
            self.outcome.clone()
        }
    }

    struct NoReauth;

    #[async_trait]
    impl Reauthenticator for NoReauth {
        async fn reauthenticate(&self) -> Result<TokenSet, String> {
            Err("no reauth in test".to_string())
        }
    }

    fn tokens(api_key: Option<&str>) -> TokenSet {
        TokenSet {
            access_token: "oauth-at".to_string(),
            refresh_token: "rt".to_string(),
            expiry_date: now_epoch_ms() + 3_600_000,
            token_type: None,
            scope: None,
            api_key: api_key.map(|key| key.to_string()),
        }
    }

    fn instance(dialect: Dialect) -> ProviderInstance {
        ProviderInstance {
            id: "qwen-main".to_string(),
            dialect,
            endpoint: "https://api.example.test/v1".to_string(),
            default_model: "qwen3-coder-plus".to_string(),
            supported_models: vec![],
            capabilities: Capabilities {
                streaming: true,
                tools: true,
                ..Capabilities::default()
            },
            auth_mode: AuthMode::OAuth,
        }
    }

    fn adapter(
        dialect: Dialect,
        handle: CredentialHandle,
        client: Arc<ScriptedClient>,
        refresher: Arc<StaticRefresher>,
    ) -> OpenAiCompatAdapter {
        let path = std::env::temp_dir().join(format!(
            "llmux-adapter-{}-{:p}.json",
            std::process::id(),
            Arc::as_ptr(&client)
        ));
        let auth = Arc::new(AuthHandler::new(
            CredentialStore::new(),
            path,
            handle,
            AuthHandlerConfig {
                auto_reauth: false,
                ..AuthHandlerConfig::default()
            },
        ));
        OpenAiCompatAdapter::new(
            instance(dialect),
            client,
            auth,
            refresher,
            Arc::new(NoReauth),
            AdapterConfig::default(),
        )
    }

    fn request(tools: bool) -> ChatRequest {
        ChatRequest::OpenAi(ChatCompletionRequest {
            model: "claude-router".to_string(),
            messages: vec![ChatMessage::text(ChatRole::User, "hello")],
            tools: tools.then(|| {
                vec![Tool {
                    r#type: ToolType::Function,
                    function: FunctionDefinition {
                        name: "lookup".to_string(),
                        description: None,
                        parameters: None,
                        strict: None,
                    },
                }]
            }),
            ..Default::default()
        })
    }

    const OK_BODY: &str = r#"{"id":"chatcmpl-1","object":"chat.completion","created":1,
        "model":"qwen3-coder-plus","choices":[{"index":0,
        "message":{"role":"assistant","content":"hi"},"finish_reason":"stop"}]}"#;

    #[tokio::test]
    async fn default_model_replaces_virtual_model() {
        let client = Arc::new(ScriptedClient::new(vec![Ok((200, OK_BODY))]));
        let refresher = Arc::new(StaticRefresher {
            outcome: Ok(tokens(None)),
            calls: Mutex::new(0),
        });
        let adapter = adapter(
            Dialect::Qwen,
            CredentialHandle::OAuth(tokens(None)),
            client.clone(),
            refresher,
        );
        adapter
            .execute(request(true), &CallContext::default())
            .await
            .unwrap();

        let sent = client.requests.lock().unwrap();
        let body: serde_json::Value = serde_json::from_slice(&sent[0].body).unwrap();
        assert_eq!(body["model"], "qwen3-coder-plus");
        assert_eq!(body["tools"][0]["function"]["strict"], false);
        assert_eq!(body["stream"], false);
    }

    #[tokio::test]
    async fn unauthorized_triggers_one_refresh_and_retry() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(UpstreamFailure::Http {
                status: 401,
                headers: Vec::new(),
                body: Bytes::from_static(b"token expired"),
            }),
            Ok((200, OK_BODY)),
        ]));
        let refresher = Arc::new(StaticRefresher {
            outcome: Ok(tokens(None)),
            calls: Mutex::new(0),
        });
        let adapter = adapter(
            Dialect::Qwen,
            CredentialHandle::OAuth(tokens(None)),
            client.clone(),
            refresher.clone(),
        );
        let response = adapter
            .execute(request(false), &CallContext::default())
            .await
            .unwrap();
        assert!(matches!(response, ChatResponse::OpenAi(_)));
        assert_eq!(*refresher.calls.lock().unwrap(), 1);
        assert_eq!(client.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn iflow_prefers_the_co_located_api_key() {
        let client = Arc::new(ScriptedClient::new(vec![Ok((200, OK_BODY))]));
        let refresher = Arc::new(StaticRefresher {
            outcome: Ok(tokens(Some("sk-iflow"))),
            calls: Mutex::new(0),
        });
        let adapter = adapter(
            Dialect::IFlow,
            CredentialHandle::OAuth(tokens(Some("sk-iflow"))),
            client.clone(),
            refresher,
        );
        adapter
            .execute(request(false), &CallContext::default())
            .await
            .unwrap();
        let sent = client.requests.lock().unwrap();
        let auth = sent[0]
            .headers
            .iter()
            .find(|(name, _)| name == "Authorization")
            .map(|(_, value)| value.clone())
            .unwrap();
        assert_eq!(auth, "Bearer sk-iflow");
    }

    #[tokio::test]
    async fn rate_limit_maps_to_rate_limit_code() {
        let client = Arc::new(ScriptedClient::new(vec![Err(UpstreamFailure::Http {
            status: 429,
            headers: Vec::new(),
            body: Bytes::from_static(b"slow down"),
        })]));
        let refresher = Arc::new(StaticRefresher {
            outcome: Ok(tokens(None)),
            calls: Mutex::new(0),
        });
        let adapter = adapter(
            Dialect::Qwen,
            CredentialHandle::OAuth(tokens(None)),
            client,
            refresher,
        );
        let err = adapter
            .execute(request(false), &CallContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::RATE_LIMIT_EXCEEDED);
        assert_eq!(err.instance_id.as_deref(), Some("qwen-main"));
    }

    #[tokio::test]
    async fn streaming_decodes_sse_and_stops_at_done() {
        let sse = "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"he\"},\"finish_reason\":null}]}\n\nnot json\n\ndata: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"y\"},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n";
        // Buffered SSE body: the adapter decodes it the same way it decodes
        // a live stream.
        let client = Arc::new(ScriptedClient::new(vec![Ok((200, sse))]));
        let refresher = Arc::new(StaticRefresher {
            outcome: Ok(tokens(None)),
            calls: Mutex::new(0),
        });
        let adapter = adapter(
            Dialect::Qwen,
            CredentialHandle::OAuth(tokens(None)),
            client,
            refresher,
        );
        let mut stream = adapter
            .execute_streaming(request(false), &CallContext::default())
            .await
            .unwrap();
        let mut contents = Vec::new();
        while let Some(frame) = stream.recv().await {
            if let StreamFrame::OpenAi(chunk) = frame.unwrap() {
                if let Some(text) = &chunk.choices[0].delta.content {
                    contents.push(text.clone());
                }
            }
        }
        assert_eq!(contents, vec!["he", "y"]);
    }
}
