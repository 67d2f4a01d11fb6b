use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use llmux_common::{ExecutionContext, PipelineError, codes};
use llmux_provider::{CallContext, ProviderAdapter};
use llmux_sched::{ActionKind, ErrorCenter, RouteDecision, RouteQuery, Scheduler};
use llmux_transform::compat::{MapDirection, MappingTable};
use llmux_transform::switch::{
    AnthropicEventsToOpenAiChunks, OpenAiChunkToAnthropicEvents,
};
use llmux_transform::{
    ChatRequest, ChatResponse, Dialect, StreamFrame, SwitchError, TransformerRegistry, WireFamily,
};

use crate::cancel::CancelToken;

const FRAME_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub execution_timeout: Duration,
    /// Short cooldown applied to an instance that blew the deadline.
    pub timeout_penalty: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(30),
            timeout_penalty: Duration::from_secs(5),
        }
    }
}

/// Field-level mapping tables for one instance's upstream quirks.
#[derive(Debug, Clone, Default)]
pub struct InstanceMappings {
    pub request: Option<MappingTable>,
    pub response: Option<MappingTable>,
}

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .insert(adapter.instance().id.clone(), adapter);
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(instance_id).cloned()
    }
}

pub enum PipelineOutcome {
    Complete(ChatResponse),
    Stream(mpsc::Receiver<Result<StreamFrame, PipelineError>>),
}

impl std::fmt::Debug for PipelineOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineOutcome::Complete(resp) => f.debug_tuple("Complete").field(resp).finish(),
            PipelineOutcome::Stream(_) => f.debug_tuple("Stream").field(&"<receiver>").finish(),
        }
    }
}

pub struct ExecutionResult {
    pub context: Option<ExecutionContext>,
    pub result: Result<PipelineOutcome, PipelineError>,
}

/// Composes protocol switch, streaming conformance, compatibility mapping
/// and provider IO for one request. Stateless per call; parallelism is
/// bounded above, not here.
pub struct PipelineExecutor {
    registry: TransformerRegistry,
    adapters: AdapterRegistry,
    mappings: HashMap<String, InstanceMappings>,
    scheduler: Arc<Scheduler>,
    center: Arc<ErrorCenter>,
    config: ExecutorConfig,
}

impl PipelineExecutor {
    pub fn new(
        registry: TransformerRegistry,
        adapters: AdapterRegistry,
        mappings: HashMap<String, InstanceMappings>,
        scheduler: Arc<Scheduler>,
        center: Arc<ErrorCenter>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            adapters,
            mappings,
            scheduler,
            center,
            config,
        }
    }

    /// Runs one request to completion, honoring retry/failover actions from
    /// the error center and the wall-clock deadline.
    pub async fn execute(
        &self,
        req: ChatRequest,
        client_dialect: Dialect,
        cancel: CancelToken,
    ) -> ExecutionResult {
        let deadline = Instant::now() + self.config.execution_timeout;
        let document = request_document(&req);
        let session_id = req.session_id().map(|session| session.to_string());
        let mut excluded: Vec<String> = Vec::new();
        let mut retry_count: u32 = 0;
        let mut last_error: Option<PipelineError> = None;
        let mut last_context: Option<ExecutionContext> = None;

        loop {
            let query = RouteQuery {
                document: document.clone(),
                session_id: session_id.clone(),
                excluded: excluded.clone(),
            };
            let decision = match self.scheduler.route(&query).await {
                Ok(decision) => decision,
                Err(route_err) => {
                    // A failover dead-end reports the failure that caused it.
                    let err = last_error.unwrap_or(route_err);
                    return ExecutionResult {
                        context: last_context,
                        result: Err(err),
                    };
                }
            };
            let composite = decision.entry.composite_id.clone();
            let instance_id = decision.entry.instance.id.clone();
            let mut ctx = decision.context.clone();
            ctx.retry_count = retry_count;

            self.scheduler.note_started(&composite).await;
            let attempt = self
                .attempt(req.clone(), client_dialect, &decision, &mut ctx, deadline, &cancel)
                .await;
            self.scheduler.note_finished(&composite).await;

            match attempt {
                Ok(outcome) => {
                    self.center.handle_execution_success(&composite).await;
                    info!(
                        event = "execution_complete",
                        execution_id = %ctx.execution_id,
                        instance = %instance_id,
                        retry_count
                    );
                    return ExecutionResult {
                        context: Some(ctx),
                        result: Ok(outcome),
                    };
                }
                Err(err) if err.code == codes::EXECUTION_CANCELLED => {
                    ctx.enter_stage("cancelled");
                    return ExecutionResult {
                        context: Some(ctx),
                        result: Err(err),
                    };
                }
                Err(err) if err.code == codes::EXECUTION_TIMEOUT => {
                    // Deadline is hard; apply the soft penalty and stop.
                    self.center
                        .blacklist(
                            &composite,
                            &instance_id,
                            err.clone(),
                            Some(self.config.timeout_penalty),
                            false,
                        )
                        .await;
                    return ExecutionResult {
                        context: Some(ctx),
                        result: Err(err),
                    };
                }
                Err(err) => {
                    let action = self.center.handle_error(&err, retry_count).await;
                    debug!(
                        event = "error_action",
                        execution_id = %ctx.execution_id,
                        code = %err.code,
                        action = action.kind.as_str()
                    );
                    match action.kind {
                        ActionKind::Retry if action.should_retry => {
                            retry_count += 1;
                            last_error = Some(err);
                            last_context = Some(ctx);
                            let delay =
                                Duration::from_millis(action.retry_delay_ms.unwrap_or(0));
                            if Instant::now() + delay >= deadline {
                                let err = PipelineError::new(
                                    codes::EXECUTION_TIMEOUT,
                                    "retry budget exceeds the request deadline",
                                    "executor",
                                )
                                .with_instance(instance_id);
                                return ExecutionResult {
                                    context: last_context,
                                    result: Err(err),
                                };
                            }
                            tokio::time::sleep(delay).await;
                        }
                        ActionKind::Retry | ActionKind::Failover => {
                            retry_count += 1;
                            excluded.push(composite);
                            last_error = Some(err);
                            last_context = Some(ctx);
                        }
                        ActionKind::BlacklistTemporary => {
                            self.center
                                .blacklist(&composite, &instance_id, err.clone(), None, false)
                                .await;
                            return ExecutionResult {
                                context: Some(ctx),
                                result: Err(err),
                            };
                        }
                        ActionKind::BlacklistPermanent => {
                            self.center
                                .blacklist(&composite, &instance_id, err.clone(), None, true)
                                .await;
                            return ExecutionResult {
                                context: Some(ctx),
                                result: Err(err),
                            };
                        }
                        ActionKind::Maintenance | ActionKind::Ignore => {
                            return ExecutionResult {
                                context: Some(ctx),
                                result: Err(err),
                            };
                        }
                    }
                }
            }
        }
    }

    /// One attempt against one instance: the forward stage chain, then the
    /// reverse chain on the response.
    async fn attempt(
        &self,
        req: ChatRequest,
        client_dialect: Dialect,
        decision: &RouteDecision,
        ctx: &mut ExecutionContext,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        let instance = &decision.entry.instance;
        let composite = &decision.entry.composite_id;
        let client_wants_stream = req.wants_stream();

        ctx.enter_stage("protocol_switch");
        let stage_started = Instant::now();
        let upstream_req = self
            .registry
            .convert_request(req, client_dialect, instance.dialect)
            .map_err(|err| switch_error(err, composite))?;
        ctx.record_timing("protocol_switch", stage_started.elapsed().as_millis() as u64);

        ctx.enter_stage("compat_mapping");
        let stage_started = Instant::now();
        let upstream_req = self.map_request(composite, upstream_req)?;
        ctx.record_timing("compat_mapping", stage_started.elapsed().as_millis() as u64);

        let adapter = self.adapters.get(&instance.id).ok_or_else(|| {
            PipelineError::new(
                codes::PIPELINE_INVALID_STATE,
                "no adapter registered for the selected instance",
                "executor",
            )
            .with_instance(instance.id.clone())
        })?;
        let call_ctx = CallContext {
            execution_id: ctx.execution_id.clone(),
            pipeline_id: Some(ctx.pipeline_id.clone()),
            attempt: ctx.retry_count,
        };

        ctx.enter_stage("provider");
        let upstream_streams = instance.capabilities.streaming;
        match (client_wants_stream, upstream_streams) {
            (true, true) => {
                let frames = self
                    .guarded(deadline, cancel.clone(), adapter.execute_streaming(upstream_req, &call_ctx))
                    .await??;
                ctx.enter_stage("streaming");
                Ok(PipelineOutcome::Stream(self.bridge_stream(
                    frames,
                    instance.dialect,
                    client_dialect,
                    cancel.clone(),
                )))
            }
            (true, false) => {
                // Upstream cannot stream: run the call, then replay the
                // response as client-dialect frames.
                let response = self
                    .guarded(deadline, cancel.clone(), adapter.execute(upstream_req, &call_ctx))
                    .await??;
                let response = self.finish_response(composite, client_dialect, instance.dialect, response, ctx)?;
                ctx.enter_stage("streaming");
                Ok(PipelineOutcome::Stream(synthesize_frames(response)))
            }
            (false, true) => {
                // Opportunistic conversion: consume the upstream stream and
                // fold it back into a complete response.
                let frames = self
                    .guarded(deadline, cancel.clone(), adapter.execute_streaming(upstream_req, &call_ctx))
                    .await??;
                let stage_started = Instant::now();
                let response = self
                    .guarded(
                        deadline,
                        cancel.clone(),
                        collect_frames(frames, instance.dialect),
                    )
                    .await?
                    .map_err(|err| err.with_instance(instance.id.clone()))?;
                ctx.record_timing("stream_collect", stage_started.elapsed().as_millis() as u64);
                let response = self.finish_response(composite, client_dialect, instance.dialect, response, ctx)?;
                Ok(PipelineOutcome::Complete(response))
            }
            (false, false) => {
                let response = self
                    .guarded(deadline, cancel.clone(), adapter.execute(upstream_req, &call_ctx))
                    .await??;
                let response = self.finish_response(composite, client_dialect, instance.dialect, response, ctx)?;
                Ok(PipelineOutcome::Complete(response))
            }
        }
    }

    /// Reverse chain: compatibility mapping, then dialect translation back
    /// to the client.
    fn finish_response(
        &self,
        composite: &str,
        client_dialect: Dialect,
        upstream_dialect: Dialect,
        response: ChatResponse,
        ctx: &mut ExecutionContext,
    ) -> Result<ChatResponse, PipelineError> {
        ctx.enter_stage("compat_mapping_response");
        let stage_started = Instant::now();
        let response = self.map_response(composite, response)?;
        ctx.record_timing(
            "compat_mapping_response",
            stage_started.elapsed().as_millis() as u64,
        );

        ctx.enter_stage("protocol_switch_response");
        let stage_started = Instant::now();
        let response = self
            .registry
            .convert_response(response, client_dialect, upstream_dialect)
            .map_err(|err| switch_error(err, composite))?;
        ctx.record_timing(
            "protocol_switch_response",
            stage_started.elapsed().as_millis() as u64,
        );
        Ok(response)
    }

    /// Wraps a pipeline future with the wall-clock deadline and the cancel
    /// token; dropping the inner future aborts any in-flight HTTP call.
    async fn guarded<T>(
        &self,
        deadline: Instant,
        mut cancel: CancelToken,
        fut: impl Future<Output = T>,
    ) -> Result<T, PipelineError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(PipelineError::new(
                codes::EXECUTION_TIMEOUT,
                "wall-clock deadline exceeded",
                "executor",
            ));
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::new(
                codes::EXECUTION_CANCELLED,
                "request cancelled by the client",
                "executor",
            )),
            outcome = tokio::time::timeout(remaining, fut) => outcome.map_err(|_| {
                PipelineError::new(
                    codes::EXECUTION_TIMEOUT,
                    "wall-clock deadline exceeded",
                    "executor",
                )
            }),
        }
    }

    /// Converts upstream frames to client-dialect frames through the stream
    /// state machines. Cancellation drops the upstream receiver, which
    /// closes the upstream connection.
    fn bridge_stream(
        &self,
        mut upstream: mpsc::Receiver<Result<StreamFrame, PipelineError>>,
        upstream_dialect: Dialect,
        client_dialect: Dialect,
        mut cancel: CancelToken,
    ) -> mpsc::Receiver<Result<StreamFrame, PipelineError>> {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let upstream_family = upstream_dialect.family();
        let client_family = client_dialect.family();

        tokio::spawn(async move {
            let mut to_anthropic = OpenAiChunkToAnthropicEvents::new();
            let mut to_openai = AnthropicEventsToOpenAiChunks::new();
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!(event = "stream_cancelled");
                        return;
                    }
                    next = upstream.recv() => next,
                };
                let Some(next) = next else {
                    // Upstream closed without a terminal marker; flush any
                    // synthetic tail the converter owes the client.
                    if upstream_family == WireFamily::OpenAi
                        && client_family == WireFamily::Anthropic
                    {
                        for event in to_anthropic.finish() {
                            if tx.send(Ok(StreamFrame::Anthropic(event))).await.is_err() {
                                return;
                            }
                        }
                    }
                    return;
                };
                let frame = match next {
                    Ok(frame) => frame,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                };
                let converted: Vec<StreamFrame> = match (frame, client_family) {
                    (StreamFrame::OpenAi(chunk), WireFamily::Anthropic) => to_anthropic
                        .push_chunk(chunk)
                        .into_iter()
                        .map(StreamFrame::Anthropic)
                        .collect(),
                    (StreamFrame::Anthropic(event), WireFamily::OpenAi) => to_openai
                        .push_event(event)
                        .into_iter()
                        .map(StreamFrame::OpenAi)
                        .collect(),
                    (frame, _) => vec![frame],
                };
                for frame in converted {
                    if tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
            }
        });
        rx
    }

    fn map_request(&self, composite: &str, req: ChatRequest) -> Result<ChatRequest, PipelineError> {
        let Some(table) = self
            .mappings
            .get(composite)
            .and_then(|mappings| mappings.request.as_ref())
        else {
            return Ok(req);
        };
        match req {
            ChatRequest::OpenAi(inner) => Ok(ChatRequest::OpenAi(apply_table(table, &inner)?)),
            ChatRequest::Anthropic(inner) => {
                Ok(ChatRequest::Anthropic(apply_table(table, &inner)?))
            }
        }
    }

    fn map_response(
        &self,
        composite: &str,
        resp: ChatResponse,
    ) -> Result<ChatResponse, PipelineError> {
        let Some(table) = self
            .mappings
            .get(composite)
            .and_then(|mappings| mappings.response.as_ref())
        else {
            return Ok(resp);
        };
        match resp {
            ChatResponse::OpenAi(inner) => Ok(ChatResponse::OpenAi(apply_table(table, &inner)?)),
            ChatResponse::Anthropic(inner) => {
                Ok(ChatResponse::Anthropic(apply_table(table, &inner)?))
            }
        }
    }
}

/// Serializes, maps, and deserializes one payload through a mapping table.
fn apply_table<T>(table: &MappingTable, payload: &T) -> Result<T, PipelineError>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let value = serde_json::to_value(payload).map_err(|err| {
        PipelineError::new(codes::DATA_INVALID_FORMAT, err.to_string(), "compat_mapper")
    })?;
    let mapped = table.apply(&value, MapDirection::Forward).map_err(|err| {
        PipelineError::new(codes::DATA_VALIDATION_FAILED, err.to_string(), "compat_mapper")
    })?;
    serde_json::from_value(mapped).map_err(|err| {
        PipelineError::new(codes::DATA_VALIDATION_FAILED, err.to_string(), "compat_mapper")
    })
}

fn switch_error(err: SwitchError, composite: &str) -> PipelineError {
    let code = match &err {
        SwitchError::InvalidInput(_) => codes::DATA_VALIDATION_FAILED,
        SwitchError::DialectMismatch => codes::DATA_INVALID_FORMAT,
        SwitchError::NoTransformer { .. } => codes::PROTOCOL_ERROR,
    };
    PipelineError::new(code, err.to_string(), "protocol_switch").with_pipeline(composite)
}

/// Document the rule engine indexes into: `payload.*` paths.
fn request_document(req: &ChatRequest) -> serde_json::Value {
    let payload = match req {
        ChatRequest::Anthropic(inner) => serde_json::to_value(inner).unwrap_or_default(),
        ChatRequest::OpenAi(inner) => serde_json::to_value(inner).unwrap_or_default(),
    };
    serde_json::json!({ "payload": payload })
}

/// Stream-to-non-stream: folds upstream frames into a complete response in
/// the upstream's own dialect.
async fn collect_frames(
    mut frames: mpsc::Receiver<Result<StreamFrame, PipelineError>>,
    upstream_dialect: Dialect,
) -> Result<ChatResponse, PipelineError> {
    match upstream_dialect.family() {
        WireFamily::OpenAi => {
            let mut collector = llmux_transform::stream2nostream::OpenAiStreamCollector::new();
            while let Some(frame) = frames.recv().await {
                match frame? {
                    StreamFrame::OpenAi(chunk) => collector.push_chunk(chunk),
                    StreamFrame::Anthropic(_) => {
                        return Err(PipelineError::new(
                            codes::PROTOCOL_ERROR,
                            "anthropic frame on an openai stream",
                            "stream_adapter",
                        ));
                    }
                }
            }
            Ok(ChatResponse::OpenAi(collector.finish()))
        }
        WireFamily::Anthropic => {
            let mut collector = llmux_transform::stream2nostream::AnthropicStreamCollector::new();
            while let Some(frame) = frames.recv().await {
                match frame? {
                    StreamFrame::Anthropic(event) => collector.push_event(event),
                    StreamFrame::OpenAi(_) => {
                        return Err(PipelineError::new(
                            codes::PROTOCOL_ERROR,
                            "openai frame on an anthropic stream",
                            "stream_adapter",
                        ));
                    }
                }
            }
            Ok(ChatResponse::Anthropic(collector.finish()))
        }
    }
}

/// Non-stream-to-stream: replays a complete client-dialect response as the
/// frames a streaming client expects.
fn synthesize_frames(
    response: ChatResponse,
) -> mpsc::Receiver<Result<StreamFrame, PipelineError>> {
    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        match response {
            ChatResponse::OpenAi(resp) => {
                use llmux_protocol::openai::stream::{
                    ChatCompletionChunk, ChunkChoice, ChunkDelta,
                };
                let choices: Vec<ChunkChoice> = resp
                    .choices
                    .iter()
                    .map(|choice| ChunkChoice {
                        index: choice.index,
                        delta: ChunkDelta {
                            role: Some(choice.message.role),
                            content: choice.message.content.clone(),
                            tool_calls: None,
                        },
                        finish_reason: None,
                    })
                    .collect();
                let content = ChatCompletionChunk {
                    id: resp.id.clone(),
                    object: "chat.completion.chunk".to_string(),
                    created: resp.created,
                    model: resp.model.clone(),
                    choices,
                    usage: None,
                };
                if tx.send(Ok(StreamFrame::OpenAi(content))).await.is_err() {
                    return;
                }
                let finish = ChatCompletionChunk {
                    id: resp.id.clone(),
                    object: "chat.completion.chunk".to_string(),
                    created: resp.created,
                    model: resp.model.clone(),
                    choices: resp
                        .choices
                        .iter()
                        .map(|choice| ChunkChoice {
                            index: choice.index,
                            delta: ChunkDelta::default(),
                            finish_reason: choice.finish_reason,
                        })
                        .collect(),
                    usage: resp.usage.clone(),
                };
                let _ = tx.send(Ok(StreamFrame::OpenAi(finish))).await;
            }
            ChatResponse::Anthropic(resp) => {
                use llmux_protocol::anthropic::messages::ContentBlock;
                use llmux_protocol::anthropic::stream::{
                    ContentDelta, MessageDelta, StreamContentBlock, StreamEvent, StreamMessage,
                };
                let start = StreamEvent::MessageStart {
                    message: StreamMessage {
                        id: resp.id.clone(),
                        r#type: "message".to_string(),
                        role: resp.role,
                        content: Vec::new(),
                        model: resp.model.clone(),
                        stop_reason: None,
                        usage: Default::default(),
                    },
                };
                if tx.send(Ok(StreamFrame::Anthropic(start))).await.is_err() {
                    return;
                }
                for (index, block) in resp.content.iter().enumerate() {
                    let index = index as i64;
                    let events = match block {
                        ContentBlock::Text { text } => vec![
                            StreamEvent::ContentBlockStart {
                                index,
                                content_block: StreamContentBlock::Text {
                                    text: String::new(),
                                },
                            },
                            StreamEvent::ContentBlockDelta {
                                index,
                                delta: ContentDelta::TextDelta { text: text.clone() },
                            },
                            StreamEvent::ContentBlockStop { index },
                        ],
                        ContentBlock::ToolUse { id, name, input } => vec![
                            StreamEvent::ContentBlockStart {
                                index,
                                content_block: StreamContentBlock::ToolUse {
                                    id: id.clone(),
                                    name: name.clone(),
                                    input: serde_json::Value::Object(Default::default()),
                                },
                            },
                            StreamEvent::ContentBlockDelta {
                                index,
                                delta: ContentDelta::InputJsonDelta {
                                    partial_json: input.to_string(),
                                },
                            },
                            StreamEvent::ContentBlockStop { index },
                        ],
                        ContentBlock::ToolResult { .. } => Vec::new(),
                    };
                    for event in events {
                        if tx.send(Ok(StreamFrame::Anthropic(event))).await.is_err() {
                            return;
                        }
                    }
                }
                let delta = StreamEvent::MessageDelta {
                    delta: MessageDelta {
                        stop_reason: resp.stop_reason,
                        stop_sequence: resp.stop_sequence.clone(),
                    },
                    usage: Some(resp.usage.clone()),
                };
                if tx.send(Ok(StreamFrame::Anthropic(delta))).await.is_err() {
                    return;
                }
                let _ = tx
                    .send(Ok(StreamFrame::Anthropic(StreamEvent::MessageStop)))
                    .await;
            }
        }
    });
    rx
}
