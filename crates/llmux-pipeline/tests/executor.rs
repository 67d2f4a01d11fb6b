use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use llmux_common::{PipelineError, codes};
use llmux_pipeline::{
    AdapterRegistry, ExecutorConfig, PipelineExecutor, PipelineOutcome, cancel_pair,
};
use llmux_protocol::anthropic::messages::{
    ContentBlock, CreateMessageRequest, InputMessage, MessageContent, MessageRole,
};
use llmux_protocol::openai::chat::{
    ChatChoice, ChatCompletionResponse, ChatMessage, ChatRole, FinishReason, Usage,
};
use llmux_protocol::openai::stream::{ChatCompletionChunk, ChunkChoice, ChunkDelta};
use llmux_provider::{
    AuthMode, CallContext, Capabilities, ChunkStream, ProviderAdapter, ProviderInstance,
};
use llmux_sched::{
    ConditionOperator, DedupCoordinator, ErrorCenter, ErrorCenterConfig, EventHub, LogicalOperator,
    PoolEntry, RetryPolicy, RoutingRule, RuleCondition, RuleTarget, Scheduler,
    SchedulerGeneration, StrategyKind,
};
use llmux_transform::{ChatRequest, ChatResponse, Dialect, StreamFrame, TransformerRegistry};

#[derive(Clone)]
enum Behavior {
    Respond(&'static str),
    Fail(&'static str),
    Hang(Duration),
    StreamText(Vec<&'static str>, Duration),
}

struct FakeAdapter {
    instance: ProviderInstance,
    behaviors: Mutex<VecDeque<Behavior>>,
}

impl FakeAdapter {
    fn new(instance: ProviderInstance, behaviors: Vec<Behavior>) -> Self {
        Self {
            instance,
            behaviors: Mutex::new(behaviors.into()),
        }
    }

    fn next(&self) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Behavior::Respond("default"))
    }

    fn response(&self, content: &str) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: "chatcmpl-1".to_string(),
            object: "chat.completion".to_string(),
            created: 1,
            model: self.instance.default_model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::text(ChatRole::Assistant, content),
                finish_reason: Some(FinishReason::Stop),
            }],
            usage: Some(Usage {
                prompt_tokens: 3,
                completion_tokens: 2,
                total_tokens: 5,
            }),
        }
    }
}

#[async_trait]
impl ProviderAdapter for FakeAdapter {
    fn instance(&self) -> &ProviderInstance {
        &self.instance
    }

    async fn execute(
        &self,
        _req: ChatRequest,
        _ctx: &CallContext,
    ) -> Result<ChatResponse, PipelineError> {
        match self.next() {
            Behavior::Respond(content) => Ok(ChatResponse::OpenAi(self.response(content))),
            Behavior::Fail(code) => Err(PipelineError::new(code, "scripted failure", "fake")
                .with_instance(self.instance.id.clone())),
            Behavior::Hang(delay) => {
                tokio::time::sleep(delay).await;
                Ok(ChatResponse::OpenAi(self.response("late")))
            }
            Behavior::StreamText(parts, _) => {
                Ok(ChatResponse::OpenAi(self.response(&parts.join(""))))
            }
        }
    }

    async fn execute_streaming(
        &self,
        _req: ChatRequest,
        _ctx: &CallContext,
    ) -> Result<ChunkStream, PipelineError> {
        match self.next() {
            Behavior::StreamText(parts, gap) => {
                let model = self.instance.default_model.clone();
                let (tx, rx) = tokio::sync::mpsc::channel(4);
                tokio::spawn(async move {
                    let total = parts.len();
                    for (index, part) in parts.into_iter().enumerate() {
                        tokio::time::sleep(gap).await;
                        let chunk = ChatCompletionChunk {
                            id: "chatcmpl-1".to_string(),
                            object: "chat.completion.chunk".to_string(),
                            created: 1,
                            model: model.clone(),
                            choices: vec![ChunkChoice {
                                index: 0,
                                delta: ChunkDelta {
                                    role: None,
                                    content: Some(part.to_string()),
                                    tool_calls: None,
                                },
                                finish_reason: (index + 1 == total)
                                    .then_some(FinishReason::Stop),
                            }],
                            usage: None,
                        };
                        if tx.send(Ok(StreamFrame::OpenAi(chunk))).await.is_err() {
                            return;
                        }
                    }
                });
                Ok(rx)
            }
            Behavior::Fail(code) => Err(PipelineError::new(code, "scripted failure", "fake")
                .with_instance(self.instance.id.clone())),
            _ => Err(PipelineError::new(
                codes::EXECUTION_FAILED,
                "streaming not scripted",
                "fake",
            )),
        }
    }
}

fn instance(id: &str, streaming: bool) -> ProviderInstance {
    ProviderInstance {
        id: id.to_string(),
        dialect: Dialect::Qwen,
        endpoint: "https://api.example.test/v1".to_string(),
        default_model: "qwen3-coder-plus".to_string(),
        supported_models: vec![],
        capabilities: Capabilities {
            streaming,
            tools: true,
            ..Capabilities::default()
        },
        auth_mode: AuthMode::OAuth,
    }
}

fn rule(targets: &[&str]) -> RoutingRule {
    RoutingRule {
        id: "claude-route".to_string(),
        priority: 100,
        enabled: true,
        conditions: vec![RuleCondition {
            field: "payload.model".to_string(),
            operator: ConditionOperator::Equals,
            value: serde_json::json!("claude-router"),
            logical_operator: LogicalOperator::And,
            custom_name: None,
        }],
        strategy: StrategyKind::Fixed,
        targets: targets
            .iter()
            .map(|id| RuleTarget {
                composite_id: format!("{id}.qwen3-coder-plus"),
                weight: None,
                fallback: false,
            })
            .collect(),
        session_ttl_secs: None,
    }
}

struct Harness {
    executor: PipelineExecutor,
    coordinator: Arc<DedupCoordinator>,
}

async fn harness(
    adapters: Vec<FakeAdapter>,
    config: ExecutorConfig,
    retry: Option<RetryPolicy>,
) -> Harness {
    let coordinator = Arc::new(DedupCoordinator::new(EventHub::new(64)));
    let mut registry = AdapterRegistry::new();
    let mut target_ids = Vec::new();
    for adapter in adapters {
        let entry = PoolEntry::new(adapter.instance.clone(), "qwen3-coder-plus");
        coordinator.add_to_pool(entry).await;
        target_ids.push(adapter.instance.id.clone());
        registry.register(Arc::new(adapter));
    }
    let scheduler = Arc::new(Scheduler::new(coordinator.clone()));
    let ids: Vec<&str> = target_ids.iter().map(|id| id.as_str()).collect();
    scheduler.install(SchedulerGeneration {
        rules: vec![rule(&ids)],
    });
    let center_config = ErrorCenterConfig {
        retry: retry.unwrap_or(RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            multiplier: 1.0,
            max_delay_ms: 5,
            jitter: false,
        }),
        ..ErrorCenterConfig::default()
    };
    let center = Arc::new(ErrorCenter::new(center_config, coordinator.clone()));
    let executor = PipelineExecutor::new(
        TransformerRegistry::with_builtins(),
        registry,
        HashMap::new(),
        scheduler,
        center,
        config,
    );
    Harness {
        executor,
        coordinator,
    }
}

fn anthropic_request(stream: bool) -> ChatRequest {
    ChatRequest::Anthropic(CreateMessageRequest {
        model: "claude-router".to_string(),
        messages: vec![InputMessage {
            role: MessageRole::User,
            content: MessageContent::Text("hello".to_string()),
        }],
        max_tokens: 16,
        system: None,
        temperature: Some(0.0),
        top_p: None,
        stop_sequences: None,
        stream: Some(stream),
        tools: None,
        metadata: None,
    })
}

fn detached() -> llmux_pipeline::CancelToken {
    llmux_pipeline::CancelToken::detached()
}

#[tokio::test]
async fn anthropic_request_round_trips_through_an_openai_upstream() {
    let harness = harness(
        vec![FakeAdapter::new(
            instance("qwen-main", false),
            vec![Behavior::Respond("hello back")],
        )],
        ExecutorConfig::default(),
        None,
    )
    .await;

    let result = harness
        .executor
        .execute(anthropic_request(false), Dialect::Anthropic, detached())
        .await;
    let ctx = result.context.unwrap();
    let outcome = result.result.unwrap();
    let PipelineOutcome::Complete(ChatResponse::Anthropic(resp)) = outcome else {
        panic!("expected a complete anthropic response");
    };
    assert!(matches!(&resp.content[0], ContentBlock::Text { text } if text == "hello back"));
    assert_eq!(
        resp.stop_reason,
        Some(llmux_protocol::anthropic::messages::StopReason::EndTurn)
    );
    assert_eq!(resp.usage.input_tokens, 3);
    assert_eq!(ctx.retry_count, 0);
    let stages: Vec<&str> = ctx.timings.iter().map(|(stage, _)| stage.as_str()).collect();
    assert!(stages.contains(&"protocol_switch"));
    assert!(stages.contains(&"protocol_switch_response"));
}

#[tokio::test]
async fn network_errors_retry_on_the_same_instance() {
    let harness = harness(
        vec![FakeAdapter::new(
            instance("qwen-main", false),
            vec![
                Behavior::Fail(codes::CONNECTION_FAILED),
                Behavior::Respond("recovered"),
            ],
        )],
        ExecutorConfig::default(),
        None,
    )
    .await;

    let result = harness
        .executor
        .execute(anthropic_request(false), Dialect::Anthropic, detached())
        .await;
    let ctx = result.context.unwrap();
    assert!(result.result.is_ok());
    assert_eq!(ctx.retry_count, 1);
}

#[tokio::test]
async fn system_errors_fail_over_to_the_next_instance() {
    let harness = harness(
        vec![
            FakeAdapter::new(
                instance("primary", false),
                vec![Behavior::Fail(codes::INTERNAL_ERROR)],
            ),
            FakeAdapter::new(instance("secondary", false), vec![Behavior::Respond("ok")]),
        ],
        ExecutorConfig::default(),
        None,
    )
    .await;

    let result = harness
        .executor
        .execute(anthropic_request(false), Dialect::Anthropic, detached())
        .await;
    let ctx = result.context.unwrap();
    assert!(result.result.is_ok());
    assert_eq!(ctx.instance_id, "secondary");
}

#[tokio::test]
async fn auth_failures_blacklist_the_instance() {
    let harness = harness(
        vec![FakeAdapter::new(
            instance("qwen-main", false),
            vec![Behavior::Fail(codes::TOKEN_EXPIRED)],
        )],
        ExecutorConfig::default(),
        None,
    )
    .await;

    let result = harness
        .executor
        .execute(anthropic_request(false), Dialect::Anthropic, detached())
        .await;
    let err = result.result.unwrap_err();
    assert_eq!(err.code, codes::TOKEN_EXPIRED);
    assert_eq!(err.http_status(), 401);
    assert!(
        harness
            .coordinator
            .is_blacklisted("qwen-main.qwen3-coder-plus")
            .await
    );
    // Dedup invariant: the blacklisted id left the pool.
    let check = harness
        .coordinator
        .check_duplicates("qwen-main.qwen3-coder-plus")
        .await;
    assert!(check.in_blacklist && !check.in_pool);
}

#[tokio::test]
async fn deadline_exceeded_returns_timeout_and_penalizes() {
    let harness = harness(
        vec![FakeAdapter::new(
            instance("qwen-main", false),
            vec![Behavior::Hang(Duration::from_millis(500))],
        )],
        ExecutorConfig {
            execution_timeout: Duration::from_millis(50),
            timeout_penalty: Duration::from_secs(10),
        },
        None,
    )
    .await;

    let result = harness
        .executor
        .execute(anthropic_request(false), Dialect::Anthropic, detached())
        .await;
    let err = result.result.unwrap_err();
    assert_eq!(err.code, codes::EXECUTION_TIMEOUT);
    assert_eq!(err.http_status(), 504);
    assert!(
        harness
            .coordinator
            .is_blacklisted("qwen-main.qwen3-coder-plus")
            .await
    );
}

#[tokio::test]
async fn exhausted_rule_returns_no_available_pipelines() {
    let harness = harness(
        vec![FakeAdapter::new(instance("qwen-main", false), vec![])],
        ExecutorConfig::default(),
        None,
    )
    .await;
    harness
        .coordinator
        .add_to_blacklist(
            "qwen-main.qwen3-coder-plus",
            "qwen-main",
            PipelineError::new(codes::AUTHENTICATION_FAILED, "down", "test"),
            None,
            true,
        )
        .await;

    let result = harness
        .executor
        .execute(anthropic_request(false), Dialect::Anthropic, detached())
        .await;
    let err = result.result.unwrap_err();
    assert_eq!(err.code, codes::NO_AVAILABLE_PIPELINES);
    assert_eq!(err.http_status(), 503);
}

#[tokio::test]
async fn streaming_bridge_translates_chunks_to_anthropic_events() {
    let harness = harness(
        vec![FakeAdapter::new(
            instance("qwen-main", true),
            vec![Behavior::StreamText(
                vec!["hel", "lo"],
                Duration::from_millis(5),
            )],
        )],
        ExecutorConfig::default(),
        None,
    )
    .await;

    let result = harness
        .executor
        .execute(anthropic_request(true), Dialect::Anthropic, detached())
        .await;
    let PipelineOutcome::Stream(mut frames) = result.result.unwrap() else {
        panic!("expected a stream outcome");
    };
    let mut names = Vec::new();
    let mut text = String::new();
    while let Some(frame) = frames.recv().await {
        if let StreamFrame::Anthropic(event) = frame.unwrap() {
            names.push(event.event_name().to_string());
            if let llmux_protocol::anthropic::stream::StreamEvent::ContentBlockDelta {
                delta:
                    llmux_protocol::anthropic::stream::ContentDelta::TextDelta { text: part },
                ..
            } = event
            {
                text.push_str(&part);
            }
        }
    }
    assert_eq!(text, "hello");
    assert_eq!(names.first().map(String::as_str), Some("message_start"));
    assert_eq!(names.last().map(String::as_str), Some("message_stop"));
}

#[tokio::test]
async fn cancelling_a_stream_stops_chunks_promptly() {
    let harness = harness(
        vec![FakeAdapter::new(
            instance("qwen-main", true),
            vec![Behavior::StreamText(
                vec!["a"; 50],
                Duration::from_millis(20),
            )],
        )],
        ExecutorConfig::default(),
        None,
    )
    .await;

    let (handle, token) = cancel_pair();
    let result = harness
        .executor
        .execute(anthropic_request(true), Dialect::Anthropic, token)
        .await;
    let PipelineOutcome::Stream(mut frames) = result.result.unwrap() else {
        panic!("expected a stream outcome");
    };
    // Consume a couple of frames, then cancel.
    let _ = frames.recv().await;
    let _ = frames.recv().await;
    handle.cancel();

    let drained = tokio::time::timeout(Duration::from_millis(200), async {
        while frames.recv().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok(), "stream must close promptly after cancel");
}

#[tokio::test]
async fn non_streaming_client_over_streaming_upstream_gets_a_complete_response() {
    let harness = harness(
        vec![FakeAdapter::new(
            instance("qwen-main", true),
            vec![Behavior::StreamText(
                vec!["str", "eam", "ed"],
                Duration::from_millis(2),
            )],
        )],
        ExecutorConfig::default(),
        None,
    )
    .await;

    let result = harness
        .executor
        .execute(anthropic_request(false), Dialect::Anthropic, detached())
        .await;
    let PipelineOutcome::Complete(ChatResponse::Anthropic(resp)) = result.result.unwrap() else {
        panic!("expected a complete response");
    };
    assert!(matches!(&resp.content[0], ContentBlock::Text { text } if text == "streamed"));
}

#[tokio::test]
async fn streaming_client_over_non_streaming_upstream_gets_synthesized_frames() {
    let harness = harness(
        vec![FakeAdapter::new(
            instance("qwen-main", false),
            vec![Behavior::Respond("whole response")],
        )],
        ExecutorConfig::default(),
        None,
    )
    .await;

    let result = harness
        .executor
        .execute(anthropic_request(true), Dialect::Anthropic, detached())
        .await;
    let PipelineOutcome::Stream(mut frames) = result.result.unwrap() else {
        panic!("expected a stream outcome");
    };
    let mut text = String::new();
    let mut saw_stop = false;
    while let Some(frame) = frames.recv().await {
        if let StreamFrame::Anthropic(event) = frame.unwrap() {
            match event {
                llmux_protocol::anthropic::stream::StreamEvent::ContentBlockDelta {
                    delta:
                        llmux_protocol::anthropic::stream::ContentDelta::TextDelta { text: part },
                    ..
                } => text.push_str(&part),
                llmux_protocol::anthropic::stream::StreamEvent::MessageStop => saw_stop = true,
                _ => {}
            }
        }
    }
    assert_eq!(text, "whole response");
    assert!(saw_stop);
}
