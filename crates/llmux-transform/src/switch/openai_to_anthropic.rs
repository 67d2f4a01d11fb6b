use serde_json::Value;

use llmux_protocol::anthropic::messages::{
    ContentBlock, CreateMessageRequest, CreateMessageResponse, InputMessage, MessageContent,
    MessageRole, StopReason, ToolDefinition,
};
use llmux_protocol::anthropic::stream::{ContentDelta, StreamEvent};
use llmux_protocol::openai::chat::{
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatRole,
    FinishReason, Usage,
};
use llmux_protocol::openai::stream::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, FunctionCallChunk, ToolCallChunk,
};

use super::{ChatRequest, ChatResponse, ProtocolTransformer, SwitchError, WireFamily};

/// When an OpenAI request carries no max_tokens, the Anthropic dialect still
/// requires one.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// OpenAI client dialect over an Anthropic upstream.
pub(super) struct OpenAiToAnthropic;

impl ProtocolTransformer for OpenAiToAnthropic {
    fn name(&self) -> &'static str {
        "openai_to_anthropic"
    }

    fn priority(&self) -> u32 {
        100
    }

    fn source(&self) -> WireFamily {
        WireFamily::OpenAi
    }

    fn target(&self) -> WireFamily {
        WireFamily::Anthropic
    }

    fn validate_input(&self, req: &ChatRequest) -> Result<(), SwitchError> {
        let ChatRequest::OpenAi(req) = req else {
            return Err(SwitchError::DialectMismatch);
        };
        if req.model.is_empty() {
            return Err(SwitchError::InvalidInput("model must not be empty".into()));
        }
        if req.messages.is_empty() {
            return Err(SwitchError::InvalidInput(
                "messages must not be empty".into(),
            ));
        }
        Ok(())
    }

    fn convert_request(&self, req: ChatRequest) -> Result<ChatRequest, SwitchError> {
        let ChatRequest::OpenAi(req) = req else {
            return Err(SwitchError::DialectMismatch);
        };
        Ok(ChatRequest::Anthropic(request_to_anthropic(req)))
    }

    fn convert_response(&self, resp: ChatResponse) -> Result<ChatResponse, SwitchError> {
        let ChatResponse::Anthropic(resp) = resp else {
            return Err(SwitchError::DialectMismatch);
        };
        Ok(ChatResponse::OpenAi(response_to_openai(resp)))
    }
}

pub(super) fn request_to_anthropic(req: ChatCompletionRequest) -> CreateMessageRequest {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<InputMessage> = Vec::new();

    for message in req.messages {
        match message.role {
            ChatRole::System => {
                if let Some(content) = message.content {
                    system_parts.push(content);
                }
            }
            ChatRole::Tool => {
                messages.push(InputMessage {
                    role: MessageRole::User,
                    content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id: message.tool_call_id.unwrap_or_default(),
                        content: message.content.map(Value::String),
                        is_error: None,
                    }]),
                });
            }
            ChatRole::User => {
                messages.push(InputMessage {
                    role: MessageRole::User,
                    content: MessageContent::Text(message.content.unwrap_or_default()),
                });
            }
            ChatRole::Assistant => {
                messages.push(assistant_to_anthropic(message));
            }
        }
    }

    let tools = req.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| ToolDefinition {
                name: tool.function.name,
                description: tool.function.description,
                input_schema: tool.function.parameters.unwrap_or(Value::Null),
            })
            .collect()
    });

    CreateMessageRequest {
        model: req.model,
        messages,
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n"))
        },
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: req.stop,
        stream: req.stream,
        tools,
        metadata: None,
    }
}

fn assistant_to_anthropic(message: ChatMessage) -> InputMessage {
    let mut blocks = Vec::new();
    if let Some(text) = message.content
        && !text.is_empty()
    {
        blocks.push(ContentBlock::Text { text });
    }
    if let Some(tool_calls) = message.tool_calls {
        for call in tool_calls {
            blocks.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input: serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::String(call.function.arguments)),
            });
        }
    }
    let content = if blocks.len() == 1 {
        match blocks.remove(0) {
            ContentBlock::Text { text } => MessageContent::Text(text),
            other => MessageContent::Blocks(vec![other]),
        }
    } else {
        MessageContent::Blocks(blocks)
    };
    InputMessage {
        role: MessageRole::Assistant,
        content,
    }
}

pub(super) fn response_to_openai(resp: CreateMessageResponse) -> ChatCompletionResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in resp.content {
        match block {
            ContentBlock::Text { text: part } => text.push_str(&part),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(llmux_protocol::openai::chat::ToolCall {
                    id,
                    r#type: llmux_protocol::openai::chat::ToolType::Function,
                    function: llmux_protocol::openai::chat::FunctionCall {
                        name,
                        arguments: input.to_string(),
                    },
                });
            }
            ContentBlock::ToolResult { .. } => {}
        }
    }

    ChatCompletionResponse {
        id: resp.id,
        object: "chat.completion".to_string(),
        created: 0,
        model: resp.model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: ChatRole::Assistant,
                content: if text.is_empty() { None } else { Some(text) },
                name: None,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
            },
            finish_reason: resp.stop_reason.map(stop_to_finish),
        }],
        usage: Some(Usage {
            prompt_tokens: resp.usage.input_tokens,
            completion_tokens: resp.usage.output_tokens,
            total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
        }),
    }
}

pub(super) fn stop_to_finish(reason: StopReason) -> FinishReason {
    match reason {
        StopReason::EndTurn => FinishReason::Stop,
        StopReason::MaxTokens => FinishReason::Length,
        StopReason::StopSequence => FinishReason::Stop,
        StopReason::ToolUse => FinishReason::ToolCalls,
    }
}

/// Replays Anthropic stream events as OpenAI chat-completion chunks.
#[derive(Debug, Default)]
pub struct AnthropicEventsToOpenAiChunks {
    id: String,
    model: String,
    tool_index: i64,
    in_tool_block: bool,
}

impl AnthropicEventsToOpenAiChunks {
    pub fn new() -> Self {
        Self {
            id: "chatcmpl".to_string(),
            model: String::new(),
            tool_index: -1,
            in_tool_block: false,
        }
    }

    pub fn push_event(&mut self, event: StreamEvent) -> Option<ChatCompletionChunk> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                Some(self.chunk(
                    ChunkDelta {
                        role: Some(ChatRole::Assistant),
                        content: None,
                        tool_calls: None,
                    },
                    None,
                ))
            }
            StreamEvent::ContentBlockStart {
                content_block, ..
            } => match content_block {
                llmux_protocol::anthropic::stream::StreamContentBlock::ToolUse {
                    id,
                    name,
                    ..
                } => {
                    self.tool_index += 1;
                    self.in_tool_block = true;
                    Some(self.chunk(
                        ChunkDelta {
                            role: None,
                            content: None,
                            tool_calls: Some(vec![ToolCallChunk {
                                index: self.tool_index,
                                id: Some(id),
                                r#type: Some(llmux_protocol::openai::chat::ToolType::Function),
                                function: Some(FunctionCallChunk {
                                    name: Some(name),
                                    arguments: None,
                                }),
                            }]),
                        },
                        None,
                    ))
                }
                llmux_protocol::anthropic::stream::StreamContentBlock::Text { .. } => {
                    self.in_tool_block = false;
                    None
                }
            },
            StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                ContentDelta::TextDelta { text } => Some(self.chunk(
                    ChunkDelta {
                        role: None,
                        content: Some(text),
                        tool_calls: None,
                    },
                    None,
                )),
                ContentDelta::InputJsonDelta { partial_json } => {
                    if !self.in_tool_block {
                        return None;
                    }
                    Some(self.chunk(
                        ChunkDelta {
                            role: None,
                            content: None,
                            tool_calls: Some(vec![ToolCallChunk {
                                index: self.tool_index,
                                id: None,
                                r#type: None,
                                function: Some(FunctionCallChunk {
                                    name: None,
                                    arguments: Some(partial_json),
                                }),
                            }]),
                        },
                        None,
                    ))
                }
            },
            StreamEvent::MessageDelta { delta, .. } => delta
                .stop_reason
                .map(|reason| self.chunk(ChunkDelta::default(), Some(stop_to_finish(reason)))),
            StreamEvent::ContentBlockStop { .. }
            | StreamEvent::MessageStop
            | StreamEvent::Ping
            | StreamEvent::Error { .. } => None,
        }
    }

    fn chunk(
        &self,
        delta: ChunkDelta,
        finish_reason: Option<FinishReason>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: 0,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }
}
