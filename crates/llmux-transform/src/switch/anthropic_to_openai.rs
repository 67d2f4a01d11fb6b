use serde_json::Value;

use llmux_protocol::anthropic::messages::{
    ContentBlock, CreateMessageRequest, CreateMessageResponse, MessageRole, MessageUsage,
    StopReason,
};
use llmux_protocol::anthropic::stream::{
    ContentDelta, MessageDelta, StreamContentBlock, StreamEvent, StreamMessage,
};
use llmux_protocol::openai::chat::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatRole, FinishReason,
    FunctionCall, FunctionDefinition, Tool, ToolCall, ToolType,
};
use llmux_protocol::openai::stream::ChatCompletionChunk;

use super::{ChatRequest, ChatResponse, ProtocolTransformer, SwitchError, WireFamily};

/// Anthropic client dialect over an OpenAI-family upstream.
pub(super) struct AnthropicToOpenAi;

impl ProtocolTransformer for AnthropicToOpenAi {
    fn name(&self) -> &'static str {
        "anthropic_to_openai"
    }

    fn priority(&self) -> u32 {
        100
    }

    fn source(&self) -> WireFamily {
        WireFamily::Anthropic
    }

    fn target(&self) -> WireFamily {
        WireFamily::OpenAi
    }

    fn validate_input(&self, req: &ChatRequest) -> Result<(), SwitchError> {
        let ChatRequest::Anthropic(req) = req else {
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
        if req.max_tokens == 0 {
            return Err(SwitchError::InvalidInput("max_tokens must be > 0".into()));
        }
        Ok(())
    }

    fn convert_request(&self, req: ChatRequest) -> Result<ChatRequest, SwitchError> {
        let ChatRequest::Anthropic(req) = req else {
            return Err(SwitchError::DialectMismatch);
        };
        Ok(ChatRequest::OpenAi(request_to_openai(req)))
    }

    fn convert_response(&self, resp: ChatResponse) -> Result<ChatResponse, SwitchError> {
        let ChatResponse::OpenAi(resp) = resp else {
            return Err(SwitchError::DialectMismatch);
        };
        Ok(ChatResponse::Anthropic(response_to_anthropic(resp)))
    }
}

pub(super) fn request_to_openai(req: CreateMessageRequest) -> ChatCompletionRequest {
    let mut messages = Vec::new();
    if let Some(system) = req.system {
        messages.push(ChatMessage::text(ChatRole::System, system));
    }

    for message in req.messages {
        match message.content {
            llmux_protocol::anthropic::messages::MessageContent::Text(text) => {
                messages.push(ChatMessage::text(role_to_openai(message.role), text));
            }
            llmux_protocol::anthropic::messages::MessageContent::Blocks(blocks) => {
                push_blocks(&mut messages, message.role, blocks);
            }
        }
    }

    let tools = req.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| Tool {
                r#type: ToolType::Function,
                function: FunctionDefinition {
                    name: tool.name,
                    description: tool.description,
                    parameters: Some(tool.input_schema),
                    strict: None,
                },
            })
            .collect()
    });

    ChatCompletionRequest {
        model: req.model,
        messages,
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: Some(req.max_tokens),
        stream: req.stream,
        stop: req.stop_sequences,
        tools,
        tool_choice: None,
        user: req.metadata.and_then(|meta| meta.user_id),
    }
}

/// Blocks of one Anthropic message can fan out into several OpenAI messages:
/// tool results become `tool` role messages, tool uses become assistant
/// tool_calls, and text collects into the surrounding message.
fn push_blocks(messages: &mut Vec<ChatMessage>, role: MessageRole, blocks: Vec<ContentBlock>) {
    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text: part } => text.push_str(&part),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                r#type: ToolType::Function,
                function: FunctionCall {
                    name,
                    arguments: input.to_string(),
                },
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                messages.push(ChatMessage {
                    role: ChatRole::Tool,
                    content: Some(tool_result_text(content)),
                    name: None,
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id),
                });
            }
        }
    }

    if text.is_empty() && tool_calls.is_empty() {
        return;
    }
    messages.push(ChatMessage {
        role: role_to_openai(role),
        content: if text.is_empty() { None } else { Some(text) },
        name: None,
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        tool_call_id: None,
    });
}

fn tool_result_text(content: Option<Value>) -> String {
    match content {
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn role_to_openai(role: MessageRole) -> ChatRole {
    match role {
        MessageRole::User => ChatRole::User,
        MessageRole::Assistant => ChatRole::Assistant,
    }
}

pub(super) fn response_to_anthropic(resp: ChatCompletionResponse) -> CreateMessageResponse {
    let mut content = Vec::new();
    let mut stop_reason = None;

    if let Some(choice) = resp.choices.into_iter().next() {
        if let Some(text) = choice.message.content
            && !text.is_empty()
        {
            content.push(ContentBlock::Text { text });
        }
        if let Some(tool_calls) = choice.message.tool_calls {
            for call in tool_calls {
                content.push(ContentBlock::ToolUse {
                    id: call.id,
                    name: call.function.name,
                    input: serde_json::from_str(&call.function.arguments)
                        .unwrap_or(Value::String(call.function.arguments)),
                });
            }
        }
        stop_reason = choice.finish_reason.map(finish_to_stop);
    }

    CreateMessageResponse {
        id: resp.id,
        r#type: "message".to_string(),
        role: MessageRole::Assistant,
        content,
        model: resp.model,
        stop_reason,
        stop_sequence: None,
        usage: resp
            .usage
            .map(|usage| MessageUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            })
            .unwrap_or_default(),
    }
}

pub(super) fn finish_to_stop(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolCalls => StopReason::ToolUse,
        FinishReason::ContentFilter => StopReason::EndTurn,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    None,
    Text,
    ToolUse,
}

/// Folds OpenAI chat-completion chunks into the Anthropic event grammar.
///
/// Event order per the Anthropic contract: message_start, then alternating
/// content_block_start / *_delta / *_stop runs, then message_delta and
/// message_stop.
#[derive(Debug)]
pub struct OpenAiChunkToAnthropicEvents {
    started: bool,
    finished: bool,
    block_index: i64,
    open: OpenBlock,
    usage: MessageUsage,
}

impl OpenAiChunkToAnthropicEvents {
    pub fn new() -> Self {
        Self {
            started: false,
            finished: false,
            block_index: -1,
            open: OpenBlock::None,
            usage: MessageUsage::default(),
        }
    }

    pub fn push_chunk(&mut self, chunk: ChatCompletionChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                message: StreamMessage {
                    id: chunk.id.clone(),
                    r#type: "message".to_string(),
                    role: MessageRole::Assistant,
                    content: Vec::new(),
                    model: chunk.model.clone(),
                    stop_reason: None,
                    usage: MessageUsage::default(),
                },
            });
        }

        if let Some(usage) = &chunk.usage {
            self.usage = MessageUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            };
        }

        for choice in chunk.choices {
            if let Some(text) = choice.delta.content
                && !text.is_empty()
            {
                self.ensure_block(OpenBlock::Text, &mut events, |index| {
                    StreamEvent::ContentBlockStart {
                        index,
                        content_block: StreamContentBlock::Text {
                            text: String::new(),
                        },
                    }
                });
                events.push(StreamEvent::ContentBlockDelta {
                    index: self.block_index,
                    delta: ContentDelta::TextDelta { text },
                });
            }

            if let Some(tool_calls) = choice.delta.tool_calls {
                for call in tool_calls {
                    if let Some(function) = call.function {
                        if let Some(name) = function.name {
                            // A named fragment opens a fresh tool_use block.
                            self.close_block(&mut events);
                            self.block_index += 1;
                            self.open = OpenBlock::ToolUse;
                            events.push(StreamEvent::ContentBlockStart {
                                index: self.block_index,
                                content_block: StreamContentBlock::ToolUse {
                                    id: call.id.unwrap_or_else(|| {
                                        format!("toolu_{}", self.block_index)
                                    }),
                                    name,
                                    input: Value::Object(Default::default()),
                                },
                            });
                        }
                        if let Some(arguments) = function.arguments
                            && !arguments.is_empty()
                        {
                            events.push(StreamEvent::ContentBlockDelta {
                                index: self.block_index,
                                delta: ContentDelta::InputJsonDelta {
                                    partial_json: arguments,
                                },
                            });
                        }
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                self.close_block(&mut events);
                self.finished = true;
                events.push(StreamEvent::MessageDelta {
                    delta: MessageDelta {
                        stop_reason: Some(finish_to_stop(reason)),
                        stop_sequence: None,
                    },
                    usage: Some(self.usage.clone()),
                });
                events.push(StreamEvent::MessageStop);
            }
        }

        events
    }

    /// Terminates the event stream if the upstream ended without a finish
    /// reason (connection drop, missing final chunk).
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.started || self.finished {
            return events;
        }
        self.close_block(&mut events);
        self.finished = true;
        events.push(StreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some(StopReason::EndTurn),
                stop_sequence: None,
            },
            usage: Some(self.usage.clone()),
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    fn ensure_block<F>(&mut self, kind: OpenBlock, events: &mut Vec<StreamEvent>, start: F)
    where
        F: FnOnce(i64) -> StreamEvent,
    {
        if self.open == kind {
            return;
        }
        self.close_block(events);
        self.block_index += 1;
        self.open = kind;
        events.push(start(self.block_index));
    }

    fn close_block(&mut self, events: &mut Vec<StreamEvent>) {
        if self.open != OpenBlock::None {
            events.push(StreamEvent::ContentBlockStop {
                index: self.block_index,
            });
            self.open = OpenBlock::None;
        }
    }
}

impl Default for OpenAiChunkToAnthropicEvents {
    fn default() -> Self {
        Self::new()
    }
}
