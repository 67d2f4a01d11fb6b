use std::collections::BTreeMap;

use serde_json::Value;

use llmux_protocol::anthropic::messages::{
    ContentBlock, CreateMessageResponse, MessageRole, MessageUsage, StopReason,
};
use llmux_protocol::anthropic::stream::{ContentDelta, StreamContentBlock, StreamEvent};

#[derive(Debug)]
enum BlockState {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        json: String,
    },
}

/// Accumulates Anthropic stream events into a complete message response.
#[derive(Debug, Default)]
pub struct AnthropicStreamCollector {
    id: String,
    model: String,
    blocks: BTreeMap<i64, BlockState>,
    stop_reason: Option<StopReason>,
    stop_sequence: Option<String>,
    usage: MessageUsage,
    stopped: bool,
}

impl AnthropicStreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                self.usage = message.usage;
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let state = match content_block {
                    StreamContentBlock::Text { text } => BlockState::Text(text),
                    StreamContentBlock::ToolUse { id, name, .. } => BlockState::ToolUse {
                        id,
                        name,
                        json: String::new(),
                    },
                };
                self.blocks.insert(index, state);
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                match (self.blocks.get_mut(&index), delta) {
                    (Some(BlockState::Text(text)), ContentDelta::TextDelta { text: part }) => {
                        text.push_str(&part);
                    }
                    (
                        Some(BlockState::ToolUse { json, .. }),
                        ContentDelta::InputJsonDelta { partial_json },
                    ) => {
                        json.push_str(&partial_json);
                    }
                    // Deltas for unknown or mismatched blocks are dropped.
                    _ => {}
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if delta.stop_sequence.is_some() {
                    self.stop_sequence = delta.stop_sequence;
                }
                if let Some(usage) = usage {
                    self.usage = usage;
                }
            }
            StreamEvent::MessageStop => self.stopped = true,
            StreamEvent::ContentBlockStop { .. }
            | StreamEvent::Ping
            | StreamEvent::Error { .. } => {}
        }
    }

    pub fn is_complete(&self) -> bool {
        self.stopped
    }

    pub fn finish(self) -> CreateMessageResponse {
        let content = self
            .blocks
            .into_values()
            .map(|state| match state {
                BlockState::Text(text) => ContentBlock::Text { text },
                BlockState::ToolUse { id, name, json } => ContentBlock::ToolUse {
                    id,
                    name,
                    input: serde_json::from_str(&json).unwrap_or(Value::String(json)),
                },
            })
            .collect();

        CreateMessageResponse {
            id: self.id,
            r#type: "message".to_string(),
            role: MessageRole::Assistant,
            content,
            model: self.model,
            stop_reason: self.stop_reason,
            stop_sequence: self.stop_sequence,
            usage: self.usage,
        }
    }
}
