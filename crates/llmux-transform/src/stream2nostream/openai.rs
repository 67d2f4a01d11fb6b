use std::collections::BTreeMap;

use llmux_protocol::openai::chat::{
    ChatChoice, ChatCompletionResponse, ChatMessage, ChatRole, FinishReason, FunctionCall,
    ToolCall, ToolType, Usage,
};
use llmux_protocol::openai::stream::{ChatCompletionChunk, ToolCallChunk};

#[derive(Debug, Default)]
struct ToolCallState {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Debug, Default)]
struct ChoiceState {
    content: String,
    tool_calls: BTreeMap<i64, ToolCallState>,
    finish_reason: Option<FinishReason>,
}

/// Accumulates OpenAI chat-completion chunks into a complete response.
#[derive(Debug, Default)]
pub struct OpenAiStreamCollector {
    id: String,
    model: String,
    created: i64,
    usage: Option<Usage>,
    choices: BTreeMap<i64, ChoiceState>,
}

impl OpenAiStreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: ChatCompletionChunk) {
        if !chunk.id.is_empty() {
            self.id = chunk.id;
        }
        if !chunk.model.is_empty() {
            self.model = chunk.model;
        }
        if chunk.created != 0 {
            self.created = chunk.created;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        for choice in chunk.choices {
            let state = self.choices.entry(choice.index).or_default();
            if let Some(content) = choice.delta.content {
                state.content.push_str(&content);
            }
            if let Some(tool_calls) = choice.delta.tool_calls {
                for call in tool_calls {
                    merge_tool_call(state, call);
                }
            }
            if let Some(reason) = choice.finish_reason {
                state.finish_reason = Some(reason);
            }
        }
    }

    /// True once every observed choice carries a finish reason.
    pub fn is_complete(&self) -> bool {
        !self.choices.is_empty()
            && self
                .choices
                .values()
                .all(|choice| choice.finish_reason.is_some())
    }

    pub fn finish(self) -> ChatCompletionResponse {
        let choices = self
            .choices
            .into_iter()
            .map(|(index, state)| {
                let tool_calls: Vec<ToolCall> = state
                    .tool_calls
                    .into_iter()
                    .map(|(call_index, call)| ToolCall {
                        id: call
                            .id
                            .unwrap_or_else(|| format!("call_{index}_{call_index}")),
                        r#type: ToolType::Function,
                        function: FunctionCall {
                            name: call.name.unwrap_or_default(),
                            arguments: call.arguments,
                        },
                    })
                    .collect();
                ChatChoice {
                    index,
                    message: ChatMessage {
                        role: ChatRole::Assistant,
                        content: if state.content.is_empty() {
                            None
                        } else {
                            Some(state.content)
                        },
                        name: None,
                        tool_calls: if tool_calls.is_empty() {
                            None
                        } else {
                            Some(tool_calls)
                        },
                        tool_call_id: None,
                    },
                    // An upstream that drops the connection mid-stream never
                    // sends a finish reason; report truncation.
                    finish_reason: Some(state.finish_reason.unwrap_or(FinishReason::Length)),
                }
            })
            .collect();

        ChatCompletionResponse {
            id: self.id,
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model,
            choices,
            usage: self.usage,
        }
    }
}

fn merge_tool_call(state: &mut ChoiceState, call: ToolCallChunk) {
    let entry = state.tool_calls.entry(call.index).or_default();
    if call.id.is_some() {
        entry.id = call.id;
    }
    if let Some(function) = call.function {
        if let Some(name) = function.name {
            entry.name = Some(name);
        }
        if let Some(arguments) = function.arguments {
            entry.arguments.push_str(&arguments);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmux_protocol::openai::stream::{ChunkChoice, ChunkDelta, FunctionCallChunk};

    fn chunk(content: Option<&str>, finish: Option<FinishReason>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: "chatcmpl-1".to_string(),
            object: "chat.completion.chunk".to_string(),
            created: 7,
            model: "qwen3-coder-plus".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: None,
                    content: content.map(|text| text.to_string()),
                    tool_calls: None,
                },
                finish_reason: finish,
            }],
            usage: None,
        }
    }

    #[test]
    fn content_deltas_concatenate() {
        let mut collector = OpenAiStreamCollector::new();
        collector.push_chunk(chunk(Some("hel"), None));
        collector.push_chunk(chunk(Some("lo"), Some(FinishReason::Stop)));
        assert!(collector.is_complete());
        let resp = collector.finish();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(resp.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(resp.id, "chatcmpl-1");
    }

    #[test]
    fn tool_call_fragments_merge_by_index() {
        let mut collector = OpenAiStreamCollector::new();
        let mut first = chunk(None, None);
        first.choices[0].delta.tool_calls = Some(vec![ToolCallChunk {
            index: 0,
            id: Some("call_1".to_string()),
            r#type: Some(ToolType::Function),
            function: Some(FunctionCallChunk {
                name: Some("get_weather".to_string()),
                arguments: Some("{\"city\":".to_string()),
            }),
        }]);
        collector.push_chunk(first);

        let mut second = chunk(None, Some(FinishReason::ToolCalls));
        second.choices[0].delta.tool_calls = Some(vec![ToolCallChunk {
            index: 0,
            id: None,
            r#type: None,
            function: Some(FunctionCallChunk {
                name: None,
                arguments: Some("\"Berlin\"}".to_string()),
            }),
        }]);
        collector.push_chunk(second);

        let resp = collector.finish();
        let calls = resp.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.arguments, "{\"city\":\"Berlin\"}");
    }

    #[test]
    fn truncated_stream_reports_length() {
        let mut collector = OpenAiStreamCollector::new();
        collector.push_chunk(chunk(Some("partial"), None));
        assert!(!collector.is_complete());
        let resp = collector.finish();
        assert_eq!(resp.choices[0].finish_reason, Some(FinishReason::Length));
    }
}
