//! Protocol switch: bidirectional dialect translation.
//!
//! Transformers register against (source family, target family) pairs with a
//! priority; selection picks the highest-priority enabled candidate. Ingress
//! conversion is strict (a missing transformer is an error, input validation
//! is mandatory); the response path is lenient and passes through when no
//! transformer matches.

mod anthropic_to_openai;
mod openai_to_anthropic;

pub use anthropic_to_openai::OpenAiChunkToAnthropicEvents;
pub use openai_to_anthropic::AnthropicEventsToOpenAiChunks;

use serde::{Deserialize, Serialize};

use llmux_protocol::anthropic::messages::{CreateMessageRequest, CreateMessageResponse};
use llmux_protocol::anthropic::stream::StreamEvent;
use llmux_protocol::openai::chat::{ChatCompletionRequest, ChatCompletionResponse};
use llmux_protocol::openai::stream::ChatCompletionChunk;

/// Dialects an instance can be configured with. Most upstreams speak the
/// OpenAI wire shape under a different name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "qwen")]
    Qwen,
    #[serde(rename = "iflow")]
    IFlow,
    #[serde(rename = "lmstudio")]
    LmStudio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFamily {
    Anthropic,
    OpenAi,
}

impl Dialect {
    pub fn family(&self) -> WireFamily {
        match self {
            Dialect::Anthropic => WireFamily::Anthropic,
            Dialect::OpenAi | Dialect::Qwen | Dialect::IFlow | Dialect::LmStudio => {
                WireFamily::OpenAi
            }
        }
    }
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq)]
pub enum ChatRequest {
    Anthropic(CreateMessageRequest),
    OpenAi(ChatCompletionRequest),
}

impl ChatRequest {
    pub fn family(&self) -> WireFamily {
        match self {
            ChatRequest::Anthropic(_) => WireFamily::Anthropic,
            ChatRequest::OpenAi(_) => WireFamily::OpenAi,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            ChatRequest::Anthropic(req) => &req.model,
            ChatRequest::OpenAi(req) => &req.model,
        }
    }

    pub fn wants_stream(&self) -> bool {
        match self {
            ChatRequest::Anthropic(req) => req.stream.unwrap_or(false),
            ChatRequest::OpenAi(req) => req.stream.unwrap_or(false),
        }
    }

    /// Sticky-session key, when the caller supplied one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ChatRequest::Anthropic(req) => req
                .metadata
                .as_ref()
                .and_then(|meta| meta.session_id.as_deref()),
            ChatRequest::OpenAi(req) => req.user.as_deref(),
        }
    }
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq)]
pub enum ChatResponse {
    Anthropic(CreateMessageResponse),
    OpenAi(ChatCompletionResponse),
}

impl ChatResponse {
    pub fn family(&self) -> WireFamily {
        match self {
            ChatResponse::Anthropic(_) => WireFamily::Anthropic,
            ChatResponse::OpenAi(_) => WireFamily::OpenAi,
        }
    }
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Anthropic(StreamEvent),
    OpenAi(ChatCompletionChunk),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SwitchError {
    NoTransformer { from: Dialect, to: Dialect },
    DialectMismatch,
    InvalidInput(String),
}

impl std::fmt::Display for SwitchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwitchError::NoTransformer { from, to } => {
                write!(f, "no transformer registered for {from:?} -> {to:?}")
            }
            SwitchError::DialectMismatch => write!(f, "payload dialect does not match context"),
            SwitchError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
        }
    }
}

impl std::error::Error for SwitchError {}

pub trait ProtocolTransformer: Send + Sync {
    fn name(&self) -> &'static str;

    fn priority(&self) -> u32 {
        0
    }

    fn source(&self) -> WireFamily;
    fn target(&self) -> WireFamily;

    /// Ingress validation; mandatory before any request conversion.
    fn validate_input(&self, req: &ChatRequest) -> Result<(), SwitchError>;

    fn convert_request(&self, req: ChatRequest) -> Result<ChatRequest, SwitchError>;

    /// Converts target-family responses back to the source family.
    fn convert_response(&self, resp: ChatResponse) -> Result<ChatResponse, SwitchError>;
}

struct Registration {
    transformer: Box<dyn ProtocolTransformer>,
    enabled: bool,
}

/// Holds the registered transformers and performs pair selection.
pub struct TransformerRegistry {
    entries: Vec<Registration>,
}

impl TransformerRegistry {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registry with the two built-in directions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(anthropic_to_openai::AnthropicToOpenAi), true);
        registry.register(Box::new(openai_to_anthropic::OpenAiToAnthropic), true);
        registry
    }

    pub fn register(&mut self, transformer: Box<dyn ProtocolTransformer>, enabled: bool) {
        self.entries.push(Registration {
            transformer,
            enabled,
        });
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) {
        for entry in &mut self.entries {
            if entry.transformer.name() == name {
                entry.enabled = enabled;
            }
        }
    }

    fn select(&self, from: WireFamily, to: WireFamily) -> Option<&dyn ProtocolTransformer> {
        self.entries
            .iter()
            .filter(|entry| entry.enabled)
            .filter(|entry| {
                entry.transformer.source() == from && entry.transformer.target() == to
            })
            .max_by_key(|entry| entry.transformer.priority())
            .map(|entry| entry.transformer.as_ref())
    }

    /// Strict ingress conversion: the payload must match `from`, and a
    /// transformer must exist for any cross-family pair.
    pub fn convert_request(
        &self,
        req: ChatRequest,
        from: Dialect,
        to: Dialect,
    ) -> Result<ChatRequest, SwitchError> {
        if req.family() != from.family() {
            return Err(SwitchError::DialectMismatch);
        }
        if from.family() == to.family() {
            return Ok(req);
        }
        let transformer = self
            .select(from.family(), to.family())
            .ok_or(SwitchError::NoTransformer { from, to })?;
        transformer.validate_input(&req)?;
        transformer.convert_request(req)
    }

    /// Lenient egress conversion: pass-through when no transformer matches.
    pub fn convert_response(
        &self,
        resp: ChatResponse,
        from: Dialect,
        to: Dialect,
    ) -> Result<ChatResponse, SwitchError> {
        if from.family() == to.family() {
            return Ok(resp);
        }
        match self.select(from.family(), to.family()) {
            Some(transformer) => transformer.convert_response(resp),
            None => Ok(resp),
        }
    }
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmux_protocol::anthropic::messages::{InputMessage, MessageContent, MessageRole};

    fn anthropic_request() -> ChatRequest {
        ChatRequest::Anthropic(CreateMessageRequest {
            model: "claude-router".to_string(),
            messages: vec![InputMessage {
                role: MessageRole::User,
                content: MessageContent::Text("hello".to_string()),
            }],
            max_tokens: 16,
            system: None,
            temperature: None,
            top_p: None,
            stop_sequences: None,
            stream: None,
            tools: None,
            metadata: None,
        })
    }

    #[test]
    fn same_family_passes_through() {
        let registry = TransformerRegistry::with_builtins();
        let req = anthropic_request();
        let out = registry
            .convert_request(req.clone(), Dialect::Anthropic, Dialect::Anthropic)
            .unwrap();
        assert_eq!(out, req);
    }

    #[test]
    fn cross_family_requires_transformer() {
        let registry = TransformerRegistry::empty();
        let err = registry
            .convert_request(anthropic_request(), Dialect::Anthropic, Dialect::Qwen)
            .unwrap_err();
        assert!(matches!(err, SwitchError::NoTransformer { .. }));
    }

    #[test]
    fn mismatched_payload_is_rejected() {
        let registry = TransformerRegistry::with_builtins();
        let err = registry
            .convert_request(anthropic_request(), Dialect::OpenAi, Dialect::Qwen)
            .unwrap_err();
        assert_eq!(err, SwitchError::DialectMismatch);
    }

    #[test]
    fn disabled_transformer_is_skipped() {
        let mut registry = TransformerRegistry::with_builtins();
        registry.set_enabled("anthropic_to_openai", false);
        let err = registry
            .convert_request(anthropic_request(), Dialect::Anthropic, Dialect::Qwen)
            .unwrap_err();
        assert!(matches!(err, SwitchError::NoTransformer { .. }));
    }

    #[test]
    fn qwen_and_iflow_share_the_openai_family() {
        assert_eq!(Dialect::Qwen.family(), WireFamily::OpenAi);
        assert_eq!(Dialect::IFlow.family(), WireFamily::OpenAi);
        assert_eq!(Dialect::LmStudio.family(), WireFamily::OpenAi);
    }
}
