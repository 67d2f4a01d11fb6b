//! Fold a chunk stream back into the equivalent non-streaming response.
//!
//! Used when the caller asked for a complete response but the chosen
//! upstream (or the instance configuration) only streams.

mod anthropic;
mod openai;

pub use anthropic::AnthropicStreamCollector;
pub use openai::OpenAiStreamCollector;
