//! Wire DTOs for the chat dialects llmux speaks.
//!
//! Only the shapes the router actually reads or writes are modeled; unknown
//! fields pass through untouched where a payload is round-tripped as JSON.

pub mod anthropic;
pub mod openai;
pub mod sse;
