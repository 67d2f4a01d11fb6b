//! Pure request/response/stream translation for llmux.
//!
//! Nothing in this crate performs IO. The protocol switch converts between
//! the chat dialects, the stream modules fold streaming chunks back into
//! complete responses, and the compat module applies declarative field-level
//! mappings for upstream quirks.

pub mod compat;
pub mod stream2nostream;
pub mod switch;

pub use switch::{
    ChatRequest, ChatResponse, Dialect, StreamFrame, SwitchError, TransformerRegistry,
    WireFamily,
};
