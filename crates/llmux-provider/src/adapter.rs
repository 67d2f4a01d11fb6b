use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use llmux_common::PipelineError;
use llmux_transform::{ChatRequest, ChatResponse, StreamFrame};

use crate::instance::ProviderInstance;

/// Typed chunks flow through a bounded channel; the producer parks when the
/// consumer lags (back-pressure) and stops when the receiver is dropped.
pub type ChunkStream = mpsc::Receiver<Result<StreamFrame, PipelineError>>;

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub chat_timeout: Duration,
    pub stream_timeout: Duration,
    /// Total retries of the identical request after a recovered failure.
    pub max_retries: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            chat_timeout: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(60),
            max_retries: 2,
        }
    }
}

/// Per-call metadata handed down from the executor.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub execution_id: String,
    pub pipeline_id: Option<String>,
    pub attempt: u32,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn instance(&self) -> &ProviderInstance;

    async fn execute(
        &self,
        req: ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChatResponse, PipelineError>;

    async fn execute_streaming(
        &self,
        req: ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChunkStream, PipelineError>;
}
