use serde::{Deserialize, Serialize};

use crate::ids::{InstanceId, PipelineId, now_epoch_ms};

/// Per-request record created when the scheduler picks an instance and
/// destroyed when the response (or terminal error) is delivered.
///
/// Owned by the executing request task; never shared across requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub pipeline_id: PipelineId,
    pub instance_id: InstanceId,
    pub start_epoch_ms: i64,
    pub retry_count: u32,
    /// Name of the stage currently executing.
    pub stage: String,
    /// (stage, elapsed ms) pairs in completion order.
    pub timings: Vec<(String, u64)>,
}

impl ExecutionContext {
    pub fn new(
        execution_id: impl Into<String>,
        pipeline_id: impl Into<PipelineId>,
        instance_id: impl Into<InstanceId>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            request_id: None,
            session_id: None,
            pipeline_id: pipeline_id.into(),
            instance_id: instance_id.into(),
            start_epoch_ms: now_epoch_ms(),
            retry_count: 0,
            stage: String::new(),
            timings: Vec::new(),
        }
    }

    pub fn enter_stage(&mut self, stage: &str) {
        self.stage = stage.to_string();
    }

    pub fn record_timing(&mut self, stage: &str, elapsed_ms: u64) {
        self.timings.push((stage.to_string(), elapsed_ms));
    }

    /// Milliseconds left until the wall-clock deadline, if any.
    pub fn remaining_ms(&self, timeout_ms: i64) -> i64 {
        self.start_epoch_ms + timeout_ms - now_epoch_ms()
    }
}
