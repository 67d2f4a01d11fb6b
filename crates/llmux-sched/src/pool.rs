use serde::{Deserialize, Serialize};

use llmux_common::{CompositeId, composite_id, now_epoch_ms};
use llmux_provider::ProviderInstance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Active,
    Draining,
}

/// An admitted (provider, model) pair, carrying the instance snapshot the
/// dispatcher needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub composite_id: CompositeId,
    pub provider_id: String,
    pub model_id: String,
    pub instance: ProviderInstance,
    pub added_at_ms: i64,
    pub status: PoolStatus,
    /// Mirrors blacklist membership for observers; the registry keeps it in
    /// sync on every cross-set move.
    pub blacklisted: bool,
}

impl PoolEntry {
    pub fn new(instance: ProviderInstance, model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        Self {
            composite_id: composite_id(&instance.id, &model_id),
            provider_id: instance.id.clone(),
            model_id,
            instance,
            added_at_ms: now_epoch_ms(),
            status: PoolStatus::Active,
            blacklisted: false,
        }
    }
}
