use serde::{Deserialize, Serialize};

use llmux_common::{InstanceId, PipelineError, PipelineId};

use crate::pool::PoolEntry;

/// One excluded pipeline/instance pair. At most one entry exists per id;
/// re-blacklisting replaces the previous entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub pipeline_id: PipelineId,
    pub instance_id: InstanceId,
    pub reason: PipelineError,
    pub blacklisted_at_ms: i64,
    /// `None` together with `permanent` means no expiry.
    pub expires_at_ms: Option<i64>,
    pub permanent: bool,
    /// Pool snapshot displaced by this entry; restored on re-admission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub displaced: Option<PoolEntry>,
}

impl BlacklistEntry {
    /// Active iff permanent or not yet expired.
    pub fn is_active(&self, now_ms: i64) -> bool {
        self.permanent || self.expires_at_ms.is_none_or(|expires| expires > now_ms)
    }
}
