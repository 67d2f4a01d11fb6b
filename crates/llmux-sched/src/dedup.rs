use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use llmux_common::{PipelineError, now_epoch_ms};

use crate::blacklist::BlacklistEntry;
use crate::events::{Event, EventHub, OperationalEvent};
use crate::pool::PoolEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateOp {
    AddToBlacklist,
    AddToPool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateCheck {
    pub in_blacklist: bool,
    pub in_pool: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub found: usize,
    pub resolved: usize,
    pub errors: usize,
}

#[derive(Default)]
struct Registry {
    blacklist: HashMap<String, BlacklistEntry>,
    pool: HashMap<String, PoolEntry>,
}

/// Owns both the blacklist and the pool behind one mutex, making the
/// disjointness invariant linearizable: for any id, at most one of the two
/// sets holds it at any observable moment.
pub struct DedupCoordinator {
    registry: Mutex<Registry>,
    events: EventHub,
}

impl DedupCoordinator {
    pub fn new(events: EventHub) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            events,
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Admits an entry; any blacklist entry for the id is removed inside the
    /// same critical section before the pool add becomes observable.
    pub async fn add_to_pool(&self, mut entry: PoolEntry) {
        let id = entry.composite_id.clone();
        {
            let mut registry = self.registry.lock().await;
            registry.blacklist.remove(&id);
            entry.blacklisted = false;
            entry.status = crate::pool::PoolStatus::Active;
            registry.pool.insert(id.clone(), entry);
        }
        self.events
            .emit(Event::Operational(OperationalEvent::PoolAdded { id }))
            .await;
    }

    /// Blacklists an id; the pool entry (if any) is displaced inside the
    /// same critical section and kept on the blacklist entry for later
    /// re-admission.
    pub async fn add_to_blacklist(
        &self,
        id: &str,
        instance_id: &str,
        reason: PipelineError,
        duration: Option<Duration>,
        permanent: bool,
    ) {
        let now = now_epoch_ms();
        let expires_at_ms = if permanent {
            None
        } else {
            duration.map(|ttl| now + ttl.as_millis() as i64)
        };
        let entry = {
            let mut registry = self.registry.lock().await;
            let mut displaced = registry.pool.remove(id);
            if let Some(displaced) = &mut displaced {
                displaced.blacklisted = true;
            }
            let entry = BlacklistEntry {
                pipeline_id: id.to_string(),
                instance_id: instance_id.to_string(),
                reason,
                blacklisted_at_ms: now,
                expires_at_ms,
                permanent,
                displaced,
            };
            registry.blacklist.insert(id.to_string(), entry.clone());
            entry
        };
        info!(
            event = "blacklist_added",
            id,
            permanent,
            expires_at_ms = entry.expires_at_ms
        );
        self.events
            .emit(Event::Operational(OperationalEvent::blacklist_added(
                id,
                &entry.reason,
                permanent,
                entry.expires_at_ms,
            )))
            .await;
    }

    /// Removes a blacklist entry, restoring the displaced pool entry when
    /// one was captured. Idempotent.
    pub async fn remove_from_blacklist(&self, id: &str) -> bool {
        let removed = {
            let mut registry = self.registry.lock().await;
            match registry.blacklist.remove(id) {
                Some(entry) => {
                    if let Some(mut displaced) = entry.displaced {
                        displaced.blacklisted = false;
                        displaced.status = crate::pool::PoolStatus::Active;
                        registry.pool.insert(id.to_string(), displaced);
                    }
                    true
                }
                None => false,
            }
        };
        if removed {
            self.events
                .emit(Event::Operational(OperationalEvent::BlacklistRemoved {
                    id: id.to_string(),
                }))
                .await;
        }
        removed
    }

    pub async fn remove_from_pool(&self, id: &str) -> bool {
        let removed = self.registry.lock().await.pool.remove(id).is_some();
        if removed {
            self.events
                .emit(Event::Operational(OperationalEvent::PoolRemoved {
                    id: id.to_string(),
                }))
                .await;
        }
        removed
    }

    pub async fn check_duplicates(&self, id: &str) -> DuplicateCheck {
        let registry = self.registry.lock().await;
        DuplicateCheck {
            in_blacklist: registry.blacklist.contains_key(id),
            in_pool: registry.pool.contains_key(id),
        }
    }

    /// Clears the opposite set ahead of `op`, inside one critical section.
    pub async fn ensure_no_duplicates(&self, id: &str, op: DuplicateOp) {
        let mut registry = self.registry.lock().await;
        match op {
            DuplicateOp::AddToBlacklist => {
                registry.pool.remove(id);
            }
            DuplicateOp::AddToPool => {
                registry.blacklist.remove(id);
            }
        }
    }

    /// Scans for ids present in both sets and resolves them in favor of the
    /// blacklist. Idempotent; a second run finds nothing.
    pub async fn audit(&self) -> AuditReport {
        let mut report = AuditReport::default();
        let mut registry = self.registry.lock().await;
        let duplicated: Vec<String> = registry
            .pool
            .keys()
            .filter(|id| registry.blacklist.contains_key(*id))
            .cloned()
            .collect();
        report.found = duplicated.len();
        for id in duplicated {
            if registry.pool.remove(&id).is_some() {
                report.resolved += 1;
                warn!(event = "dedup_audit_resolved", id = %id);
            } else {
                report.errors += 1;
            }
        }
        report
    }

    pub async fn is_blacklisted(&self, id: &str) -> bool {
        let now = now_epoch_ms();
        self.registry
            .lock()
            .await
            .blacklist
            .get(id)
            .is_some_and(|entry| entry.is_active(now))
    }

    pub async fn pool_entry(&self, id: &str) -> Option<PoolEntry> {
        self.registry.lock().await.pool.get(id).cloned()
    }

    pub async fn pool_snapshot(&self) -> Vec<PoolEntry> {
        self.registry.lock().await.pool.values().cloned().collect()
    }

    pub async fn blacklist_snapshot(&self) -> Vec<BlacklistEntry> {
        self.registry
            .lock()
            .await
            .blacklist
            .values()
            .cloned()
            .collect()
    }

    /// Periodic reaper: drops expired, non-permanent entries every
    /// `cleanup_interval`. Reaper latency is bounded by the interval;
    /// `is_blacklisted` is exact regardless.
    pub fn spawn_reaper(self: Arc<Self>, cleanup_interval: Duration) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(cleanup_interval).await;
                self.reap_expired().await;
            }
        });
    }

    pub async fn reap_expired(&self) {
        let now = now_epoch_ms();
        let expired: Vec<String> = {
            let mut registry = self.registry.lock().await;
            let expired: Vec<String> = registry
                .blacklist
                .iter()
                .filter(|(_, entry)| !entry.is_active(now))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                if let Some(entry) = registry.blacklist.remove(id)
                    && let Some(mut displaced) = entry.displaced
                {
                    displaced.blacklisted = false;
                    registry.pool.insert(id.clone(), displaced);
                }
            }
            expired
        };
        for id in expired {
            info!(event = "blacklist_expired", id = %id);
            self.events
                .emit(Event::Operational(OperationalEvent::BlacklistExpired { id }))
                .await;
        }
    }
}
