use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::rules::{RuleTarget, StrategyKind};

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

struct StickyEntry {
    composite_id: String,
    expires: Instant,
}

pub type CustomSelector = Arc<dyn Fn(&[RuleTarget]) -> Option<String> + Send + Sync>;

/// Picks one target out of an already-filtered candidate set.
///
/// Candidates arrive with blacklisted entries removed; weighted selection
/// renormalizes the remaining weights.
pub struct InstanceSelector {
    round_robin: Mutex<HashMap<String, usize>>,
    sticky: Mutex<HashMap<(String, String), StickyEntry>>,
    connections: Mutex<HashMap<String, i64>>,
    custom: Mutex<HashMap<String, CustomSelector>>,
}

impl InstanceSelector {
    pub fn new() -> Self {
        Self {
            round_robin: Mutex::new(HashMap::new()),
            sticky: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            custom: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register_custom(&self, rule_id: impl Into<String>, selector: CustomSelector) {
        self.custom.lock().await.insert(rule_id.into(), selector);
    }

    pub async fn select(
        &self,
        rule_id: &str,
        strategy: StrategyKind,
        candidates: &[RuleTarget],
        session_id: Option<&str>,
        session_ttl: Option<Duration>,
    ) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        match strategy {
            StrategyKind::Fixed => Some(candidates[0].composite_id.clone()),
            StrategyKind::Weighted => {
                let total: f64 = candidates
                    .iter()
                    .map(|target| target.weight.unwrap_or(0.0))
                    .sum();
                if total <= 0.0 {
                    return Some(candidates[0].composite_id.clone());
                }
                let roll = rand::rng().random_range(0.0..total);
                Some(weighted_pick(candidates, roll))
            }
            StrategyKind::RoundRobin => {
                self.round_robin_pick(rule_id, candidates, session_id, session_ttl)
                    .await
            }
            StrategyKind::LeastConnections => {
                let connections = self.connections.lock().await;
                candidates
                    .iter()
                    .min_by_key(|target| {
                        connections
                            .get(&target.composite_id)
                            .copied()
                            .unwrap_or(0)
                    })
                    .map(|target| target.composite_id.clone())
            }
            StrategyKind::Random => {
                let index = rand::rng().random_range(0..candidates.len());
                Some(candidates[index].composite_id.clone())
            }
            StrategyKind::Custom => {
                let custom = self.custom.lock().await;
                match custom.get(rule_id) {
                    Some(selector) => selector(candidates),
                    None => Some(candidates[0].composite_id.clone()),
                }
            }
        }
    }

    /// Sticky round-robin: a session keeps its instance for the TTL as long
    /// as that instance is still a candidate; without a session id this is
    /// plain round-robin.
    async fn round_robin_pick(
        &self,
        rule_id: &str,
        candidates: &[RuleTarget],
        session_id: Option<&str>,
        session_ttl: Option<Duration>,
    ) -> Option<String> {
        let now = Instant::now();
        if let Some(session) = session_id {
            let key = (rule_id.to_string(), session.to_string());
            let mut sticky = self.sticky.lock().await;
            sticky.retain(|_, entry| entry.expires > now);
            if let Some(entry) = sticky.get(&key)
                && candidates
                    .iter()
                    .any(|target| target.composite_id == entry.composite_id)
            {
                return Some(entry.composite_id.clone());
            }
            let chosen = self.advance(rule_id, candidates).await?;
            sticky.insert(
                key,
                StickyEntry {
                    composite_id: chosen.clone(),
                    expires: now + session_ttl.unwrap_or(DEFAULT_SESSION_TTL),
                },
            );
            Some(chosen)
        } else {
            self.advance(rule_id, candidates).await
        }
    }

    async fn advance(&self, rule_id: &str, candidates: &[RuleTarget]) -> Option<String> {
        let mut counters = self.round_robin.lock().await;
        let counter = counters.entry(rule_id.to_string()).or_insert(0);
        let chosen = candidates.get(*counter % candidates.len())?;
        *counter = counter.wrapping_add(1);
        Some(chosen.composite_id.clone())
    }

    pub async fn note_started(&self, composite_id: &str) {
        *self
            .connections
            .lock()
            .await
            .entry(composite_id.to_string())
            .or_insert(0) += 1;
    }

    pub async fn note_finished(&self, composite_id: &str) {
        let mut connections = self.connections.lock().await;
        if let Some(count) = connections.get_mut(composite_id) {
            *count = (*count - 1).max(0);
        }
    }
}

impl Default for InstanceSelector {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic core of weighted selection: walk the cumulative weights
/// until the roll falls inside a bucket.
pub(crate) fn weighted_pick(candidates: &[RuleTarget], roll: f64) -> String {
    let mut cumulative = 0.0;
    for target in candidates {
        cumulative += target.weight.unwrap_or(0.0);
        if roll < cumulative {
            return target.composite_id.clone();
        }
    }
    // Float edge: the roll landed exactly on the total.
    candidates
        .last()
        .map(|target| target.composite_id.clone())
        .unwrap_or_default()
}
