use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use llmux_common::{ErrorCategory, PipelineError};

use crate::blacklist::BlacklistEntry;
use crate::dedup::DedupCoordinator;
use crate::events::{Event, EventHub, OperationalEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Retry,
    Failover,
    BlacklistTemporary,
    BlacklistPermanent,
    Maintenance,
    Ignore,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Retry => "retry",
            ActionKind::Failover => "failover",
            ActionKind::BlacklistTemporary => "blacklist_temporary",
            ActionKind::BlacklistPermanent => "blacklist_permanent",
            ActionKind::Maintenance => "maintenance",
            ActionKind::Ignore => "ignore",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Action {
    pub kind: ActionKind,
    pub should_retry: bool,
    pub retry_delay_ms: Option<u64>,
    pub destroy_pipeline: bool,
}

impl Action {
    pub fn fail() -> Self {
        Self {
            kind: ActionKind::Ignore,
            should_retry: false,
            retry_delay_ms: None,
            destroy_pipeline: false,
        }
    }

    pub fn failover() -> Self {
        Self {
            kind: ActionKind::Failover,
            should_retry: false,
            retry_delay_ms: None,
            destroy_pipeline: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 200,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// base·multiplier^attempt, capped, with optional ±25% jitter.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_delay_ms as f64);
        if self.jitter {
            let factor = rand::rng().random_range(0.75..=1.25);
            (capped * factor) as u64
        } else {
            capped as u64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCenterConfig {
    pub retry: RetryPolicy,
    /// Rate-limit retries back off harder.
    pub rate_limit_retry: RetryPolicy,
    pub blacklist_ttl: Duration,
    pub cleanup_interval: Duration,
    /// Per-code overrides applied between custom handlers and category
    /// defaults.
    #[serde(default)]
    pub strategies: HashMap<String, ActionKind>,
}

impl Default for ErrorCenterConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            rate_limit_retry: RetryPolicy {
                base_delay_ms: 1_000,
                max_delay_ms: 60_000,
                ..RetryPolicy::default()
            },
            blacklist_ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
            strategies: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorStats {
    pub total: u64,
    pub retries: u64,
    pub failovers: u64,
    pub blacklists: u64,
    pub by_code: HashMap<String, u64>,
}

type CustomHandler = Arc<dyn Fn(&PipelineError, u32) -> Action + Send + Sync>;

/// Classifies pipeline errors into actions and owns blacklist writes.
pub struct ErrorCenter {
    config: ErrorCenterConfig,
    coordinator: Arc<DedupCoordinator>,
    handlers: RwLock<HashMap<String, CustomHandler>>,
    total: AtomicU64,
    retries: AtomicU64,
    failovers: AtomicU64,
    blacklists: AtomicU64,
    by_code: RwLock<HashMap<String, u64>>,
}

impl ErrorCenter {
    pub fn new(config: ErrorCenterConfig, coordinator: Arc<DedupCoordinator>) -> Self {
        Self {
            config,
            coordinator,
            handlers: RwLock::new(HashMap::new()),
            total: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failovers: AtomicU64::new(0),
            blacklists: AtomicU64::new(0),
            by_code: RwLock::new(HashMap::new()),
        }
    }

    pub fn coordinator(&self) -> &Arc<DedupCoordinator> {
        &self.coordinator
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.config.cleanup_interval
    }

    pub fn blacklist_ttl(&self) -> Duration {
        self.config.blacklist_ttl
    }

    pub async fn register_handler(
        &self,
        code: impl Into<String>,
        handler: impl Fn(&PipelineError, u32) -> Action + Send + Sync + 'static,
    ) {
        self.handlers
            .write()
            .await
            .insert(code.into(), Arc::new(handler));
    }

    /// Policy order: custom handler for the code, then the configured
    /// strategy, then the category default. Retry actions escalate to
    /// failover once the retry budget is spent.
    pub async fn handle_error(&self, err: &PipelineError, retry_count: u32) -> Action {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self
            .by_code
            .write()
            .await
            .entry(err.code.clone())
            .or_insert(0) += 1;

        let action = if let Some(handler) = self.handlers.read().await.get(&err.code) {
            handler(err, retry_count)
        } else if let Some(kind) = self.config.strategies.get(&err.code) {
            self.action_for_kind(*kind, err, retry_count)
        } else {
            self.default_action(err, retry_count)
        };

        match action.kind {
            ActionKind::Retry => self.retries.fetch_add(1, Ordering::Relaxed),
            ActionKind::Failover => self.failovers.fetch_add(1, Ordering::Relaxed),
            ActionKind::BlacklistTemporary | ActionKind::BlacklistPermanent => {
                self.blacklists.fetch_add(1, Ordering::Relaxed)
            }
            ActionKind::Maintenance | ActionKind::Ignore => 0,
        };
        self.coordinator
            .events()
            .emit(Event::Operational(OperationalEvent::ErrorHandled {
                code: err.code.clone(),
                action: action.kind.as_str().to_string(),
            }))
            .await;
        action
    }

    fn default_action(&self, err: &PipelineError, retry_count: u32) -> Action {
        let kind = match err.category {
            ErrorCategory::Network => ActionKind::Retry,
            ErrorCategory::RateLimiting => ActionKind::Retry,
            ErrorCategory::Authentication => ActionKind::BlacklistTemporary,
            ErrorCategory::Data
            | ErrorCategory::Configuration
            | ErrorCategory::PipelineLifecycle => ActionKind::Ignore,
            ErrorCategory::Resource | ErrorCategory::System => ActionKind::Failover,
            ErrorCategory::Scheduling => ActionKind::Failover,
            ErrorCategory::Execution => ActionKind::Retry,
        };
        self.action_for_kind(kind, err, retry_count)
    }

    fn action_for_kind(&self, kind: ActionKind, err: &PipelineError, retry_count: u32) -> Action {
        match kind {
            ActionKind::Retry => {
                let policy = if err.category == ErrorCategory::RateLimiting {
                    &self.config.rate_limit_retry
                } else {
                    &self.config.retry
                };
                if retry_count >= policy.max_retries {
                    return Action::failover();
                }
                Action {
                    kind: ActionKind::Retry,
                    should_retry: true,
                    retry_delay_ms: Some(policy.delay_ms(retry_count)),
                    destroy_pipeline: false,
                }
            }
            ActionKind::Failover => Action::failover(),
            ActionKind::BlacklistTemporary => Action {
                kind: ActionKind::BlacklistTemporary,
                should_retry: false,
                retry_delay_ms: None,
                destroy_pipeline: true,
            },
            ActionKind::BlacklistPermanent => Action {
                kind: ActionKind::BlacklistPermanent,
                should_retry: false,
                retry_delay_ms: None,
                destroy_pipeline: true,
            },
            ActionKind::Maintenance => Action {
                kind: ActionKind::Maintenance,
                should_retry: false,
                retry_delay_ms: None,
                destroy_pipeline: false,
            },
            ActionKind::Ignore => Action::fail(),
        }
    }

    /// Success is the recovery signal: any blacklist entry for the pipeline
    /// is lifted.
    pub async fn handle_execution_success(&self, pipeline_id: &str) {
        if self.coordinator.remove_from_blacklist(pipeline_id).await {
            info!(event = "blacklist_recovered", pipeline_id);
        }
    }

    /// Terminal-result entry point: success lifts the blacklist entry,
    /// failure goes through the policy table.
    pub async fn handle_execution_result(
        &self,
        pipeline_id: &str,
        result: &Result<(), PipelineError>,
        retry_count: u32,
    ) -> Option<Action> {
        match result {
            Ok(()) => {
                self.handle_execution_success(pipeline_id).await;
                None
            }
            Err(err) => Some(self.handle_error(err, retry_count).await),
        }
    }

    pub async fn blacklist(
        &self,
        pipeline_id: &str,
        instance_id: &str,
        reason: PipelineError,
        duration: Option<Duration>,
        permanent: bool,
    ) {
        let ttl = duration.or(if permanent {
            None
        } else {
            Some(self.config.blacklist_ttl)
        });
        self.coordinator
            .add_to_blacklist(pipeline_id, instance_id, reason, ttl, permanent)
            .await;
    }

    pub async fn unblacklist(&self, pipeline_id: &str) -> bool {
        self.coordinator.remove_from_blacklist(pipeline_id).await
    }

    pub async fn get_blacklisted(&self) -> Vec<BlacklistEntry> {
        self.coordinator.blacklist_snapshot().await
    }

    pub async fn get_stats(&self) -> ErrorStats {
        ErrorStats {
            total: self.total.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            blacklists: self.blacklists.load(Ordering::Relaxed),
            by_code: self.by_code.read().await.clone(),
        }
    }

    /// Starts the blacklist reaper on this center's coordinator.
    pub fn spawn_reaper(&self) {
        self.coordinator
            .clone()
            .spawn_reaper(self.config.cleanup_interval);
    }

    pub fn event_hub(&self) -> EventHub {
        self.coordinator.events().clone()
    }
}
