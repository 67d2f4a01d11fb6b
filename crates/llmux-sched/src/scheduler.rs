use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::debug;
use uuid::Uuid;

use llmux_common::{ExecutionContext, PipelineError, codes};

use crate::dedup::DedupCoordinator;
use crate::pool::PoolEntry;
use crate::rules::{CustomPredicate, RouteQuery, RoutingRule, RuleTarget, StrategyKind, evaluate_rules};
use crate::strategy::InstanceSelector;

/// One immutable routing table. Replaced atomically on hot reload; requests
/// in flight keep the generation they started with.
#[derive(Debug, Clone, Default)]
pub struct SchedulerGeneration {
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub rule_id: String,
    pub entry: PoolEntry,
    pub context: ExecutionContext,
}

pub struct Scheduler {
    generation: ArcSwap<SchedulerGeneration>,
    selector: InstanceSelector,
    coordinator: Arc<DedupCoordinator>,
    custom_predicates: HashMap<String, CustomPredicate>,
}

impl Scheduler {
    pub fn new(coordinator: Arc<DedupCoordinator>) -> Self {
        Self {
            generation: ArcSwap::from_pointee(SchedulerGeneration::default()),
            selector: InstanceSelector::new(),
            coordinator,
            custom_predicates: HashMap::new(),
        }
    }

    /// Atomically replaces the routing table (config load / hot reload).
    pub fn install(&self, generation: SchedulerGeneration) {
        self.generation.store(Arc::new(generation));
    }

    pub fn coordinator(&self) -> &Arc<DedupCoordinator> {
        &self.coordinator
    }

    pub fn selector(&self) -> &InstanceSelector {
        &self.selector
    }

    pub fn register_predicate(&mut self, name: impl Into<String>, predicate: CustomPredicate) {
        self.custom_predicates.insert(name.into(), predicate);
    }

    /// Routes one request: rule evaluation, availability filtering, strategy
    /// selection, then the execution context for the chosen instance.
    pub async fn route(&self, query: &RouteQuery) -> Result<RouteDecision, PipelineError> {
        let generation = self.generation.load();
        let Some(rule) = evaluate_rules(&generation.rules, query, &self.custom_predicates)
        else {
            return Err(PipelineError::new(
                codes::PIPELINE_NOT_FOUND,
                "no routing rule matches the request",
                "scheduler",
            ));
        };

        let primaries: Vec<RuleTarget> = self
            .available(
                rule.targets.iter().filter(|target| !target.fallback),
                &query.excluded,
            )
            .await;
        let candidates = if primaries.is_empty() {
            // Primaries exhausted: fall back to targets flagged for it.
            self.available(
                rule.targets.iter().filter(|target| target.fallback),
                &query.excluded,
            )
            .await
        } else {
            primaries
        };
        if candidates.is_empty() {
            return Err(PipelineError::new(
                codes::NO_AVAILABLE_PIPELINES,
                "all instances for the matched rule are blacklisted or absent",
                "scheduler",
            )
            .with_pipeline(rule.id.clone()));
        }

        let candidates = renormalize(rule.strategy, candidates);
        let chosen = self
            .selector
            .select(
                &rule.id,
                rule.strategy,
                &candidates,
                query.session_id.as_deref(),
                rule.session_ttl_secs.map(Duration::from_secs),
            )
            .await
            .ok_or_else(|| {
                PipelineError::new(
                    codes::LOAD_BALANCING_FAILED,
                    "strategy produced no instance",
                    "scheduler",
                )
                .with_pipeline(rule.id.clone())
            })?;

        let entry = self.coordinator.pool_entry(&chosen).await.ok_or_else(|| {
            PipelineError::new(
                codes::NO_AVAILABLE_PIPELINES,
                "selected instance left the pool",
                "scheduler",
            )
            .with_pipeline(rule.id.clone())
        })?;

        debug!(
            event = "route_decided",
            rule = %rule.id,
            instance = %entry.instance.id,
            composite = %entry.composite_id
        );

        let mut context = ExecutionContext::new(
            format!("exec_{}", Uuid::new_v4().simple()),
            rule.id.clone(),
            entry.instance.id.clone(),
        );
        context.session_id = query.session_id.clone();

        Ok(RouteDecision {
            rule_id: rule.id.clone(),
            entry,
            context,
        })
    }

    /// Keeps targets that are pooled, not actively blacklisted, and not
    /// excluded by the request's failover history.
    async fn available<'a>(
        &self,
        targets: impl Iterator<Item = &'a RuleTarget>,
        excluded: &[String],
    ) -> Vec<RuleTarget> {
        let mut out = Vec::new();
        for target in targets {
            if excluded.contains(&target.composite_id) {
                continue;
            }
            if self.coordinator.is_blacklisted(&target.composite_id).await {
                continue;
            }
            if self
                .coordinator
                .pool_entry(&target.composite_id)
                .await
                .is_none()
            {
                continue;
            }
            out.push(target.clone());
        }
        out
    }

    pub async fn note_started(&self, composite_id: &str) {
        self.selector.note_started(composite_id).await;
    }

    pub async fn note_finished(&self, composite_id: &str) {
        self.selector.note_finished(composite_id).await;
    }
}

/// Weighted candidates are renormalized so the surviving weights span the
/// whole selection range; other strategies pass through.
fn renormalize(strategy: StrategyKind, mut candidates: Vec<RuleTarget>) -> Vec<RuleTarget> {
    if strategy != StrategyKind::Weighted {
        return candidates;
    }
    let total: f64 = candidates
        .iter()
        .map(|target| target.weight.unwrap_or(0.0))
        .sum();
    if total > 0.0 {
        for target in &mut candidates {
            target.weight = Some(target.weight.unwrap_or(0.0) * 100.0 / total);
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use llmux_provider::{AuthMode, Capabilities, ProviderInstance};
    use llmux_transform::Dialect;

    use crate::events::EventHub;
    use crate::rules::{ConditionOperator, LogicalOperator, RuleCondition};

    fn instance(id: &str) -> ProviderInstance {
        ProviderInstance {
            id: id.to_string(),
            dialect: Dialect::Qwen,
            endpoint: "https://api.example.test/v1".to_string(),
            default_model: "qwen3-coder-plus".to_string(),
            supported_models: vec![],
            capabilities: Capabilities::default(),
            auth_mode: AuthMode::OAuth,
        }
    }

    fn rule(targets: Vec<RuleTarget>) -> RoutingRule {
        RoutingRule {
            id: "claude-route".to_string(),
            priority: 100,
            enabled: true,
            conditions: vec![RuleCondition {
                field: "payload.model".to_string(),
                operator: ConditionOperator::Equals,
                value: json!("claude-router"),
                logical_operator: LogicalOperator::And,
                custom_name: None,
            }],
            strategy: StrategyKind::Weighted,
            targets,
            session_ttl_secs: None,
        }
    }

    fn target(id: &str, weight: f64, fallback: bool) -> RuleTarget {
        RuleTarget {
            composite_id: id.to_string(),
            weight: Some(weight),
            fallback,
        }
    }

    fn query() -> RouteQuery {
        RouteQuery::new(json!({"payload": {"model": "claude-router"}}))
    }

    async fn scheduler_with_pool(ids: &[&str]) -> Scheduler {
        let coordinator = Arc::new(DedupCoordinator::new(EventHub::new(16)));
        for id in ids {
            let (provider, model) = id.split_once('.').unwrap();
            let mut entry = PoolEntry::new(instance(provider), model);
            entry.composite_id = id.to_string();
            coordinator.add_to_pool(entry).await;
        }
        Scheduler::new(coordinator)
    }

    #[tokio::test]
    async fn routes_to_the_matched_rule_target() {
        let scheduler = scheduler_with_pool(&["qwen.qwen3-coder-plus"]).await;
        scheduler.install(SchedulerGeneration {
            rules: vec![rule(vec![target("qwen.qwen3-coder-plus", 100.0, false)])],
        });
        let decision = scheduler.route(&query()).await.unwrap();
        assert_eq!(decision.rule_id, "claude-route");
        assert_eq!(decision.entry.composite_id, "qwen.qwen3-coder-plus");
        assert!(decision.context.execution_id.starts_with("exec_"));
        assert_eq!(decision.context.instance_id, "qwen");
    }

    #[tokio::test]
    async fn unmatched_model_is_not_found() {
        let scheduler = scheduler_with_pool(&["qwen.m"]).await;
        scheduler.install(SchedulerGeneration {
            rules: vec![rule(vec![target("qwen.m", 100.0, false)])],
        });
        let other = RouteQuery::new(json!({"payload": {"model": "unknown"}}));
        let err = scheduler.route(&other).await.unwrap_err();
        assert_eq!(err.code, codes::PIPELINE_NOT_FOUND);
    }

    #[tokio::test]
    async fn blacklisted_candidates_are_filtered_and_weights_renormalized() {
        let scheduler = scheduler_with_pool(&["a.m", "b.m"]).await;
        scheduler.install(SchedulerGeneration {
            rules: vec![rule(vec![
                target("a.m", 70.0, false),
                target("b.m", 30.0, false),
            ])],
        });
        scheduler
            .coordinator()
            .add_to_blacklist(
                "a.m",
                "a",
                PipelineError::new(codes::AUTHENTICATION_FAILED, "down", "test"),
                None,
                true,
            )
            .await;
        // Only b remains; selection must always land on it.
        for _ in 0..10 {
            let decision = scheduler.route(&query()).await.unwrap();
            assert_eq!(decision.entry.composite_id, "b.m");
        }
    }

    #[tokio::test]
    async fn exhausted_candidates_yield_503() {
        let scheduler = scheduler_with_pool(&["a.m"]).await;
        scheduler.install(SchedulerGeneration {
            rules: vec![rule(vec![target("a.m", 100.0, false)])],
        });
        scheduler
            .coordinator()
            .add_to_blacklist(
                "a.m",
                "a",
                PipelineError::new(codes::AUTHENTICATION_FAILED, "down", "test"),
                None,
                true,
            )
            .await;
        let err = scheduler.route(&query()).await.unwrap_err();
        assert_eq!(err.code, codes::NO_AVAILABLE_PIPELINES);
        assert_eq!(err.http_status(), 503);
    }

    #[tokio::test]
    async fn fallback_targets_take_over_when_primaries_die() {
        let scheduler = scheduler_with_pool(&["a.m", "backup.m"]).await;
        scheduler.install(SchedulerGeneration {
            rules: vec![rule(vec![
                target("a.m", 100.0, false),
                target("backup.m", 100.0, true),
            ])],
        });
        // Healthy primary wins.
        let decision = scheduler.route(&query()).await.unwrap();
        assert_eq!(decision.entry.composite_id, "a.m");

        scheduler
            .coordinator()
            .add_to_blacklist(
                "a.m",
                "a",
                PipelineError::new(codes::AUTHENTICATION_FAILED, "down", "test"),
                None,
                true,
            )
            .await;
        let decision = scheduler.route(&query()).await.unwrap();
        assert_eq!(decision.entry.composite_id, "backup.m");
    }

    #[tokio::test]
    async fn hot_reload_swaps_generations_atomically() {
        let scheduler = scheduler_with_pool(&["a.m", "b.m"]).await;
        scheduler.install(SchedulerGeneration {
            rules: vec![rule(vec![target("a.m", 100.0, false)])],
        });
        assert_eq!(
            scheduler.route(&query()).await.unwrap().entry.composite_id,
            "a.m"
        );
        scheduler.install(SchedulerGeneration {
            rules: vec![rule(vec![target("b.m", 100.0, false)])],
        });
        assert_eq!(
            scheduler.route(&query()).await.unwrap().entry.composite_id,
            "b.m"
        );
    }
}
