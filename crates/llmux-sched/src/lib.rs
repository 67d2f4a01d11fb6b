//! Scheduling and instance health: routing-rule evaluation, selection
//! strategies, the blacklist/pool registry behind the deduplication
//! coordinator, and the error-handling center.

pub mod blacklist;
pub mod dedup;
pub mod error_center;
pub mod events;
pub mod pool;
pub mod rules;
pub mod scheduler;
pub mod strategy;

pub use blacklist::BlacklistEntry;
pub use dedup::{AuditReport, DedupCoordinator, DuplicateCheck, DuplicateOp};
pub use error_center::{Action, ActionKind, ErrorCenter, ErrorCenterConfig, ErrorStats, RetryPolicy};
pub use events::{Event, EventHub, EventSink, OperationalEvent, TracingEventSink};
pub use pool::PoolEntry;
pub use rules::{
    ConditionOperator, LogicalOperator, RouteQuery, RoutingRule, RuleCondition, RuleTarget,
    StrategyKind, evaluate_rules,
};
pub use scheduler::{RouteDecision, Scheduler, SchedulerGeneration};
pub use strategy::InstanceSelector;
