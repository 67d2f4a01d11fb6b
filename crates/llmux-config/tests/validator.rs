use std::collections::HashMap;

use llmux_config::{
    AssemblyTable, ExecutionMode, ExecutionSettings, IssueSeverity, LoadBalancingConfig,
    ModuleConnection, ModuleInstance, ParallelSettings, PipelineTemplate, SchedulerConfig,
    WeightedConfig, validate,
};
use llmux_config::scheduler_config::{BasicConfig, StrategyConfig};
use llmux_provider::{AuthMode, Capabilities, ProviderInstance};
use llmux_sched::{
    ConditionOperator, LogicalOperator, RoutingRule, RuleCondition, RuleTarget, StrategyKind,
};
use llmux_transform::Dialect;

fn instance() -> ProviderInstance {
    ProviderInstance {
        id: "qwen-main".to_string(),
        dialect: Dialect::Qwen,
        endpoint: "https://api.example.test/v1".to_string(),
        default_model: "qwen3-coder-plus".to_string(),
        supported_models: vec!["qwen3-coder-plus".to_string()],
        capabilities: Capabilities::default(),
        auth_mode: AuthMode::OAuth,
    }
}

fn template(id: &str) -> PipelineTemplate {
    PipelineTemplate {
        id: id.to_string(),
        description: None,
        instance: instance(),
        model: "qwen3-coder-plus".to_string(),
        execution: ExecutionSettings {
            mode: ExecutionMode::Sequential,
            timeout_ms: 30_000,
            parallel: None,
        },
        modules: Vec::new(),
        connections: Vec::new(),
        request_mapping: None,
        response_mapping: None,
    }
}

fn rule(id: &str, strategy: StrategyKind, weights: &[(&str, f64)]) -> RoutingRule {
    RoutingRule {
        id: id.to_string(),
        priority: 100,
        enabled: true,
        conditions: vec![RuleCondition {
            field: "payload.model".to_string(),
            operator: ConditionOperator::Equals,
            value: serde_json::json!("claude-router"),
            logical_operator: LogicalOperator::And,
            custom_name: None,
        }],
        strategy,
        targets: weights
            .iter()
            .map(|(target, weight)| RuleTarget {
                composite_id: format!("{target}.qwen3-coder-plus"),
                weight: Some(*weight),
                fallback: false,
            })
            .collect(),
        session_ttl_secs: None,
    }
}

fn assembly() -> AssemblyTable {
    AssemblyTable {
        version: "1".to_string(),
        routing_rules: vec![rule("r1", StrategyKind::Weighted, &[("p1", 100.0)])],
        pipeline_templates: vec![template("p1")],
        module_registry: Vec::new(),
        assembly_strategies: Vec::new(),
    }
}

fn scheduler() -> SchedulerConfig {
    SchedulerConfig {
        basic: BasicConfig {
            name: "default".to_string(),
            max_concurrent_requests: 64,
            default_timeout_ms: 30_000,
        },
        load_balancing: LoadBalancingConfig {
            strategy: StrategyKind::Weighted,
            strategy_config: StrategyConfig {
                weighted: Some(WeightedConfig {
                    weights: HashMap::from([("p1".to_string(), 100.0)]),
                }),
            },
        },
        health_check: None,
        error_handling: None,
        performance: Default::default(),
        monitoring: None,
        security: Default::default(),
    }
}

#[test]
fn valid_documents_pass() {
    let report = validate(&assembly(), &scheduler());
    assert!(report.is_valid, "unexpected errors: {:?}", report.errors);
}

#[test]
fn missing_weighted_pipeline_is_one_critical_error() {
    let mut config = scheduler();
    config.load_balancing.strategy_config.weighted = Some(WeightedConfig {
        weights: HashMap::from([("p-missing".to_string(), 100.0)]),
    });
    let report = validate(&assembly(), &config);
    assert!(!report.is_valid);
    let cross_errors: Vec<_> = report
        .errors
        .iter()
        .filter(|issue| issue.path == "loadBalancing.strategyConfig.weighted.weights")
        .collect();
    assert_eq!(cross_errors.len(), 1);
    assert_eq!(cross_errors[0].severity, IssueSeverity::Critical);
}

#[test]
fn weighted_sum_must_be_one_hundred() {
    let mut table = assembly();
    table.routing_rules =
        vec![rule("r1", StrategyKind::Weighted, &[("p1", 70.0), ("p1", 40.0)])];
    let report = validate(&table, &scheduler());
    assert!(report.errors.iter().any(|issue| issue
        .message
        .contains("weights sum to 110")));

    // Within tolerance passes.
    let mut table = assembly();
    table.routing_rules =
        vec![rule("r1", StrategyKind::Weighted, &[("p1", 60.004), ("p1", 39.999)])];
    let report = validate(&table, &scheduler());
    assert!(
        !report
            .errors
            .iter()
            .any(|issue| issue.message.contains("weights sum")),
        "sum within 0.01 of 100 must pass"
    );
}

#[test]
fn duplicate_ids_are_critical() {
    let mut table = assembly();
    table.pipeline_templates.push(template("p1"));
    let report = validate(&table, &scheduler());
    assert!(report.errors.iter().any(|issue| {
        issue.severity == IssueSeverity::Critical && issue.message.contains("duplicate templateId")
    }));
}

#[test]
fn unknown_rule_target_template_is_critical() {
    let mut table = assembly();
    table.routing_rules = vec![rule("r1", StrategyKind::Fixed, &[("ghost", 100.0)])];
    let report = validate(&table, &scheduler());
    assert!(report.errors.iter().any(|issue| issue
        .message
        .contains("unknown pipeline template: ghost")));
}

#[test]
fn timeout_bounds_are_enforced() {
    let mut table = assembly();
    table.pipeline_templates[0].execution.timeout_ms = 300_001;
    let report = validate(&table, &scheduler());
    assert!(!report.is_valid);

    let mut config = scheduler();
    config.basic.default_timeout_ms = 0;
    let report = validate(&assembly(), &config);
    assert!(!report.is_valid);
}

#[test]
fn parallel_mode_requires_sane_concurrency() {
    let mut table = assembly();
    table.pipeline_templates[0].execution.mode = ExecutionMode::Parallel;
    table.pipeline_templates[0].execution.parallel = Some(ParallelSettings {
        max_concurrency: 0,
    });
    let report = validate(&table, &scheduler());
    assert!(!report.is_valid);

    let mut table = assembly();
    table.pipeline_templates[0].execution.mode = ExecutionMode::Parallel;
    table.pipeline_templates[0].execution.parallel = Some(ParallelSettings {
        max_concurrency: 64,
    });
    let report = validate(&table, &scheduler());
    assert!(report.is_valid);
    assert!(!report.recommendations.is_empty());
}

#[test]
fn connection_cycles_are_rejected() {
    let mut table = assembly();
    table.pipeline_templates[0].modules = vec![
        ModuleInstance {
            id: "a".to_string(),
            module_id: "switch".to_string(),
            config: serde_json::Value::Null,
        },
        ModuleInstance {
            id: "b".to_string(),
            module_id: "mapper".to_string(),
            config: serde_json::Value::Null,
        },
    ];
    table.pipeline_templates[0].connections = vec![
        ModuleConnection {
            from: "a".to_string(),
            to: "b".to_string(),
            kind: "data".to_string(),
        },
        ModuleConnection {
            from: "b".to_string(),
            to: "a".to_string(),
            kind: "data".to_string(),
        },
    ];
    let report = validate(&table, &scheduler());
    assert!(report.errors.iter().any(|issue| issue.message.contains("cycle")));
}

#[test]
fn invalid_regex_and_logging_level_are_rejected() {
    let mut table = assembly();
    table.routing_rules[0].conditions.push(RuleCondition {
        field: "payload.model".to_string(),
        operator: ConditionOperator::Regex,
        value: serde_json::json!("[unclosed"),
        logical_operator: LogicalOperator::And,
        custom_name: None,
    });
    let report = validate(&table, &scheduler());
    assert!(report.errors.iter().any(|issue| issue.message.contains("invalid regex")));

    let mut config = scheduler();
    config.monitoring = Some(llmux_config::MonitoringConfig {
        enabled: true,
        logging_level: "verbose".to_string(),
    });
    let report = validate(&assembly(), &config);
    assert!(report.errors.iter().any(|issue| issue.path == "monitoring.loggingLevel"));
}

#[test]
fn blacklist_max_entries_must_be_positive() {
    let mut config = scheduler();
    config.error_handling = Some(llmux_config::ErrorHandlingConfig {
        max_retries: 2,
        blacklist: Some(llmux_config::BlacklistConfig {
            enabled: true,
            max_entries: 0,
            default_ttl_ms: 60_000,
            cleanup_interval_ms: 60_000,
        }),
    });
    let report = validate(&assembly(), &config);
    assert!(report.errors.iter().any(|issue| issue.path == "errorHandling.blacklist.maxEntries"));
}
