use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use llmux_sched::{ConditionOperator, RoutingRule, StrategyKind};

use crate::assembly::{AssemblyTable, ExecutionMode, PipelineTemplate};
use crate::scheduler_config::SchedulerConfig;

const MAX_TIMEOUT_MS: u64 = 300_000;
const WEIGHT_SUM_TOLERANCE: f64 = 0.01;
const RECOMMENDED_MAX_CONCURRENCY: u32 = 20;
const LOGGING_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Critical,
    Major,
    Minor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    /// Dotted location of the offending field.
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

impl ValidationReport {
    fn error(&mut self, severity: IssueSeverity, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            severity,
            path: path.into(),
            message: message.into(),
        });
    }

    fn finish(mut self) -> Self {
        self.is_valid = self.errors.is_empty();
        self
    }

    fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.recommendations.extend(other.recommendations);
    }
}

/// Validates both documents and their cross-references. Never mutates.
pub fn validate(assembly: &AssemblyTable, scheduler: &SchedulerConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    report.merge(validate_assembly(assembly));
    report.merge(validate_scheduler(scheduler));
    cross_check(assembly, scheduler, &mut report);
    report.finish()
}

pub fn validate_assembly(assembly: &AssemblyTable) -> ValidationReport {
    let mut report = ValidationReport::default();

    check_unique(
        assembly.routing_rules.iter().map(|rule| rule.id.as_str()),
        "routingRules",
        "ruleId",
        &mut report,
    );
    check_unique(
        assembly
            .pipeline_templates
            .iter()
            .map(|template| template.id.as_str()),
        "pipelineTemplates",
        "templateId",
        &mut report,
    );
    check_unique(
        assembly.module_registry.iter().map(|entry| entry.id.as_str()),
        "moduleRegistry",
        "moduleId",
        &mut report,
    );
    check_unique(
        assembly
            .assembly_strategies
            .iter()
            .map(|strategy| strategy.id.as_str()),
        "assemblyStrategies",
        "strategyId",
        &mut report,
    );

    let template_ids: HashSet<&str> = assembly
        .pipeline_templates
        .iter()
        .map(|template| template.id.as_str())
        .collect();

    for (index, rule) in assembly.routing_rules.iter().enumerate() {
        validate_rule(rule, index, &template_ids, &mut report);
    }
    for (index, template) in assembly.pipeline_templates.iter().enumerate() {
        validate_template(template, index, &mut report);
    }

    report.finish()
}

fn validate_rule(
    rule: &RoutingRule,
    index: usize,
    template_ids: &HashSet<&str>,
    report: &mut ValidationReport,
) {
    let base = format!("routingRules[{index}]");

    if rule.targets.is_empty() {
        report.error(
            IssueSeverity::Critical,
            format!("{base}.targets"),
            "rule has no targets",
        );
    }

    for (target_index, target) in rule.targets.iter().enumerate() {
        if let Some(weight) = target.weight
            && weight < 0.0
        {
            report.error(
                IssueSeverity::Major,
                format!("{base}.targets[{target_index}].weight"),
                "weight must be >= 0",
            );
        }
        // Targets name pool composites "<templateId>.<model>"; the template
        // part must exist.
        let template_part = target
            .composite_id
            .split_once('.')
            .map(|(template, _)| template)
            .unwrap_or(target.composite_id.as_str());
        if !template_ids.contains(template_part) {
            report.error(
                IssueSeverity::Critical,
                format!("{base}.targets[{target_index}].compositeId"),
                format!("unknown pipeline template: {template_part}"),
            );
        }
    }

    if rule.strategy == StrategyKind::Weighted {
        let primaries: Vec<_> = rule
            .targets
            .iter()
            .filter(|target| !target.fallback)
            .collect();
        let sum: f64 = primaries
            .iter()
            .map(|target| target.weight.unwrap_or(0.0))
            .sum();
        if !primaries.is_empty() && (sum - 100.0).abs() > WEIGHT_SUM_TOLERANCE {
            report.error(
                IssueSeverity::Critical,
                format!("{base}.targets"),
                format!("weighted rule weights sum to {sum}, expected 100"),
            );
        }
    }

    for (condition_index, condition) in rule.conditions.iter().enumerate() {
        let path = format!("{base}.conditions[{condition_index}]");
        if condition.field.is_empty() {
            report.error(IssueSeverity::Major, format!("{path}.field"), "empty field path");
        }
        match condition.operator {
            ConditionOperator::Regex => {
                let pattern = condition.value.as_str().unwrap_or_default();
                if let Err(err) = regex::Regex::new(pattern) {
                    report.error(
                        IssueSeverity::Major,
                        format!("{path}.value"),
                        format!("invalid regex: {err}"),
                    );
                }
            }
            ConditionOperator::Custom => {
                if condition.custom_name.as_deref().unwrap_or("").is_empty() {
                    report.error(
                        IssueSeverity::Major,
                        format!("{path}.customName"),
                        "custom operator requires a predicate name",
                    );
                }
            }
            _ => {}
        }
    }
}

fn validate_template(template: &PipelineTemplate, index: usize, report: &mut ValidationReport) {
    let base = format!("pipelineTemplates[{index}]");

    if template.execution.timeout_ms == 0 || template.execution.timeout_ms > MAX_TIMEOUT_MS {
        report.error(
            IssueSeverity::Major,
            format!("{base}.execution.timeoutMs"),
            format!("timeout must be in (0, {MAX_TIMEOUT_MS}] ms"),
        );
    }

    if template.execution.mode == ExecutionMode::Parallel {
        match &template.execution.parallel {
            None => report.error(
                IssueSeverity::Major,
                format!("{base}.execution.parallel"),
                "parallel mode requires parallel settings",
            ),
            Some(parallel) => {
                if parallel.max_concurrency == 0 {
                    report.error(
                        IssueSeverity::Major,
                        format!("{base}.execution.parallel.maxConcurrency"),
                        "maxConcurrency must be > 0",
                    );
                } else if parallel.max_concurrency > RECOMMENDED_MAX_CONCURRENCY {
                    report.recommendations.push(format!(
                        "{base}.execution.parallel.maxConcurrency: values above {RECOMMENDED_MAX_CONCURRENCY} rarely help"
                    ));
                }
            }
        }
    }

    if !template.instance.supports_model(&template.model) {
        report.warnings.push(format!(
            "{base}.model: {} is not in the instance's supported set",
            template.model
        ));
    }

    check_unique(
        template.modules.iter().map(|module| module.id.as_str()),
        &format!("{base}.modules"),
        "moduleInstanceId",
        report,
    );

    let module_ids: HashSet<&str> = template
        .modules
        .iter()
        .map(|module| module.id.as_str())
        .collect();
    for (edge_index, connection) in template.connections.iter().enumerate() {
        let path = format!("{base}.connections[{edge_index}]");
        for endpoint in [&connection.from, &connection.to] {
            if !module_ids.contains(endpoint.as_str()) {
                report.error(
                    IssueSeverity::Major,
                    path.clone(),
                    format!("connection references unknown module instance: {endpoint}"),
                );
            }
        }
    }
    if has_cycle(&template.connections) {
        report.error(
            IssueSeverity::Critical,
            format!("{base}.connections"),
            "module connection graph contains a cycle",
        );
    }
}

pub fn validate_scheduler(config: &SchedulerConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.basic.default_timeout_ms == 0 || config.basic.default_timeout_ms > MAX_TIMEOUT_MS {
        report.error(
            IssueSeverity::Major,
            "basic.defaultTimeoutMs",
            format!("timeout must be in (0, {MAX_TIMEOUT_MS}] ms"),
        );
    }
    if config.basic.max_concurrent_requests == 0 {
        report.error(
            IssueSeverity::Major,
            "basic.maxConcurrentRequests",
            "must be > 0",
        );
    }

    if let Some(health) = &config.health_check
        && health.enabled
    {
        if health.unhealthy_threshold == 0 {
            report.error(
                IssueSeverity::Major,
                "healthCheck.unhealthyThreshold",
                "must be > 0",
            );
        }
        if health.healthy_threshold == 0 {
            report.error(
                IssueSeverity::Major,
                "healthCheck.healthyThreshold",
                "must be > 0",
            );
        }
        if health.interval_ms == 0 {
            report.error(IssueSeverity::Major, "healthCheck.intervalMs", "must be > 0");
        }
    }

    if let Some(error_handling) = &config.error_handling
        && let Some(blacklist) = &error_handling.blacklist
        && blacklist.enabled
        && blacklist.max_entries == 0
    {
        report.error(
            IssueSeverity::Major,
            "errorHandling.blacklist.maxEntries",
            "must be > 0",
        );
    }

    if let Some(monitoring) = &config.monitoring
        && !LOGGING_LEVELS.contains(&monitoring.logging_level.as_str())
    {
        report.error(
            IssueSeverity::Major,
            "monitoring.loggingLevel",
            format!(
                "unknown level {:?}; expected one of {LOGGING_LEVELS:?}",
                monitoring.logging_level
            ),
        );
    }

    for (path, timeout) in [
        ("performance.requestTimeoutMs", config.performance.request_timeout_ms),
        ("performance.streamTimeoutMs", config.performance.stream_timeout_ms),
    ] {
        if let Some(timeout) = timeout
            && (timeout == 0 || timeout > MAX_TIMEOUT_MS)
        {
            report.error(
                IssueSeverity::Major,
                path,
                format!("timeout must be in (0, {MAX_TIMEOUT_MS}] ms"),
            );
        }
    }

    report.finish()
}

/// Cross-document check: every pipeline id the weighted strategy references
/// must exist in the assembly table.
fn cross_check(
    assembly: &AssemblyTable,
    scheduler: &SchedulerConfig,
    report: &mut ValidationReport,
) {
    if scheduler.load_balancing.strategy != StrategyKind::Weighted {
        return;
    }
    let Some(weighted) = &scheduler.load_balancing.strategy_config.weighted else {
        report.error(
            IssueSeverity::Major,
            "loadBalancing.strategyConfig.weighted",
            "weighted strategy requires a weights table",
        );
        return;
    };
    let template_ids: HashSet<&str> = assembly
        .pipeline_templates
        .iter()
        .map(|template| template.id.as_str())
        .collect();
    for pipeline_id in weighted.weights.keys() {
        if !template_ids.contains(pipeline_id.as_str()) {
            report.error(
                IssueSeverity::Critical,
                "loadBalancing.strategyConfig.weighted.weights",
                format!("weight references unknown pipeline: {pipeline_id}"),
            );
        }
    }
}

fn check_unique<'a>(
    ids: impl Iterator<Item = &'a str>,
    path: &str,
    what: &str,
    report: &mut ValidationReport,
) {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for id in ids {
        *seen.entry(id).or_insert(0) += 1;
    }
    for (id, count) in seen {
        if count > 1 {
            report.error(
                IssueSeverity::Critical,
                path.to_string(),
                format!("duplicate {what}: {id}"),
            );
        }
    }
}

/// Kahn-style cycle detection over the connection edges.
fn has_cycle(connections: &[crate::assembly::ModuleConnection]) -> bool {
    let mut nodes: HashSet<&str> = HashSet::new();
    for connection in connections {
        nodes.insert(connection.from.as_str());
        nodes.insert(connection.to.as_str());
    }
    let mut in_degree: HashMap<&str, usize> = nodes.iter().map(|node| (*node, 0)).collect();
    for connection in connections {
        *in_degree.entry(connection.to.as_str()).or_insert(0) += 1;
    }
    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(node, _)| *node)
        .collect();
    let mut visited = 0;
    while let Some(node) = queue.pop() {
        visited += 1;
        for connection in connections {
            if connection.from == node {
                let degree = in_degree.get_mut(connection.to.as_str());
                if let Some(degree) = degree {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(connection.to.as_str());
                    }
                }
            }
        }
    }
    visited != nodes.len()
}
