use serde::{Deserialize, Serialize};
use serde_json::Value;

use llmux_provider::ProviderInstance;
use llmux_sched::RoutingRule;
use llmux_transform::compat::MappingTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
    Conditional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelSettings {
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    pub mode: ExecutionMode,
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelSettings>,
}

/// One module slot inside a template; configuration is module-specific JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInstance {
    pub id: String,
    pub module_id: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConnection {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub kind: String,
}

/// A runnable pipeline description: the instance it talks to, its module
/// arena, and the connection edges between module instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineTemplate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub instance: ProviderInstance,
    pub model: String,
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub modules: Vec<ModuleInstance>,
    #[serde(default)]
    pub connections: Vec<ModuleConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_mapping: Option<MappingTable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mapping: Option<MappingTable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRegistryEntry {
    pub id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyStrategy {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyTable {
    pub version: String,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
    #[serde(default)]
    pub pipeline_templates: Vec<PipelineTemplate>,
    #[serde(default)]
    pub module_registry: Vec<ModuleRegistryEntry>,
    #[serde(default)]
    pub assembly_strategies: Vec<AssemblyStrategy>,
}

impl AssemblyTable {
    pub fn template(&self, id: &str) -> Option<&PipelineTemplate> {
        self.pipeline_templates
            .iter()
            .find(|template| template.id == id)
    }
}
