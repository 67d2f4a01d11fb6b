use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::{info, warn};

use llmux_auth::{
    AuthHandler, AuthHandlerConfig, CredentialHandle, CredentialStore, Reauthenticator, Refresher,
    StoreError,
};
use llmux_config::{AssemblyTable, PipelineTemplate, SchedulerConfig, validate};
use llmux_pipeline::{
    AdapterRegistry, ExecutorConfig, InstanceMappings, PipelineExecutor,
};
use llmux_provider::{
    AdapterConfig, AnthropicAdapter, AuthMode, DeviceFlowReauthenticator, HttpTokenTransport,
    NoReauthenticator, NoRefresher, OpenAiCompatAdapter, ProviderAdapter, ReqwestUpstreamClient,
    TokenRefresher, UpstreamClient, oauth_endpoints,
};
use llmux_sched::{
    DedupCoordinator, ErrorCenter, ErrorCenterConfig, EventHub, PoolEntry, RetryPolicy,
    Scheduler, SchedulerGeneration, TracingEventSink,
};
use llmux_server::{AppState, InstanceHealth};
use llmux_transform::{Dialect, TransformerRegistry, WireFamily};

pub(crate) struct Runtime {
    pub(crate) state: AppState,
}

pub(crate) fn load_documents(dir: &Path) -> anyhow::Result<(AssemblyTable, SchedulerConfig)> {
    let assembly_path = dir.join("assembly.json");
    let assembly: AssemblyTable = serde_json::from_str(
        &std::fs::read_to_string(&assembly_path)
            .with_context(|| format!("read {}", assembly_path.display()))?,
    )
    .with_context(|| format!("parse {}", assembly_path.display()))?;

    let scheduler_path = dir.join("scheduler.json");
    let scheduler: SchedulerConfig = serde_json::from_str(
        &std::fs::read_to_string(&scheduler_path)
            .with_context(|| format!("read {}", scheduler_path.display()))?,
    )
    .with_context(|| format!("parse {}", scheduler_path.display()))?;

    Ok((assembly, scheduler))
}

/// Validates the documents and assembles the running system.
pub(crate) async fn bootstrap(dir: &Path) -> anyhow::Result<Runtime> {
    let (assembly, scheduler_config) = load_documents(dir)?;

    let report = validate(&assembly, &scheduler_config);
    for warning in &report.warnings {
        warn!(event = "config_warning", message = %warning);
    }
    for recommendation in &report.recommendations {
        info!(event = "config_recommendation", message = %recommendation);
    }
    if !report.is_valid {
        for issue in &report.errors {
            warn!(
                event = "config_error",
                severity = ?issue.severity,
                path = %issue.path,
                message = %issue.message
            );
        }
        bail!("configuration rejected: {} error(s)", report.errors.len());
    }

    let events = EventHub::new(256);
    events.add_sink(Arc::new(TracingEventSink)).await;
    let coordinator = Arc::new(DedupCoordinator::new(events));

    let error_handling = scheduler_config.error_handling.clone().unwrap_or(
        llmux_config::ErrorHandlingConfig {
            max_retries: 2,
            blacklist: None,
        },
    );
    let blacklist = error_handling.blacklist.clone().unwrap_or(
        llmux_config::BlacklistConfig {
            enabled: true,
            max_entries: 128,
            default_ttl_ms: 60_000,
            cleanup_interval_ms: 60_000,
        },
    );
    let center = Arc::new(ErrorCenter::new(
        ErrorCenterConfig {
            retry: RetryPolicy {
                max_retries: error_handling.max_retries,
                ..RetryPolicy::default()
            },
            blacklist_ttl: Duration::from_millis(blacklist.default_ttl_ms),
            cleanup_interval: Duration::from_millis(blacklist.cleanup_interval_ms),
            ..ErrorCenterConfig::default()
        },
        coordinator.clone(),
    ));
    center.spawn_reaper();

    let scheduler = Arc::new(Scheduler::new(coordinator.clone()));
    scheduler.install(SchedulerGeneration {
        rules: assembly.routing_rules.clone(),
    });

    let client: Arc<dyn UpstreamClient> =
        Arc::new(ReqwestUpstreamClient::new(None).context("build upstream client")?);
    let adapter_config = AdapterConfig {
        chat_timeout: Duration::from_millis(
            scheduler_config.performance.request_timeout_ms.unwrap_or(30_000),
        ),
        stream_timeout: Duration::from_millis(
            scheduler_config.performance.stream_timeout_ms.unwrap_or(60_000),
        ),
        max_retries: error_handling.max_retries,
    };

    let mut adapters = AdapterRegistry::new();
    let mut mappings: HashMap<String, InstanceMappings> = HashMap::new();
    let mut instances = Vec::new();
    for template in &assembly.pipeline_templates {
        let composite = format!("{}.{}", template.id, template.model);
        let mut entry = PoolEntry::new(template.instance.clone(), template.model.clone());
        entry.composite_id = composite.clone();
        coordinator.add_to_pool(entry).await;

        let built = build_adapter(template, client.clone(), adapter_config.clone())?;
        adapters.register(built.adapter);
        instances.push(built.health);
        mappings.insert(
            composite,
            InstanceMappings {
                request: template.request_mapping.clone(),
                response: template.response_mapping.clone(),
            },
        );
    }

    let executor = PipelineExecutor::new(
        TransformerRegistry::with_builtins(),
        adapters,
        mappings,
        scheduler,
        center,
        ExecutorConfig {
            execution_timeout: Duration::from_millis(scheduler_config.basic.default_timeout_ms),
            ..ExecutorConfig::default()
        },
    );

    Ok(Runtime {
        state: AppState {
            executor: Arc::new(executor),
            coordinator,
            instances: Arc::new(instances),
            include_stack_traces: scheduler_config.security.include_stack_traces,
        },
    })
}

struct BuiltInstance {
    adapter: Arc<dyn ProviderAdapter>,
    health: InstanceHealth,
}

fn build_adapter(
    template: &PipelineTemplate,
    client: Arc<dyn UpstreamClient>,
    config: AdapterConfig,
) -> anyhow::Result<BuiltInstance> {
    let instance = template.instance.clone();
    let store = CredentialStore::new();
    let path = CredentialStore::default_path(&instance.id);
    let handle = match store.load(&path) {
        Ok(handle) => handle,
        Err(StoreError::NotFound) => {
            if instance.auth_mode != AuthMode::None {
                warn!(
                    event = "credentials_missing",
                    instance = %instance.id,
                    path = %path.display()
                );
            }
            CredentialHandle::Empty
        }
        Err(err) => bail!("load credentials for {}: {err}", instance.id),
    };
    let auth = Arc::new(AuthHandler::new(
        store,
        path,
        handle,
        AuthHandlerConfig::default(),
    ));

    let (refresher, reauthenticator): (Arc<dyn Refresher>, Arc<dyn Reauthenticator>) =
        match oauth_endpoints(instance.dialect) {
            Some(endpoints) => {
                let transport =
                    Arc::new(HttpTokenTransport::new(None).context("build token transport")?);
                (
                    Arc::new(TokenRefresher::new(transport.clone(), endpoints.refresh)),
                    Arc::new(DeviceFlowReauthenticator::new(transport, endpoints.device)),
                )
            }
            None => (Arc::new(NoRefresher), Arc::new(NoReauthenticator)),
        };

    let health = InstanceHealth {
        instance_id: instance.id.clone(),
        auth: auth.clone(),
        refresher: refresher.clone(),
        reauthenticator: reauthenticator.clone(),
        requires_auth: instance.auth_mode != AuthMode::None,
    };
    let adapter: Arc<dyn ProviderAdapter> = match instance.dialect.family() {
        WireFamily::OpenAi => Arc::new(OpenAiCompatAdapter::new(
            instance, client, auth, refresher, reauthenticator, config,
        )),
        WireFamily::Anthropic => Arc::new(AnthropicAdapter::new(
            instance, client, auth, refresher, reauthenticator, config,
        )),
    };
    Ok(BuiltInstance { adapter, health })
}

/// Device-flow enrollment for one provider instance.
pub(crate) async fn login(provider: &str, dialect: &str) -> anyhow::Result<()> {
    let dialect: Dialect = serde_json::from_value(serde_json::Value::String(
        dialect.to_string(),
    ))
    .map_err(|_| anyhow::anyhow!("unknown dialect: {dialect}"))?;
    let Some(endpoints) = oauth_endpoints(dialect) else {
        bail!("dialect {dialect:?} does not enroll via device flow; configure an API key instead");
    };

    let transport = HttpTokenTransport::new(None).context("build token transport")?;
    let tokens = llmux_auth::DeviceFlow::new(&transport, endpoints.device)
        .on_verification(|authorization| {
            println!("Open {} and enter code {}", authorization.open_url(), authorization.user_code);
        })
        .run()
        .await
        .context("device flow failed")?;

    let store = CredentialStore::new();
    let path = CredentialStore::default_path(provider);
    store
        .save(&CredentialHandle::OAuth(tokens), &path)
        .with_context(|| format!("persist credentials to {}", path.display()))?;
    println!("Credentials saved to {}", path.display());
    Ok(())
}
