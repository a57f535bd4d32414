//! Daemon bootstrap: load config, assemble the shared `Instance`, register
//! every built-in component, load custom-plugin specs, and run `init`-type
//! plugins synchronously before the registry starts serving.
//!
//! Sequence, per `SPEC_FULL.md` §4.1: load config -> construct `Instance`
//! -> run `init`-type plugin specs (fatal on failure) -> construct built-in
//! `InitFunc`s -> `Register` all of them -> `Start` every component.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gpud_components::{
    ContainerdComponent, CpuComponent, DiskComponent, FileDescriptorsComponent, InfinibandComponent,
    KernelModulesComponent, KubeletPodsComponent, MemoryComponent, NetstatComponent,
    NetworkLatencyComponent, NvmlComponent, PortRateExpectation,
};
use gpud_core::{Component, Instance, MountConfig, NoopNvmlHandle, NullEventStore, Registry, Schedule};
use gpud_persistence::SqliteLedger;
use gpud_plugins::{PluginComponent, PluginManager, PluginSpec, PluginType};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ComponentSchedule, GpudConfig};

/// Everything the `serve`/`scan` subcommands need after bootstrap.
pub struct Daemon {
    pub registry: Arc<Registry>,
    pub plugin_manager: Arc<PluginManager>,
    pub plugin_specs: Arc<tokio::sync::RwLock<HashMap<String, PluginSpec>>>,
    pub bash_path: String,
    pub plugin_minimum_retry: Duration,
}

fn schedule_for(name: &str, config: &GpudConfig) -> Schedule {
    let mut schedule = Schedule::default();
    if let Some(ComponentSchedule { interval_secs, timeout_secs }) = config.component_schedules.get(name) {
        if let Some(secs) = interval_secs {
            schedule.interval = Duration::from_secs(*secs);
        }
        if let Some(secs) = timeout_secs {
            schedule.timeout = Duration::from_secs(*secs);
        }
    }
    schedule
}

/// Build the `Instance` every component constructor receives. The NVML
/// handle is always the no-op implementation here: the real NVML C
/// bindings are an external collaborator this core never links against
/// (`spec.md` §1), so this binary only demonstrates the seam a real NVML
/// crate would plug into.
async fn build_instance(config: &GpudConfig, root_cancellation: CancellationToken) -> Result<Instance> {
    let ledger = SqliteLedger::open(
        config.ledger_db_path.to_string_lossy().as_ref(),
        gpud_persistence::DEFAULT_TABLE_NAME,
    )
    .await
    .context("failed to open plugin ledger")?;

    let mut tools = gpud_core::ToolOverrides::default();
    for (tool, path) in &config.tool_overrides {
        tools.set(tool.clone(), path.clone());
    }

    Ok(Instance {
        root_cancellation,
        nvml: Arc::new(NoopNvmlHandle),
        tools,
        events: Arc::new(NullEventStore),
        mounts: MountConfig {
            mount_points: config.mount_points.clone(),
            infiniband_class_root: config.infiniband_class_root.clone(),
        },
        ledger: Arc::new(ledger),
    })
}

fn expected_ib_rate_gbps(product_name: &str) -> Option<f64> {
    let lower = product_name.to_lowercase();
    if lower.contains("h100") || lower.contains("h200") {
        Some(400.0)
    } else if lower.contains("a100") {
        Some(200.0)
    } else {
        None
    }
}

fn build_builtins(instance: &Instance, config: &GpudConfig) -> Vec<Arc<dyn Component>> {
    let ib_class_root = config
        .infiniband_class_root
        .clone()
        .unwrap_or_else(|| "/sys/class/infiniband".to_string());
    let expectation = PortRateExpectation {
        expected_rate_gbps: instance.nvml.product_name().as_deref().and_then(expected_ib_rate_gbps),
    };

    vec![
        Arc::new(CpuComponent::with_defaults()),
        Arc::new(MemoryComponent::with_defaults()),
        Arc::new(DiskComponent::new(config.mount_points.clone())),
        Arc::new(FileDescriptorsComponent::with_defaults()),
        Arc::new(KernelModulesComponent::with_defaults(config.required_kernel_modules.clone())),
        Arc::new(NetworkLatencyComponent::with_defaults()),
        Arc::new(NetstatComponent::with_defaults()),
        Arc::new(InfinibandComponent::new(ib_class_root, expectation)),
        Arc::new(NvmlComponent::new(instance.nvml.clone())),
        Arc::new(KubeletPodsComponent::with_defaults(config.node_name.clone())),
        Arc::new(ContainerdComponent::with_defaults()),
    ]
}

/// Load the plugin spec file, if configured. A missing path is not an
/// error (a daemon with no custom plugins configured is normal); a
/// present-but-malformed file is fatal, matching "Failure of any init is
/// fatal at bootstrap" for the init-type subset and the general
/// "Unknown keys are rejected" contract for the rest.
fn load_plugin_specs(config: &GpudConfig) -> Result<Vec<PluginSpec>> {
    let Some(path) = &config.plugin_spec_path else {
        return Ok(Vec::new());
    };

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plugin spec file {}", path.display()))?;

    let specs = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        PluginSpec::from_json(&contents)
    } else {
        PluginSpec::from_yaml(&contents)
    }
    .with_context(|| format!("failed to parse plugin spec file {}", path.display()))?;

    for spec in &specs {
        spec.validate().with_context(|| format!("invalid plugin spec '{}'", spec.plugin_name))?;
    }

    Ok(specs)
}

/// Run the bootstrap sequence and return a ready-to-serve [`Daemon`].
/// `init`-type plugin specs run synchronously here, before any built-in is
/// registered; their failure aborts bootstrap entirely.
pub async fn bootstrap(config: &GpudConfig, root_cancellation: CancellationToken) -> Result<Daemon> {
    let instance = build_instance(config, root_cancellation).await?;
    let registry = Arc::new(Registry::new(instance.root_cancellation.clone()));

    let plugin_manager = Arc::new(PluginManager::new(instance.ledger.clone(), config.plugin_qps));
    let bash_path = instance.tools.get("bash").to_string();
    let minimum_retry = Duration::from_secs(config.plugin_minimum_retry_secs);
    let plugin_specs: Arc<tokio::sync::RwLock<HashMap<String, PluginSpec>>> =
        Arc::new(tokio::sync::RwLock::new(HashMap::new()));

    let specs = load_plugin_specs(config)?;
    for spec in specs {
        if spec.plugin_type == PluginType::Init {
            info!(plugin = %spec.plugin_name, "running init plugin synchronously");
            let component = PluginComponent::new(spec.clone(), plugin_manager.clone(), bash_path.clone(), minimum_retry);
            let result = component.check().await;
            if result.error.is_some() {
                anyhow::bail!("init plugin '{}' failed: {}", spec.plugin_name, result.reason);
            }
            continue;
        }

        register_plugin(&registry, &plugin_specs, &plugin_manager, &bash_path, minimum_retry, spec)
            .await
            .with_context(|| "failed to register plugin from spec file")?;
    }

    for component in build_builtins(&instance, config) {
        let schedule = schedule_for(component.name(), config);
        registry
            .register(component, Some(schedule))
            .await
            .context("failed to register built-in component")?;
    }

    info!("bootstrap complete");

    Ok(Daemon {
        registry,
        plugin_manager,
        plugin_specs,
        bash_path,
        plugin_minimum_retry: minimum_retry,
    })
}

/// Build the synthesized component and its schedule for a `component`-type
/// plugin spec: `auto` plugins get a schedule (their own interval, or the
/// driver default when `interval_secs` is 0); `manual` plugins get no
/// schedule at all, so only `TriggerCheck` ever runs them.
fn plugin_component_and_schedule(
    spec: &PluginSpec,
    plugin_manager: &Arc<PluginManager>,
    bash_path: &str,
    minimum_retry: Duration,
) -> (Arc<PluginComponent>, Option<Schedule>) {
    let component = Arc::new(PluginComponent::new(
        spec.clone(),
        plugin_manager.clone(),
        bash_path.to_string(),
        minimum_retry,
    ));

    if spec.mode == gpud_plugins::PluginMode::Manual {
        return (component, None);
    }

    let mut schedule = Schedule::default();
    schedule.timeout = spec.timeout();
    if let Some(interval) = spec.interval() {
        schedule.interval = interval;
    }
    (component, Some(schedule))
}

/// Register a new `component`-type plugin. Fails with `AlreadyExists` if
/// the derived component name is already taken (bubbled up from
/// `Registry::register`).
pub async fn register_plugin(
    registry: &Registry,
    plugin_specs: &tokio::sync::RwLock<HashMap<String, PluginSpec>>,
    plugin_manager: &Arc<PluginManager>,
    bash_path: &str,
    minimum_retry: Duration,
    spec: PluginSpec,
) -> Result<()> {
    spec.validate()?;
    let name = spec.component_name();
    let (component, schedule) = plugin_component_and_schedule(&spec, plugin_manager, bash_path, minimum_retry);
    registry.register(component, schedule).await?;
    plugin_specs.write().await.insert(name, spec);
    Ok(())
}

/// Replace an existing plugin component in place (`Update`), matching
/// `spec.md` §4.1: the old component's `Close` runs first, then the
/// replacement is registered under the same name.
pub async fn update_plugin(
    registry: &Registry,
    plugin_specs: &tokio::sync::RwLock<HashMap<String, PluginSpec>>,
    plugin_manager: &Arc<PluginManager>,
    bash_path: &str,
    minimum_retry: Duration,
    spec: PluginSpec,
) -> Result<()> {
    spec.validate()?;
    let name = spec.component_name();
    let (component, schedule) = plugin_component_and_schedule(&spec, plugin_manager, bash_path, minimum_retry);
    registry.update(&name, component, schedule).await?;
    plugin_specs.write().await.insert(name, spec);
    Ok(())
}
