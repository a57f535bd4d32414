//! One-shot diagnostic scan: builds every built-in component, checks each
//! synchronously, and prints a colored operator-facing report.
//!
//! No custom-plugin specs are built here — scan mode is "what does the
//! fixed built-in set report right now", matching the contract in
//! `spec.md` §4.5.

mod machine_info;
mod nvml_builder;
mod report;

pub use machine_info::{MachineInfo, UnknownMachineInfo};
pub use nvml_builder::{build_nvml_handle, FailureInjector};
pub use report::{ComponentOutcome, ScanReport};

use std::sync::Arc;

use colored::Colorize;
use gpud_components::{
    ContainerdComponent, CpuComponent, DiskComponent, FileDescriptorsComponent, InfinibandComponent,
    KernelModulesComponent, KubeletPodsComponent, MemoryComponent, NetstatComponent,
    NetworkLatencyComponent, NvmlComponent, PortRateExpectation,
};
use gpud_core::Component;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to build nvml instance: {0}")]
    NvmlInit(String),
}

/// Maps a GPU product name to the InfiniBand link rate it's expected to
/// sustain, when known. Unknown products get no expectation installed
/// (the InfiniBand component then never flags a rate shortfall).
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

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub debug: bool,
    pub infiniband_class_root_override: Option<String>,
    pub failure_injector: Option<FailureInjector>,
    pub kubelet_node_name: String,
}

/// Runs the one-shot scan and prints the operator report to stdout.
/// Returns `Ok(ScanReport)` whose `exit_code()` the caller should use as
/// the process exit code; only infrastructure failures (NVML bootstrap)
/// produce an `Err` here, matching "individual Unhealthy does not fail
/// the scan".
pub async fn run_scan(
    options: ScanOptions,
    machine_info: &dyn MachineInfo,
) -> Result<ScanReport, ScanError> {
    let injector = options.failure_injector.clone().unwrap_or_default();
    let nvml = build_nvml_handle(&injector).map_err(ScanError::NvmlInit)?;

    let gpu_product_name = injector
        .product_name_override
        .clone()
        .or_else(|| machine_info.gpu_product_name());

    let expectation = PortRateExpectation {
        expected_rate_gbps: gpu_product_name.as_deref().and_then(expected_ib_rate_gbps),
    };

    let ib_class_root = options
        .infiniband_class_root_override
        .clone()
        .unwrap_or_else(|| "/sys/class/infiniband".to_string());

    let components: Vec<Arc<dyn Component>> = vec![
        Arc::new(CpuComponent::with_defaults()),
        Arc::new(MemoryComponent::with_defaults()),
        Arc::new(DiskComponent::with_defaults()),
        Arc::new(FileDescriptorsComponent::with_defaults()),
        Arc::new(KernelModulesComponent::with_defaults(Vec::new())),
        Arc::new(NetworkLatencyComponent::with_defaults()),
        Arc::new(NetstatComponent::with_defaults()),
        Arc::new(InfinibandComponent::new(ib_class_root, expectation)),
        Arc::new(NvmlComponent::new(nvml)),
        Arc::new(KubeletPodsComponent::with_defaults(options.kubelet_node_name.clone())),
        Arc::new(ContainerdComponent::with_defaults()),
    ];

    let mut outcomes = Vec::with_capacity(components.len());

    for component in &components {
        if !component.is_supported() {
            if options.debug {
                info!(component = component.name(), "skipping unsupported component");
            }
            continue;
        }

        let result = component.check().await;
        print_result(&result);
        outcomes.push(ComponentOutcome {
            name: result.component_name.clone(),
            health: result.health,
            reason: result.reason.clone(),
        });
    }

    Ok(ScanReport { outcomes })
}

fn print_result(result: &gpud_core::CheckResult) {
    let glyph = match result.health {
        gpud_core::Health::Healthy | gpud_core::Health::Initializing => "✓".green(),
        gpud_core::Health::Degraded => "!".yellow(),
        gpud_core::Health::Unhealthy => "✗".red(),
    };
    println!("{} {}", glyph, result.summary());
    println!("{}", result.to_display_string());

    if result.health == gpud_core::Health::Unhealthy {
        error!(component = %result.component_name, reason = %result.reason, "component unhealthy");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scan_completes_and_never_fails_on_individual_unhealthy() {
        let options = ScanOptions {
            kubelet_node_name: "test-node".to_string(),
            ..Default::default()
        };
        let report = run_scan(options, &UnknownMachineInfo).await.unwrap();
        assert_eq!(report.exit_code(), 0);
        assert!(!report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn injected_gpu_lost_surfaces_as_unhealthy_nvml_outcome() {
        let options = ScanOptions {
            kubelet_node_name: "test-node".to_string(),
            failure_injector: Some(FailureInjector {
                gpu_lost: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let report = run_scan(options, &UnknownMachineInfo).await.unwrap();
        let nvml_outcome = report.outcomes.iter().find(|o| o.name == "nvml").unwrap();
        assert_eq!(nvml_outcome.health, gpud_core::Health::Unhealthy);
    }
}
