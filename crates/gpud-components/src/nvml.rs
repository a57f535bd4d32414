//! NVML-backed GPU counters component. Wraps the shared
//! [`gpud_core::NvmlHandle`] capability; the C bindings themselves are out
//! of scope, this component only consumes the trait.

use std::sync::Arc;

use async_trait::async_trait;
use gpud_core::{CheckResult, Component, ExtraInfo, FailureCounter, Health, HealthState, NvmlHandle, ResultCache};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
struct DeviceReport {
    index: u32,
    uuid: String,
    product_name: String,
    temperature_celsius: Option<u32>,
    ecc_volatile_sbe: u64,
    ecc_volatile_dbe: u64,
    xid_errors: Vec<u32>,
    gpu_lost: bool,
    reset_required: bool,
}

pub struct NvmlComponent {
    handle: Arc<dyn NvmlHandle>,
    counter: FailureCounter,
    cache: ResultCache,
}

impl NvmlComponent {
    #[must_use]
    pub fn new(handle: Arc<dyn NvmlHandle>) -> Self {
        Self {
            handle,
            counter: FailureCounter::with_default_threshold(),
            cache: ResultCache::new("nvml"),
        }
    }
}

#[async_trait]
impl Component for NvmlComponent {
    fn name(&self) -> &str {
        "nvml"
    }

    fn is_supported(&self) -> bool {
        self.handle.is_available()
    }

    async fn check(&self) -> CheckResult {
        if !self.is_supported() {
            let result = CheckResult::new(self.name(), Health::Healthy, "not applicable");
            self.cache.store(result.clone()).await;
            return result;
        }

        let raw = match self.handle.devices() {
            Ok(devices) => {
                let reports: Vec<DeviceReport> = devices
                    .iter()
                    .map(|d| DeviceReport {
                        index: d.index,
                        uuid: d.uuid.clone(),
                        product_name: d.product_name.clone(),
                        temperature_celsius: d.temperature_celsius,
                        ecc_volatile_sbe: d.ecc_volatile_sbe,
                        ecc_volatile_dbe: d.ecc_volatile_dbe,
                        xid_errors: d.xid_errors.clone(),
                        gpu_lost: d.gpu_lost,
                        reset_required: d.reset_required,
                    })
                    .collect();

                let lost: Vec<&DeviceReport> = reports.iter().filter(|d| d.gpu_lost).collect();
                let reset: Vec<&DeviceReport> = reports.iter().filter(|d| d.reset_required).collect();

                let (health, reason) = if !lost.is_empty() {
                    (Health::Unhealthy, format!("{} gpu(s) reported lost", lost.len()))
                } else if !reset.is_empty() {
                    (Health::Degraded, format!("{} gpu(s) require reset", reset.len()))
                } else {
                    (Health::Healthy, format!("{} gpu(s) reporting normally", reports.len()))
                };

                let data = serde_json::to_value(&reports).unwrap_or_default();
                CheckResult::new(self.name(), health, reason).with_extra_info(ExtraInfo::json(data))
            }
            Err(e) => {
                CheckResult::new(self.name(), Health::Unhealthy, "failed to read nvml device status")
                    .with_error(e.to_string())
            }
        };

        let result = self.counter.apply("read nvml device status", raw);
        self.cache.store(result.clone()).await;
        result
    }

    async fn last_health_states(&self) -> Vec<HealthState> {
        self.cache.last_health_states().await
    }

    async fn close(&self) {}
}
