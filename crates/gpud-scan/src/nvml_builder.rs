//! Builds the NVML handle the scan hands to [`gpud_components::NvmlComponent`].
//!
//! The NVML C bindings themselves are out of scope (`spec.md` §1); on a
//! real GPU host this would wrap them, but since that library isn't part
//! of this core, the default builder always returns the no-op handle. The
//! [`FailureInjector`] lets tests synthesize fake GPU-lost/reset-required
//! signals without a real device, per the `scan` options in `spec.md`
//! §4.5.

use std::sync::Arc;

use gpud_core::{NoopNvmlHandle, NvmlDeviceStatus, NvmlHandle, Result};

#[derive(Debug, Clone, Default)]
pub struct FailureInjector {
    pub gpu_lost: bool,
    pub reset_required: bool,
    pub fabric_unhealthy: bool,
    pub product_name_override: Option<String>,
}

impl FailureInjector {
    fn is_active(&self) -> bool {
        self.gpu_lost || self.reset_required || self.fabric_unhealthy || self.product_name_override.is_some()
    }
}

struct InjectedNvmlHandle {
    product_name: String,
    gpu_lost: bool,
    reset_required: bool,
}

impl NvmlHandle for InjectedNvmlHandle {
    fn is_available(&self) -> bool {
        true
    }

    fn product_name(&self) -> Option<String> {
        Some(self.product_name.clone())
    }

    fn devices(&self) -> Result<Vec<NvmlDeviceStatus>> {
        Ok(vec![NvmlDeviceStatus {
            index: 0,
            uuid: "GPU-injected-0".to_string(),
            product_name: self.product_name.clone(),
            gpu_lost: self.gpu_lost,
            reset_required: self.reset_required,
            ..Default::default()
        }])
    }
}

/// Construct the NVML handle for this scan run. Any failure here is
/// treated as a bootstrap-fatal error by the caller, per §4.5 step 1.
pub fn build_nvml_handle(injector: &FailureInjector) -> std::result::Result<Arc<dyn NvmlHandle>, String> {
    if injector.is_active() {
        let product_name = injector
            .product_name_override
            .clone()
            .unwrap_or_else(|| "Injected-GPU".to_string());
        return Ok(Arc::new(InjectedNvmlHandle {
            product_name,
            gpu_lost: injector.gpu_lost,
            reset_required: injector.reset_required || injector.fabric_unhealthy,
        }));
    }

    Ok(Arc::new(NoopNvmlHandle))
}
