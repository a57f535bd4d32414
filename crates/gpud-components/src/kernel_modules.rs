//! Kernel-module presence component. Reads `/proc/modules` and checks a
//! configured required-set is loaded.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use gpud_core::{CheckResult, Component, ExtraInfo, FailureCounter, Health, HealthState, ResultCache};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ModuleReport {
    pub loaded: Vec<String>,
    pub missing: Vec<String>,
}

pub struct KernelModulesComponent {
    modules_path: PathBuf,
    required: Vec<String>,
    counter: FailureCounter,
    cache: ResultCache,
}

impl KernelModulesComponent {
    #[must_use]
    pub fn new(modules_path: impl Into<PathBuf>, required: Vec<String>) -> Self {
        Self {
            modules_path: modules_path.into(),
            required,
            counter: FailureCounter::with_default_threshold(),
            cache: ResultCache::new("kernel_modules"),
        }
    }

    #[must_use]
    pub fn with_defaults(required: Vec<String>) -> Self {
        Self::new("/proc/modules", required)
    }

    fn loaded_modules(&self) -> Result<HashSet<String>, String> {
        let contents = std::fs::read_to_string(&self.modules_path).map_err(|e| e.to_string())?;
        Ok(contents
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl Component for KernelModulesComponent {
    fn name(&self) -> &str {
        "kernel_modules"
    }

    fn is_supported(&self) -> bool {
        !self.required.is_empty()
    }

    async fn check(&self) -> CheckResult {
        if !self.is_supported() {
            let result = CheckResult::new(self.name(), Health::Healthy, "not applicable");
            self.cache.store(result.clone()).await;
            return result;
        }

        let raw = match self.loaded_modules() {
            Ok(loaded_set) => {
                let missing: Vec<String> = self
                    .required
                    .iter()
                    .filter(|m| !loaded_set.contains(m.as_str()))
                    .cloned()
                    .collect();
                let report = ModuleReport {
                    loaded: self.required.iter().filter(|m| loaded_set.contains(m.as_str())).cloned().collect(),
                    missing: missing.clone(),
                };
                let (health, reason) = if missing.is_empty() {
                    (Health::Healthy, "all required kernel modules loaded".to_string())
                } else {
                    (Health::Unhealthy, format!("missing required kernel module(s): {}", missing.join(", ")))
                };
                let data = serde_json::to_value(&report).unwrap_or_default();
                CheckResult::new(self.name(), health, reason).with_extra_info(ExtraInfo::json(data))
            }
            Err(e) => CheckResult::new(self.name(), Health::Unhealthy, "failed to read /proc/modules").with_error(e),
        };
        let result = self.counter.apply("check required kernel modules", raw);
        self.cache.store(result.clone()).await;
        result
    }

    async fn last_health_states(&self) -> Vec<HealthState> {
        self.cache.last_health_states().await
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_modules(names: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for name in names {
            writeln!(file, "{name} 12345 0 - Live 0x0000000000000000").unwrap();
        }
        file
    }

    #[tokio::test]
    async fn healthy_when_all_required_present() {
        let file = write_modules(&["nvidia", "ib_core"]);
        let comp = KernelModulesComponent::new(file.path(), vec!["nvidia".to_string(), "ib_core".to_string()]);
        assert_eq!(comp.check().await.health, Health::Healthy);
    }

    #[tokio::test]
    async fn unhealthy_when_required_module_absent() {
        let file = write_modules(&["nvidia"]);
        let comp = KernelModulesComponent::new(file.path(), vec!["nvidia".to_string(), "ib_core".to_string()]);
        let result = comp.check().await;
        assert_eq!(result.health, Health::Unhealthy);
        assert!(result.reason.contains("ib_core"));
    }

    #[tokio::test]
    async fn not_applicable_when_no_required_modules_configured() {
        let file = write_modules(&[]);
        let comp = KernelModulesComponent::new(file.path(), vec![]);
        let result = comp.check().await;
        assert_eq!(result.health, Health::Healthy);
        assert_eq!(result.reason, "not applicable");
    }
}
