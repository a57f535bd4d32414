//! CPU load-average component. Reads `/proc/loadavg` and compares the
//! 1-minute load against the host's core count.

use std::path::PathBuf;

use async_trait::async_trait;
use gpud_core::{CheckResult, Component, ExtraInfo, FailureCounter, Health, HealthState, ResultCache};
use serde::Serialize;

const DEFAULT_DEGRADED_MULTIPLIER: f64 = 1.5;
const DEFAULT_UNHEALTHY_MULTIPLIER: f64 = 3.0;

#[derive(Debug, Clone, Serialize)]
pub struct CpuLoad {
    pub load_1m: f64,
    pub load_5m: f64,
    pub load_15m: f64,
    pub num_cpus: usize,
}

pub struct CpuComponent {
    loadavg_path: PathBuf,
    num_cpus: usize,
    degraded_multiplier: f64,
    unhealthy_multiplier: f64,
    counter: FailureCounter,
    cache: ResultCache,
}

impl CpuComponent {
    #[must_use]
    pub fn new(loadavg_path: impl Into<PathBuf>, num_cpus: usize) -> Self {
        Self {
            loadavg_path: loadavg_path.into(),
            num_cpus: num_cpus.max(1),
            degraded_multiplier: DEFAULT_DEGRADED_MULTIPLIER,
            unhealthy_multiplier: DEFAULT_UNHEALTHY_MULTIPLIER,
            counter: FailureCounter::with_default_threshold(),
            cache: ResultCache::new("cpu"),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        let num_cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::new("/proc/loadavg", num_cpus)
    }

    fn read_loadavg(&self) -> Result<CpuLoad, String> {
        let contents = std::fs::read_to_string(&self.loadavg_path).map_err(|e| e.to_string())?;
        let mut fields = contents.split_whitespace();
        let load_1m: f64 = fields.next().ok_or("missing 1m load field")?.parse().map_err(|_| "invalid 1m load")?;
        let load_5m: f64 = fields.next().ok_or("missing 5m load field")?.parse().map_err(|_| "invalid 5m load")?;
        let load_15m: f64 = fields.next().ok_or("missing 15m load field")?.parse().map_err(|_| "invalid 15m load")?;
        Ok(CpuLoad {
            load_1m,
            load_5m,
            load_15m,
            num_cpus: self.num_cpus,
        })
    }
}

#[async_trait]
impl Component for CpuComponent {
    fn name(&self) -> &str {
        "cpu"
    }

    async fn check(&self) -> CheckResult {
        let raw = match self.read_loadavg() {
            Ok(load) => {
                let unhealthy_threshold = self.num_cpus as f64 * self.unhealthy_multiplier;
                let degraded_threshold = self.num_cpus as f64 * self.degraded_multiplier;
                let (health, reason) = if load.load_1m >= unhealthy_threshold {
                    (
                        Health::Unhealthy,
                        format!("1m load {:.2} exceeds {:.2}x cpu count", load.load_1m, self.unhealthy_multiplier),
                    )
                } else if load.load_1m >= degraded_threshold {
                    (
                        Health::Degraded,
                        format!("1m load {:.2} exceeds {:.2}x cpu count", load.load_1m, self.degraded_multiplier),
                    )
                } else {
                    (Health::Healthy, format!("1m load {:.2} within bounds", load.load_1m))
                };
                let data = serde_json::to_value(&load).unwrap_or_default();
                CheckResult::new(self.name(), health, reason).with_extra_info(ExtraInfo::json(data))
            }
            Err(e) => CheckResult::new(self.name(), Health::Unhealthy, "failed to read cpu load average")
                .with_error(e),
        };
        let result = self.counter.apply("read cpu load average", raw);
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

    fn write_loadavg(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    #[tokio::test]
    async fn healthy_when_load_within_bounds() {
        let file = write_loadavg("1.0 0.8 0.5 2/400 12345\n");
        let comp = CpuComponent::new(file.path(), 4);
        let result = comp.check().await;
        assert_eq!(result.health, Health::Healthy);
    }

    #[tokio::test]
    async fn degraded_above_one_point_five_times_cpus() {
        let file = write_loadavg("7.0 6.0 5.0 2/400 12345\n");
        let comp = CpuComponent::new(file.path(), 4);
        let result = comp.check().await;
        assert_eq!(result.health, Health::Degraded);
    }

    #[tokio::test]
    async fn unhealthy_above_three_times_cpus() {
        let file = write_loadavg("13.0 12.0 11.0 2/400 12345\n");
        let comp = CpuComponent::new(file.path(), 4);
        let result = comp.check().await;
        assert_eq!(result.health, Health::Unhealthy);
    }
}
