//! Memory availability component. Reads `/proc/meminfo` and reports
//! degraded/unhealthy when available memory drops below a percentage of
//! total.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use gpud_core::{CheckResult, Component, ExtraInfo, FailureCounter, Health, HealthState, ResultCache};
use serde::Serialize;

const DEGRADED_PCT: f64 = 10.0;
const UNHEALTHY_PCT: f64 = 3.0;

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub total_kb: u64,
    pub available_kb: u64,
    pub available_pct: f64,
}

pub struct MemoryComponent {
    meminfo_path: PathBuf,
    counter: FailureCounter,
    cache: ResultCache,
}

impl MemoryComponent {
    #[must_use]
    pub fn new(meminfo_path: impl Into<PathBuf>) -> Self {
        Self {
            meminfo_path: meminfo_path.into(),
            counter: FailureCounter::with_default_threshold(),
            cache: ResultCache::new("memory"),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new("/proc/meminfo")
    }

    fn read_meminfo(&self) -> Result<MemoryStats, String> {
        let contents = std::fs::read_to_string(&self.meminfo_path).map_err(|e| e.to_string())?;
        let mut fields: HashMap<String, u64> = HashMap::new();
        for line in contents.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            let value_kb = rest
                .trim()
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u64>().ok());
            if let Some(value_kb) = value_kb {
                fields.insert(key.to_string(), value_kb);
            }
        }

        let total_kb = *fields.get("MemTotal").ok_or("missing MemTotal")?;
        let available_kb = fields
            .get("MemAvailable")
            .copied()
            .unwrap_or_else(|| fields.get("MemFree").copied().unwrap_or(0));

        let available_pct = if total_kb == 0 {
            0.0
        } else {
            (available_kb as f64 / total_kb as f64) * 100.0
        };

        Ok(MemoryStats {
            total_kb,
            available_kb,
            available_pct,
        })
    }
}

#[async_trait]
impl Component for MemoryComponent {
    fn name(&self) -> &str {
        "memory"
    }

    async fn check(&self) -> CheckResult {
        let raw = match self.read_meminfo() {
            Ok(stats) => {
                let (health, reason) = if stats.available_pct < UNHEALTHY_PCT {
                    (
                        Health::Unhealthy,
                        format!("available memory {:.1}% below {:.0}%", stats.available_pct, UNHEALTHY_PCT),
                    )
                } else if stats.available_pct < DEGRADED_PCT {
                    (
                        Health::Degraded,
                        format!("available memory {:.1}% below {:.0}%", stats.available_pct, DEGRADED_PCT),
                    )
                } else {
                    (
                        Health::Healthy,
                        format!("available memory {:.1}%", stats.available_pct),
                    )
                };
                let data = serde_json::to_value(&stats).unwrap_or_default();
                CheckResult::new(self.name(), health, reason).with_extra_info(ExtraInfo::json(data))
            }
            Err(e) => {
                CheckResult::new(self.name(), Health::Unhealthy, "failed to read meminfo").with_error(e)
            }
        };
        let result = self.counter.apply("read memory availability", raw);
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

    fn write_meminfo(total_kb: u64, available_kb: u64) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "MemTotal:       {total_kb} kB\nMemFree:        1000 kB\nMemAvailable:   {available_kb} kB\n"
        )
        .unwrap();
        file
    }

    #[tokio::test]
    async fn healthy_when_plenty_available() {
        let file = write_meminfo(100_000, 50_000);
        let comp = MemoryComponent::new(file.path());
        let result = comp.check().await;
        assert_eq!(result.health, Health::Healthy);
    }

    #[tokio::test]
    async fn degraded_under_ten_percent() {
        let file = write_meminfo(100_000, 8_000);
        let comp = MemoryComponent::new(file.path());
        let result = comp.check().await;
        assert_eq!(result.health, Health::Degraded);
    }

    #[tokio::test]
    async fn unhealthy_under_three_percent() {
        let file = write_meminfo(100_000, 2_000);
        let comp = MemoryComponent::new(file.path());
        let result = comp.check().await;
        assert_eq!(result.health, Health::Unhealthy);
    }
}
