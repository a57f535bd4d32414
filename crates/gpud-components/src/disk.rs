//! Disk free-space component. Runs `statvfs` on each configured mount
//! point, applying the same 10%/3% thresholds as [`crate::memory`].

use async_trait::async_trait;
use gpud_core::{CheckResult, Component, ExtraInfo, FailureCounter, Health, HealthState, ResultCache};
use serde::Serialize;

const DEGRADED_PCT: f64 = 10.0;
const UNHEALTHY_PCT: f64 = 3.0;

#[derive(Debug, Clone, Serialize)]
pub struct MountUsage {
    pub mount_point: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub available_pct: f64,
}

pub struct DiskComponent {
    mount_points: Vec<String>,
    counter: FailureCounter,
    cache: ResultCache,
}

impl DiskComponent {
    #[must_use]
    pub fn new(mount_points: Vec<String>) -> Self {
        Self {
            mount_points,
            counter: FailureCounter::with_default_threshold(),
            cache: ResultCache::new("disk"),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(vec!["/".to_string()])
    }

    fn statvfs_usage(mount_point: &str) -> Result<MountUsage, String> {
        let stat = nix::sys::statvfs::statvfs(mount_point).map_err(|e| e.to_string())?;
        let block_size = stat.fragment_size().max(1) as u64;
        let total_bytes = stat.blocks() as u64 * block_size;
        let available_bytes = stat.blocks_available() as u64 * block_size;
        let available_pct = if total_bytes == 0 {
            0.0
        } else {
            (available_bytes as f64 / total_bytes as f64) * 100.0
        };
        Ok(MountUsage {
            mount_point: mount_point.to_string(),
            total_bytes,
            available_bytes,
            available_pct,
        })
    }

    fn check_all_mounts(&self) -> Result<Vec<MountUsage>, String> {
        self.mount_points.iter().map(|m| Self::statvfs_usage(m)).collect()
    }
}

#[async_trait]
impl Component for DiskComponent {
    fn name(&self) -> &str {
        "disk"
    }

    async fn check(&self) -> CheckResult {
        let raw = match self.check_all_mounts() {
            Ok(usages) => {
                let worst = usages
                    .iter()
                    .min_by(|a, b| a.available_pct.partial_cmp(&b.available_pct).unwrap());

                let (health, reason) = match worst {
                    Some(worst) if worst.available_pct < UNHEALTHY_PCT => (
                        Health::Unhealthy,
                        format!(
                            "{} has {:.1}% free, below {:.0}%",
                            worst.mount_point, worst.available_pct, UNHEALTHY_PCT
                        ),
                    ),
                    Some(worst) if worst.available_pct < DEGRADED_PCT => (
                        Health::Degraded,
                        format!(
                            "{} has {:.1}% free, below {:.0}%",
                            worst.mount_point, worst.available_pct, DEGRADED_PCT
                        ),
                    ),
                    Some(worst) => (Health::Healthy, format!("{} has {:.1}% free", worst.mount_point, worst.available_pct)),
                    None => (Health::Healthy, "no mount points configured".to_string()),
                };
                let data = serde_json::to_value(&usages).unwrap_or_default();
                CheckResult::new(self.name(), health, reason).with_extra_info(ExtraInfo::json(data))
            }
            Err(e) => CheckResult::new(self.name(), Health::Unhealthy, "failed to statvfs a configured mount point")
                .with_error(e),
        };
        let result = self.counter.apply("read disk free space", raw);
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

    #[tokio::test]
    async fn reports_free_space_on_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let comp = DiskComponent::new(vec![dir.path().to_string_lossy().to_string()]);
        let result = comp.check().await;
        assert!(matches!(result.health, Health::Healthy | Health::Degraded | Health::Unhealthy));
        assert!(result.extra_info.is_some());
    }

    #[tokio::test]
    async fn unreadable_mount_point_is_unhealthy() {
        let comp = DiskComponent::new(vec!["/this/path/does/not/exist/at/all".to_string()]);
        let result = comp.check().await;
        assert_eq!(result.health, Health::Unhealthy);
        assert!(result.error.is_some());
    }
}
