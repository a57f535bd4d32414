//! File-descriptor exhaustion component. Reads `/proc/sys/fs/file-nr`,
//! whose three fields are `allocated`, `free` (historically unused, often
//! 0), and `max`.

use std::path::PathBuf;

use async_trait::async_trait;
use gpud_core::{CheckResult, Component, ExtraInfo, FailureCounter, Health, HealthState, ResultCache};
use serde::Serialize;

const DEGRADED_PCT: f64 = 80.0;
const UNHEALTHY_PCT: f64 = 95.0;

#[derive(Debug, Clone, Serialize)]
pub struct FileDescriptorUsage {
    pub allocated: u64,
    pub max: u64,
    pub used_pct: f64,
}

pub struct FileDescriptorsComponent {
    file_nr_path: PathBuf,
    counter: FailureCounter,
    cache: ResultCache,
}

impl FileDescriptorsComponent {
    #[must_use]
    pub fn new(file_nr_path: impl Into<PathBuf>) -> Self {
        Self {
            file_nr_path: file_nr_path.into(),
            counter: FailureCounter::with_default_threshold(),
            cache: ResultCache::new("file_descriptors"),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new("/proc/sys/fs/file-nr")
    }

    fn read_usage(&self) -> Result<FileDescriptorUsage, String> {
        let contents = std::fs::read_to_string(&self.file_nr_path).map_err(|e| e.to_string())?;
        let mut fields = contents.split_whitespace();
        let allocated: u64 = fields.next().ok_or("missing allocated field")?.parse().map_err(|_| "invalid allocated field")?;
        let _free: u64 = fields.next().ok_or("missing free field")?.parse().map_err(|_| "invalid free field")?;
        let max: u64 = fields.next().ok_or("missing max field")?.parse().map_err(|_| "invalid max field")?;

        let used_pct = if max == 0 { 0.0 } else { (allocated as f64 / max as f64) * 100.0 };
        Ok(FileDescriptorUsage { allocated, max, used_pct })
    }
}

#[async_trait]
impl Component for FileDescriptorsComponent {
    fn name(&self) -> &str {
        "file_descriptors"
    }

    async fn check(&self) -> CheckResult {
        let raw = match self.read_usage() {
            Ok(usage) => {
                let (health, reason) = if usage.used_pct >= UNHEALTHY_PCT {
                    (Health::Unhealthy, format!("file descriptors {:.1}% used", usage.used_pct))
                } else if usage.used_pct >= DEGRADED_PCT {
                    (Health::Degraded, format!("file descriptors {:.1}% used", usage.used_pct))
                } else {
                    (Health::Healthy, format!("file descriptors {:.1}% used", usage.used_pct))
                };
                let data = serde_json::to_value(&usage).unwrap_or_default();
                CheckResult::new(self.name(), health, reason).with_extra_info(ExtraInfo::json(data))
            }
            Err(e) => CheckResult::new(self.name(), Health::Unhealthy, "failed to read file-nr").with_error(e),
        };
        let result = self.counter.apply("read file descriptor usage", raw);
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

    fn write_file_nr(allocated: u64, max: u64) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{allocated}\t0\t{max}\n").unwrap();
        file
    }

    #[tokio::test]
    async fn healthy_under_eighty_percent() {
        let file = write_file_nr(100, 1000);
        let comp = FileDescriptorsComponent::new(file.path());
        assert_eq!(comp.check().await.health, Health::Healthy);
    }

    #[tokio::test]
    async fn degraded_at_eighty_percent() {
        let file = write_file_nr(850, 1000);
        let comp = FileDescriptorsComponent::new(file.path());
        assert_eq!(comp.check().await.health, Health::Degraded);
    }

    #[tokio::test]
    async fn unhealthy_at_ninety_five_percent() {
        let file = write_file_nr(960, 1000);
        let comp = FileDescriptorsComponent::new(file.path());
        assert_eq!(comp.check().await.health, Health::Unhealthy);
    }
}
