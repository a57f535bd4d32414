//! InfiniBand port-class sysfs reader, plus the ibstat-text validator used
//! as a secondary health signal.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gpud_core::{CheckResult, Component, ExtraInfo, FailureCounter, Health, HealthState, ResultCache};
use serde::Serialize;
use thiserror::Error;

const DEFAULT_CLASS_ROOT: &str = "/sys/class/infiniband";

#[derive(Debug, Error)]
pub enum InfinibandError {
    #[error("failed to read infiniband class root {0}")]
    ClassRootUnreadable(String),
    #[error("device {device} is missing required fw_ver")]
    MissingFwVer { device: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IbstatValidationError {
    #[error("ibstat reports a down port (State: Down)")]
    StateDown,
    #[error("ibstat reports a disabled physical state (Physical state: Disabled)")]
    PhysicalStateDisabled,
}

/// Port-rate expectation installed by the scan orchestrator once the GPU
/// product is known. Owned by this component's constructor, not a global.
#[derive(Debug, Clone, Default)]
pub struct PortRateExpectation {
    pub expected_rate_gbps: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IbPort {
    pub port_number: u32,
    pub link_layer: Option<String>,
    pub state: Option<String>,
    pub phys_state: Option<String>,
    pub rate_gbps: Option<f64>,
    pub counters: BTreeMap<String, u64>,
    pub hw_counters: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IbDevice {
    pub name: String,
    pub fw_ver: String,
    pub board_id: Option<String>,
    pub hca_type: Option<String>,
    pub ports: Vec<IbPort>,
}

/// Validate raw `ibstat`-style text, returning the first matching
/// condition. The two conditions are distinct error kinds per the
/// contract, checked in a fixed order (state before physical state).
pub fn validate_ibstat_text(text: &str) -> Result<(), IbstatValidationError> {
    if text.contains("State: Down") {
        return Err(IbstatValidationError::StateDown);
    }
    if text.contains("Physical state: Disabled") {
        return Err(IbstatValidationError::PhysicalStateDisabled);
    }
    Ok(())
}

fn read_required(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn parse_state_field(raw: &str) -> Option<String> {
    raw.trim().split_once(':').map(|(_, name)| name.trim().to_string())
}

fn parse_rate_gbps(raw: &str) -> Option<f64> {
    raw.trim().split_whitespace().next()?.parse().ok()
}

fn read_counter_dir(dir: &Path, octet_fields: &[&str]) -> BTreeMap<String, u64> {
    let mut out = BTreeMap::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Ok(raw) = std::fs::read_to_string(&path) else {
            continue;
        };
        let trimmed = raw.trim();
        if trimmed.starts_with("N/A") {
            continue;
        }
        let Ok(mut value) = trimmed.parse::<u64>() else {
            continue;
        };
        if octet_fields.contains(&file_name) {
            value *= 4;
        }
        out.insert(file_name.to_string(), value);
    }
    out
}

fn read_device(dev_dir: &Path) -> Result<IbDevice, InfinibandError> {
    let name = dev_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    let fw_ver = read_required(&dev_dir.join("fw_ver")).ok_or_else(|| InfinibandError::MissingFwVer {
        device: name.clone(),
    })?;
    let board_id = read_required(&dev_dir.join("board_id"));
    let hca_type = read_required(&dev_dir.join("hca_type"));

    let mut ports = Vec::new();
    let ports_dir = dev_dir.join("ports");
    if let Ok(entries) = std::fs::read_dir(&ports_dir) {
        for entry in entries.flatten() {
            let port_dir = entry.path();
            let Some(port_number) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };

            let link_layer = read_required(&port_dir.join("link_layer"));
            let state = read_required(&port_dir.join("state")).and_then(|s| parse_state_field(&s));
            let phys_state =
                read_required(&port_dir.join("phys_state")).and_then(|s| parse_state_field(&s));
            let rate_gbps = read_required(&port_dir.join("rate")).and_then(|s| parse_rate_gbps(&s));

            let counters = read_counter_dir(
                &port_dir.join("counters"),
                &["port_rcv_data", "port_xmit_data"],
            );
            let hw_counters = read_counter_dir(&port_dir.join("hw_counters"), &[]);

            ports.push(IbPort {
                port_number,
                link_layer,
                state,
                phys_state,
                rate_gbps,
                counters,
                hw_counters,
            });
        }
    }
    ports.sort_by_key(|p| p.port_number);

    Ok(IbDevice {
        name,
        fw_ver,
        board_id,
        hca_type,
        ports,
    })
}

pub fn read_devices(class_root: &Path) -> Result<Vec<IbDevice>, InfinibandError> {
    let entries = std::fs::read_dir(class_root)
        .map_err(|_| InfinibandError::ClassRootUnreadable(class_root.display().to_string()))?;

    let mut devices = Vec::new();
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        devices.push(read_device(&entry.path())?);
    }
    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}

pub struct InfinibandComponent {
    class_root: PathBuf,
    expectation: PortRateExpectation,
    counter: FailureCounter,
    cache: ResultCache,
}

impl InfinibandComponent {
    #[must_use]
    pub fn new(class_root: impl Into<PathBuf>, expectation: PortRateExpectation) -> Self {
        Self {
            class_root: class_root.into(),
            expectation,
            counter: FailureCounter::with_default_threshold(),
            cache: ResultCache::new("infiniband"),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CLASS_ROOT, PortRateExpectation::default())
    }

    fn below_expected_rate(&self, devices: &[IbDevice]) -> bool {
        let Some(expected) = self.expectation.expected_rate_gbps else {
            return false;
        };
        devices
            .iter()
            .flat_map(|d| &d.ports)
            .filter_map(|p| p.rate_gbps)
            .any(|rate| rate < expected)
    }
}

#[async_trait]
impl Component for InfinibandComponent {
    fn name(&self) -> &str {
        "infiniband"
    }

    fn is_supported(&self) -> bool {
        self.class_root.exists()
    }

    async fn check(&self) -> CheckResult {
        if !self.is_supported() {
            let result = CheckResult::new(self.name(), Health::Healthy, "not applicable");
            self.cache.store(result.clone()).await;
            return result;
        }

        let raw = match read_devices(&self.class_root) {
            Ok(devices) => {
                let reason = if self.below_expected_rate(&devices) {
                    "one or more ports below expected link rate".to_string()
                } else {
                    format!("{} infiniband device(s) reporting", devices.len())
                };
                let health = if self.below_expected_rate(&devices) {
                    Health::Degraded
                } else {
                    Health::Healthy
                };
                let data = serde_json::to_value(&devices).unwrap_or_default();
                CheckResult::new(self.name(), health, reason).with_extra_info(ExtraInfo::json(data))
            }
            Err(e) => CheckResult::new(self.name(), Health::Unhealthy, "failed to read infiniband sysfs tree")
                .with_error(e.to_string()),
        };

        let result = self.counter.apply("read infiniband sysfs tree", raw);
        self.cache.store(result.clone()).await;
        result
    }

    async fn last_health_states(&self) -> Vec<HealthState> {
        self.cache.last_health_states().await
    }

    async fn close(&self) {}
}
