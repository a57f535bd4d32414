//! `GpudConfig`: the YAML-loadable configuration supplementing `Instance`'s
//! collaborators. `spec.md` leaves how these are populated at process
//! start unspecified; this follows the teacher's `SensorConfig` pattern of
//! a `serde`-derived struct with per-field defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSchedule {
    pub interval_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpudConfig {
    /// Address the thin axum layer binds to in `serve` mode.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// YAML/JSON file of `PluginSpec` entries to load at bootstrap.
    #[serde(default)]
    pub plugin_spec_path: Option<PathBuf>,

    /// Plugin ledger SQLite file.
    #[serde(default = "default_ledger_db_path")]
    pub ledger_db_path: PathBuf,

    /// InfiniBand sysfs root override (defaults to `/sys/class/infiniband`).
    #[serde(default)]
    pub infiniband_class_root: Option<String>,

    /// Tool path overrides (`ibstat`, `bash`, ...).
    #[serde(default)]
    pub tool_overrides: HashMap<String, String>,

    /// Per-component interval/timeout overrides, keyed by component name.
    #[serde(default)]
    pub component_schedules: HashMap<String, ComponentSchedule>,

    /// Optional QPS cap for the plugin rate limiter; `None` disables it.
    #[serde(default)]
    pub plugin_qps: Option<u32>,

    /// Minimum seconds between two runs of the same plugin script.
    #[serde(default)]
    pub plugin_minimum_retry_secs: u64,

    /// Required kernel modules for the `kernel_modules` component.
    #[serde(default)]
    pub required_kernel_modules: Vec<String>,

    /// Mount points the `disk` component checks free space on.
    #[serde(default = "default_mount_points")]
    pub mount_points: Vec<String>,

    /// Node name reported by the kubelet-pods component's reason string.
    #[serde(default = "default_node_name")]
    pub node_name: String,
}

impl Default for GpudConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            plugin_spec_path: None,
            ledger_db_path: default_ledger_db_path(),
            infiniband_class_root: None,
            tool_overrides: HashMap::new(),
            component_schedules: HashMap::new(),
            plugin_qps: None,
            plugin_minimum_retry_secs: 0,
            required_kernel_modules: Vec::new(),
            mount_points: default_mount_points(),
            node_name: default_node_name(),
        }
    }
}

impl GpudConfig {
    /// The default config file location, matching the teacher's
    /// `/etc/<name>/config.yaml` convention for daemon config.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathBuf::from("/etc/gpud/config.yaml")
    }

    /// Load a config file if it exists, otherwise return the default
    /// configuration — a missing config file is not an error for a
    /// daemon meant to run with sane defaults out of the box.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:15132".to_string()
}

fn default_ledger_db_path() -> PathBuf {
    PathBuf::from("/var/lib/gpud/plugin_ledger.sqlite")
}

fn default_mount_points() -> Vec<String> {
    vec!["/".to_string()]
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME")
        .ok()
        .or_else(hostname_fallback)
        .unwrap_or_else(|| "unknown".to_string())
}

fn hostname_fallback() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let config = GpudConfig::load_or_default(Path::new("/no/such/config.yaml")).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:15132");
    }

    #[test]
    fn parses_partial_yaml_with_defaults_for_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "bindAddr: \"0.0.0.0:9090\"\npluginQps: 5\n").unwrap();

        let config = GpudConfig::load(&path).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9090");
        assert_eq!(config.plugin_qps, Some(5));
        assert_eq!(config.mount_points, vec!["/".to_string()]);
    }

    #[test]
    fn rejects_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "bindAddr: [unterminated\n").unwrap();
        assert!(GpudConfig::load(&path).is_err());
    }
}
