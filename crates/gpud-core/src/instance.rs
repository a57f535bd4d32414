//! The shared collaborator bag passed to every component constructor.
//!
//! `Instance` never reaches back into the registry — components receive
//! capabilities by value/reference at construction time and never look
//! anything up through a shared registry handle, which is what keeps the
//! dependency graph acyclic (see the design note on cyclic dependencies).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// One historical event a component may expose via `Events(since)`. Most
/// built-ins never produce any and return an empty sequence.
#[derive(Debug, Clone)]
pub struct Event {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub name: String,
    pub message: String,
}

/// Opaque historical-event sink. Most built-in components ignore it.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn record(&self, component: &str, event: Event) -> Result<()>;
    async fn since(&self, component: &str, since: chrono::DateTime<chrono::Utc>) -> Result<Vec<Event>>;
}

/// An event store that drops everything. The default for components that
/// never query `Events`.
pub struct NullEventStore;

#[async_trait]
impl EventStore for NullEventStore {
    async fn record(&self, _component: &str, _event: Event) -> Result<()> {
        Ok(())
    }

    async fn since(&self, _component: &str, _since: chrono::DateTime<chrono::Utc>) -> Result<Vec<Event>> {
        Ok(Vec::new())
    }
}

/// One row of the plugin ledger, as read back by the plugin manager.
#[derive(Debug, Clone, Default)]
pub struct LedgerEntry {
    pub last_started_unix_seconds: Option<i64>,
    pub script_name: Option<String>,
    pub last_exit_code: Option<i32>,
    pub last_output: Option<String>,
}

/// Persistent mapping from `scriptID` to last-run metadata. Implemented by
/// `gpud-persistence`; kept as a trait here so `gpud-core`/`gpud-plugins`
/// never depend on the concrete storage engine.
#[async_trait]
pub trait PluginLedger: Send + Sync {
    async fn get(&self, script_id: &str) -> Result<Option<LedgerEntry>>;
    async fn record_start(&self, script_id: &str, script_name: &str, started_unix_seconds: i64) -> Result<()>;
    async fn update_exit_code(&self, script_id: &str, exit_code: i32) -> Result<()>;
    async fn update_output(&self, script_id: &str, output: &str) -> Result<()>;
}

/// Per-GPU counters surfaced by the NVML component. The C bindings
/// themselves are out of scope; this is the capability surface the core
/// consumes.
#[derive(Debug, Clone, Default)]
pub struct NvmlDeviceStatus {
    pub index: u32,
    pub uuid: String,
    pub product_name: String,
    pub temperature_celsius: Option<u32>,
    pub ecc_volatile_sbe: u64,
    pub ecc_volatile_dbe: u64,
    pub xid_errors: Vec<u32>,
    pub gpu_lost: bool,
    pub reset_required: bool,
}

/// Shared, read-only NVML capability. The real implementation wraps the
/// NVML C library's own internal locking; a no-op implementation is used on
/// non-GPU hosts and in tests.
pub trait NvmlHandle: Send + Sync {
    fn is_available(&self) -> bool;
    fn product_name(&self) -> Option<String>;
    fn devices(&self) -> Result<Vec<NvmlDeviceStatus>>;
}

/// No-op NVML handle for hosts without a GPU, or for unit tests.
pub struct NoopNvmlHandle;

impl NvmlHandle for NoopNvmlHandle {
    fn is_available(&self) -> bool {
        false
    }

    fn product_name(&self) -> Option<String> {
        None
    }

    fn devices(&self) -> Result<Vec<NvmlDeviceStatus>> {
        Ok(Vec::new())
    }
}

/// Filesystem/binary path overrides for external tools the built-ins shell
/// out to (`ibstat`, `bash`, ...). Defaults match the tool's usual
/// well-known location.
#[derive(Debug, Clone)]
pub struct ToolOverrides {
    paths: HashMap<String, String>,
}

impl Default for ToolOverrides {
    fn default() -> Self {
        let mut paths = HashMap::new();
        paths.insert("ibstat".to_string(), "/usr/sbin/ibstat".to_string());
        paths.insert("bash".to_string(), "/bin/bash".to_string());
        Self { paths }
    }
}

impl ToolOverrides {
    #[must_use]
    pub fn get(&self, tool: &str) -> &str {
        self.paths
            .get(tool)
            .map(String::as_str)
            .unwrap_or(tool)
    }

    pub fn set(&mut self, tool: impl Into<String>, path: impl Into<String>) {
        self.paths.insert(tool.into(), path.into());
    }
}

/// Configuration for components that read a mounted filesystem's free
/// space (the `disk` component) or sysfs subtree (the InfiniBand reader).
#[derive(Debug, Clone, Default)]
pub struct MountConfig {
    pub mount_points: Vec<String>,
    pub infiniband_class_root: Option<String>,
}

/// The bag of shared collaborators passed to every component constructor.
pub struct Instance {
    pub root_cancellation: CancellationToken,
    pub nvml: Arc<dyn NvmlHandle>,
    pub tools: ToolOverrides,
    pub events: Arc<dyn EventStore>,
    pub mounts: MountConfig,
    pub ledger: Arc<dyn PluginLedger>,
}

impl Instance {
    #[must_use]
    pub fn child_cancellation(&self) -> CancellationToken {
        self.root_cancellation.child_token()
    }
}
