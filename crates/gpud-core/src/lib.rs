//! Component registry and scheduler core for the gpud diagnostic daemon.
//!
//! This crate owns the pluggable `Component` contract, the periodic check
//! driver, the consecutive-failure threshold, the registry that drives
//! dynamic plugin registration, and the shared `Instance` context. Built-in
//! component adapters live in `gpud-components`; the bash-plugin runtime
//! lives in `gpud-plugins`.

pub mod component;
pub mod driver;
pub mod error;
pub mod health;
pub mod instance;
pub mod registry;

pub use component::{Component, FailureCounter, InitFunc, ResultCache};
pub use error::{GpudError, RateLimitError, Result};
pub use health::{CheckResult, ExtraInfo, Health, HealthState};
pub use instance::{
    Event, EventStore, Instance, LedgerEntry, MountConfig, NoopNvmlHandle, NullEventStore,
    NvmlDeviceStatus, NvmlHandle, PluginLedger, ToolOverrides,
};
pub use registry::{Registry, Schedule};
