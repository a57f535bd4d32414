//! The [`Component`] contract every built-in and plugin-synthesized
//! component implements, and the [`FailureCounter`] consecutive-failure
//! threshold base most of them embed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::health::{CheckResult, Health, HealthState};
use crate::instance::Event;

/// The capability set the registry and scheduler hold components through.
/// Built-in components and plugin-synthesized components are
/// indistinguishable behind this trait.
#[async_trait]
pub trait Component: Send + Sync {
    /// Stable identifier, unique across the registry.
    fn name(&self) -> &str;

    /// Optional labels for filtering. Empty by default.
    fn tags(&self) -> &[String] {
        &[]
    }

    /// Gate for whether this component applies to the current host.
    /// Unsupported components are still registered, return `Healthy` with a
    /// "not applicable" reason, and are skipped during scan.
    fn is_supported(&self) -> bool {
        true
    }

    /// Run one evaluation and return its result.
    async fn check(&self) -> CheckResult;

    /// Return the last cached result's health states, or a synthetic
    /// "no data yet" state if this component has never been checked.
    async fn last_health_states(&self) -> Vec<HealthState>;

    /// Optional lazy sequence of past events. Most components return
    /// empty.
    async fn events(&self, _since: DateTime<Utc>) -> Result<Vec<Event>> {
        Ok(Vec::new())
    }

    /// Called once when the component is registered and the scheduler
    /// starts driving it. A no-op for components that don't run on a
    /// periodic schedule (e.g. `manual`-mode plugins).
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Tear down any background task and release resources. Must return
    /// only after the periodic loop (if any) has observed cancellation.
    async fn close(&self);
}

/// Non-negative consecutive-failure counter. When it meets or exceeds the
/// component's threshold, the next `Check`'s reported health is forced to
/// `Unhealthy` regardless of that attempt's own outcome.
#[derive(Debug)]
pub struct FailureCounter {
    count: AtomicU32,
    threshold: u32,
}

impl FailureCounter {
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            threshold,
        }
    }

    /// Default threshold used across the built-ins unless a component
    /// overrides it.
    #[must_use]
    pub fn with_default_threshold() -> Self {
        Self::new(5)
    }

    pub fn record_failure(&self) -> u32 {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_success(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    #[must_use]
    pub fn current(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.current() >= self.threshold
    }

    /// Apply the threshold rule to a freshly computed result: on error,
    /// bump the counter and, if now at/over threshold, force `Unhealthy`
    /// with the standard reason; on success, reset the counter.
    pub fn apply(&self, operation: &str, mut result: CheckResult) -> CheckResult {
        if result.error.is_some() {
            let n = self.record_failure();
            if n >= self.threshold {
                result.health = Health::Unhealthy;
                result.reason = format!("{operation} failed {n} time(s)");
            }
        } else {
            self.record_success();
        }
        result
    }
}

/// Single-slot cache for the last `CheckResult`, guarded by a dedicated
/// read-write lock (never a global one). Exactly one writer (the periodic
/// driver or a manual trigger) and many readers.
pub struct ResultCache {
    name: String,
    slot: RwLock<Option<CheckResult>>,
}

impl ResultCache {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slot: RwLock::new(None),
        }
    }

    pub async fn store(&self, result: CheckResult) {
        *self.slot.write().await = Some(result);
    }

    pub async fn last_health_states(&self) -> Vec<HealthState> {
        match self.slot.read().await.as_ref() {
            Some(result) => result.health_states(),
            None => vec![HealthState::no_data_yet(self.name.clone())],
        }
    }

    pub async fn last_result(&self) -> Option<CheckResult> {
        self.slot.read().await.clone()
    }
}

/// Helper shared by every built-in: run a fallible check function, apply
/// the failure-counter threshold, and wrap panics as an `Unhealthy`
/// "internal error" result the same way the periodic driver does for a
/// check that panics mid-flight.
pub async fn run_guarded<F, Fut>(
    name: &str,
    operation: &str,
    counter: &FailureCounter,
    check_fn: F,
) -> CheckResult
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = CheckResult>,
{
    let result = std::panic::AssertUnwindSafe(check_fn())
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            let message = panic_message(&payload);
            CheckResult::new(name, Health::Unhealthy, format!("internal error: {message}"))
                .with_error(message)
        });
    counter.apply(operation, result)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

use futures::FutureExt;

/// Constructor signature the registry stores: given an `Instance`,
/// fallibly produce a component. Bootstrap-time failure of any `InitFunc`
/// is fatal; dynamic registration failure is returned to the caller.
pub type InitFunc = Arc<dyn Fn(&crate::instance::Instance) -> Result<Arc<dyn Component>> + Send + Sync>;
