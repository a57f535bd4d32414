//! The reusable periodic-check loop embedded in every scheduler-driven
//! component.
//!
//! One long-lived task per component, exactly as the design notes call
//! for: a single timer and a single cancellation signal, rather than a
//! shared worker pool, so per-component timeouts and failure counters stay
//! easy to reason about in isolation.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::component::Component;
use crate::health::{CheckResult, Health};

/// Default tick interval when a component doesn't override it.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Default per-check timeout when a component doesn't override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Spawn the periodic driver for `component`: check once immediately, then
/// on every `interval` tick, until `cancellation` fires. Each `Check` call
/// is bounded by `timeout`; a timed-out check is recorded as a `Transient`
/// error result rather than propagated, so the loop always continues.
///
/// The caller is responsible for storing the result into the component's
/// own cache — this function only invokes `component.check()` under the
/// timeout and logs; built-in components store into their `ResultCache`
/// from inside their own `check()` implementation so the cache update and
/// the failure-counter bump happen atomically with the check itself.
pub fn spawn_periodic(
    component: Arc<dyn Component>,
    interval: Duration,
    timeout: Duration,
    cancellation: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = component.name().to_string();
        info!(component = %name, ?interval, ?timeout, "starting periodic check driver");
        loop {
            tokio::select! {
                () = cancellation.cancelled() => {
                    info!(component = %name, "periodic driver observed cancellation, exiting");
                    return;
                }
                result = run_one(component.as_ref(), timeout) => {
                    if let Health::Unhealthy | Health::Degraded = result.health {
                        warn!(component = %name, health = %result.health, reason = %result.reason, "check result");
                    }
                }
            }

            tokio::select! {
                () = cancellation.cancelled() => {
                    info!(component = %name, "periodic driver observed cancellation, exiting");
                    return;
                }
                () = tokio::time::sleep(interval) => {}
            }
        }
    })
}

async fn run_one(component: &dyn Component, timeout: Duration) -> CheckResult {
    match tokio::time::timeout(timeout, component.check()).await {
        Ok(result) => result,
        Err(_) => CheckResult::new(
            component.name(),
            Health::Unhealthy,
            format!("check timed out after {timeout:?}"),
        )
        .with_error("deadline exceeded"),
    }
}
