//! The component registry: owns every component, starts it, serves reads,
//! and allows dynamic add/update/remove for plugins.
//!
//! All mutations are serialized under a single write lock; `Get`/`List`
//! take a read lock. `TriggerCheck` releases the registry lock before
//! invoking `Check`, so a slow manual check never blocks concurrent
//! registry reads or mutations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::component::Component;
use crate::driver::{spawn_periodic, DEFAULT_INTERVAL, DEFAULT_TIMEOUT};
use crate::error::{GpudError, Result};
use crate::health::CheckResult;

/// Per-component scheduling parameters. `None` means the component is not
/// driven by the periodic scheduler at all (e.g. a `manual`-mode plugin or
/// a one-shot `init` plugin) and only responds to `TriggerCheck`.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

struct Entry {
    component: Arc<dyn Component>,
    cancellation: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Owns every component. Created at bootstrap; individual entries are
/// added/removed dynamically for custom plugins.
pub struct Registry {
    root_cancellation: CancellationToken,
    entries: RwLock<HashMap<String, Entry>>,
}

impl Registry {
    #[must_use]
    pub fn new(root_cancellation: CancellationToken) -> Self {
        Self {
            root_cancellation,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a freshly constructed component under `name`, optionally
    /// starting the periodic driver for it. Fails with `AlreadyExists` if
    /// the name is already taken.
    pub async fn register(
        &self,
        component: Arc<dyn Component>,
        schedule: Option<Schedule>,
    ) -> Result<()> {
        let name = component.name().to_string();
        let mut entries = self.entries.write().await;
        if entries.contains_key(&name) {
            return Err(GpudError::already_exists(name));
        }

        component.start().await?;
        let cancellation = self.root_cancellation.child_token();
        let handle = schedule.map(|s| {
            spawn_periodic(component.clone(), s.interval, s.timeout, cancellation.clone())
        });

        entries.insert(
            name,
            Entry {
                component,
                cancellation,
                handle,
            },
        );
        Ok(())
    }

    /// Replace an existing component (used for plugin `Update`): the old
    /// one's `Close` is awaited first, then the replacement is registered
    /// in its place. Readers observe the last cached result of the
    /// *replacement* during the gap (initially "no data yet") since the
    /// old entry is fully removed before the new one is inserted.
    pub async fn update(
        &self,
        name: &str,
        component: Arc<dyn Component>,
        schedule: Option<Schedule>,
    ) -> Result<()> {
        self.deregister(name).await?;
        self.register(component, schedule).await
    }

    /// Remove a component: cancels its periodic driver and awaits it
    /// before returning, then calls `Close`. Fails with `NotFound` if
    /// absent.
    pub async fn deregister(&self, name: &str) -> Result<()> {
        let entry = {
            let mut entries = self.entries.write().await;
            entries
                .remove(name)
                .ok_or_else(|| GpudError::not_found(name))?
        };

        entry.cancellation.cancel();
        if let Some(handle) = entry.handle {
            let _ = handle.await;
        }
        entry.component.close().await;
        Ok(())
    }

    /// Look up a component by name.
    pub async fn get(&self, name: &str) -> Result<Arc<dyn Component>> {
        self.entries
            .read()
            .await
            .get(name)
            .map(|e| e.component.clone())
            .ok_or_else(|| GpudError::not_found(name))
    }

    /// Ordered snapshot of every registered component name.
    pub async fn list(&self) -> Vec<Arc<dyn Component>> {
        self.entries
            .read()
            .await
            .values()
            .map(|e| e.component.clone())
            .collect()
    }

    /// Synchronously invoke `Check` on a component, releasing the registry
    /// lock first so a slow check never blocks other registry operations.
    pub async fn trigger_check(&self, name: &str) -> Result<CheckResult> {
        let component = self.get(name).await?;
        Ok(component.check().await)
    }

    /// Cancel every component's periodic driver and await them all, then
    /// call `Close` on each. Used on daemon shutdown.
    pub async fn close_all(&self) {
        self.root_cancellation.cancel();
        let mut entries = self.entries.write().await;
        for (_, entry) in entries.drain() {
            if let Some(handle) = entry.handle {
                let _ = handle.await;
            }
            entry.component.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ResultCache;
    use crate::health::{Health, HealthState};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A component whose `check()` always errors until `fail_until` calls
    /// have happened, then always succeeds. Used to exercise the
    /// consecutive-failure threshold end to end.
    struct FlakyComponent {
        name: String,
        cache: ResultCache,
        counter: crate::component::FailureCounter,
        calls: AtomicU32,
        fail_until: u32,
    }

    impl FlakyComponent {
        fn new(name: &str, fail_until: u32) -> Self {
            Self {
                name: name.to_string(),
                cache: ResultCache::new(name),
                counter: crate::component::FailureCounter::new(5),
                calls: AtomicU32::new(0),
                fail_until,
            }
        }
    }

    #[async_trait]
    impl Component for FlakyComponent {
        fn name(&self) -> &str {
            &self.name
        }

        async fn check(&self) -> CheckResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let raw = if n <= self.fail_until {
                CheckResult::new(&self.name, Health::Degraded, "probe failed").with_error("probe failed")
            } else {
                CheckResult::new(&self.name, Health::Healthy, "probe ok")
            };
            let result = self.counter.apply("probe", raw);
            self.cache.store(result.clone()).await;
            result
        }

        async fn last_health_states(&self) -> Vec<HealthState> {
            self.cache.last_health_states().await
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn no_data_yet_before_first_check() {
        let comp = FlakyComponent::new("flaky", 0);
        let states = comp.last_health_states().await;
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].reason, "no data yet");
        assert_eq!(states[0].health, Health::Healthy);
    }

    #[tokio::test]
    async fn last_health_states_reflects_latest_check() {
        let comp = FlakyComponent::new("flaky", 0);
        let result = comp.check().await;
        let states = comp.last_health_states().await;
        assert_eq!(states[0].reason, result.reason);
        assert_eq!(states[0].health, result.health);
    }

    #[tokio::test]
    async fn threshold_trips_after_five_consecutive_failures_then_resets() {
        let comp = FlakyComponent::new("flaky", 6);
        let mut last = None;
        for _ in 0..5 {
            last = Some(comp.check().await);
        }
        let fifth = last.unwrap();
        assert_eq!(fifth.health, Health::Unhealthy);
        assert_eq!(fifth.reason, "probe failed 5 time(s)");

        // Sixth call is still a failing probe (fail_until=6) but now past
        // threshold, so it is reported as a sixth consecutive failure.
        let sixth = comp.check().await;
        assert_eq!(sixth.reason, "probe failed 6 time(s)");

        // Seventh call succeeds and immediately resets.
        let seventh = comp.check().await;
        assert_eq!(seventh.health, Health::Healthy);
        assert_eq!(seventh.reason, "probe ok");
    }

    #[tokio::test]
    async fn register_get_list_deregister_roundtrip() {
        let registry = Registry::new(CancellationToken::new());
        let comp: Arc<dyn Component> = Arc::new(FlakyComponent::new("alpha", 0));
        registry.register(comp, None).await.unwrap();

        assert!(registry.get("alpha").await.is_ok());
        assert_eq!(registry.list().await.len(), 1);

        registry.deregister("alpha").await.unwrap();
        let err = registry.get("alpha").await.unwrap_err();
        assert!(matches!(err, GpudError::NotFound(_)));
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn register_duplicate_name_fails_already_exists() {
        let registry = Registry::new(CancellationToken::new());
        registry
            .register(Arc::new(FlakyComponent::new("dup", 0)), None)
            .await
            .unwrap();
        let err = registry
            .register(Arc::new(FlakyComponent::new("dup", 0)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GpudError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn deregister_missing_fails_not_found() {
        let registry = Registry::new(CancellationToken::new());
        let err = registry.deregister("ghost").await.unwrap_err();
        assert!(matches!(err, GpudError::NotFound(_)));
    }

    #[tokio::test]
    async fn periodic_driver_stops_before_deregister_returns() {
        let registry = Registry::new(CancellationToken::new());
        let comp: Arc<dyn Component> = Arc::new(FlakyComponent::new("periodic", 0));
        registry
            .register(
                comp,
                Some(Schedule {
                    interval: Duration::from_millis(5),
                    timeout: Duration::from_secs(1),
                }),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        // deregister awaits the driver's JoinHandle internally; returning
        // at all (without hanging the test) demonstrates the task exited.
        registry.deregister("periodic").await.unwrap();
    }
}
