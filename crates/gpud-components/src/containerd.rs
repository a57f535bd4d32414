//! Container-runtime socket reachability component. Dials the configured
//! containerd/Docker control socket with a short timeout.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use gpud_core::{CheckResult, Component, FailureCounter, Health, HealthState, ResultCache};

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

pub struct ContainerdComponent {
    socket_path: PathBuf,
    dial_timeout: Duration,
    counter: FailureCounter,
    cache: ResultCache,
}

impl ContainerdComponent {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            counter: FailureCounter::with_default_threshold(),
            cache: ResultCache::new("containerd"),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new("/run/containerd/containerd.sock")
    }

    async fn dial(&self) -> Result<(), String> {
        let path = self.socket_path.clone();
        let connect = tokio::net::UnixStream::connect(path);
        tokio::time::timeout(self.dial_timeout, connect)
            .await
            .map_err(|_| "dial timed out".to_string())?
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl Component for ContainerdComponent {
    fn name(&self) -> &str {
        "containerd"
    }

    fn is_supported(&self) -> bool {
        self.socket_path.exists()
    }

    async fn check(&self) -> CheckResult {
        if !self.is_supported() {
            let result = CheckResult::new(self.name(), Health::Healthy, "not applicable");
            self.cache.store(result.clone()).await;
            return result;
        }

        // A single connect failure is transient (soft error): it is folded
        // into `FailureCounter`, which only forces `Unhealthy` once the
        // threshold is reached, per the "unhealthy on connect failure past
        // the threshold" contract.
        let raw = match self.dial().await {
            Ok(()) => CheckResult::new(self.name(), Health::Healthy, "container runtime socket reachable"),
            Err(e) => CheckResult::new(self.name(), Health::Healthy, "container runtime socket unreachable")
                .with_error(e),
        };

        let result = self.counter.apply("dial container runtime socket", raw);
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
    async fn missing_socket_path_is_not_applicable() {
        let comp = ContainerdComponent::new("/no/such/socket.sock");
        let result = comp.check().await;
        assert_eq!(result.reason, "not applicable");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reachable_socket_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("containerd.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let comp = ContainerdComponent::new(&socket_path);
        let result = comp.check().await;
        assert_eq!(result.health, Health::Healthy);
    }
}
