//! Network latency component. TCP-connects to a configured set of
//! targets and reports the worst observed connect time.

use std::time::Duration;

use async_trait::async_trait;
use gpud_core::{CheckResult, Component, ExtraInfo, FailureCounter, Health, HealthState, ResultCache};
use serde::Serialize;
use tokio::time::Instant;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_DEGRADED_MS: u128 = 200;
const DEFAULT_UNHEALTHY_MS: u128 = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct TargetLatency {
    pub target: String,
    pub reachable: bool,
    pub latency_ms: Option<u128>,
}

pub struct NetworkLatencyComponent {
    targets: Vec<String>,
    connect_timeout: Duration,
    degraded_ms: u128,
    unhealthy_ms: u128,
    counter: FailureCounter,
    cache: ResultCache,
}

impl NetworkLatencyComponent {
    #[must_use]
    pub fn new(targets: Vec<String>) -> Self {
        Self {
            targets,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            degraded_ms: DEFAULT_DEGRADED_MS,
            unhealthy_ms: DEFAULT_UNHEALTHY_MS,
            counter: FailureCounter::with_default_threshold(),
            cache: ResultCache::new("network_latency"),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(vec!["1.1.1.1:443".to_string(), "8.8.8.8:443".to_string()])
    }

    async fn probe(&self, target: &str) -> TargetLatency {
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.connect_timeout, tokio::net::TcpStream::connect(target)).await;
        match outcome {
            Ok(Ok(_)) => TargetLatency {
                target: target.to_string(),
                reachable: true,
                latency_ms: Some(start.elapsed().as_millis()),
            },
            _ => TargetLatency {
                target: target.to_string(),
                reachable: false,
                latency_ms: None,
            },
        }
    }
}

#[async_trait]
impl Component for NetworkLatencyComponent {
    fn name(&self) -> &str {
        "network_latency"
    }

    fn is_supported(&self) -> bool {
        !self.targets.is_empty()
    }

    async fn check(&self) -> CheckResult {
        if !self.is_supported() {
            let result = CheckResult::new(self.name(), Health::Healthy, "not applicable");
            self.cache.store(result.clone()).await;
            return result;
        }

        let mut probes = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            probes.push(self.probe(target).await);
        }

        let unreachable: Vec<&TargetLatency> = probes.iter().filter(|p| !p.reachable).collect();
        let worst_ms = probes.iter().filter_map(|p| p.latency_ms).max();

        let raw = if !unreachable.is_empty() {
            let names: Vec<&str> = unreachable.iter().map(|p| p.target.as_str()).collect();
            CheckResult::new(
                self.name(),
                Health::Healthy,
                format!("unreachable target(s): {}", names.join(", ")),
            )
            .with_error(format!("connect failed for: {}", names.join(", ")))
        } else {
            let worst_ms = worst_ms.unwrap_or(0);
            let health = if worst_ms >= self.unhealthy_ms {
                Health::Unhealthy
            } else if worst_ms >= self.degraded_ms {
                Health::Degraded
            } else {
                Health::Healthy
            };
            CheckResult::new(self.name(), health, format!("worst connect latency {worst_ms}ms"))
        }
        .with_extra_info(ExtraInfo::json(serde_json::to_value(&probes).unwrap_or_default()));

        let result = self.counter.apply("probe network latency targets", raw);
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
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reachable_target_reports_latency() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let comp = NetworkLatencyComponent::new(vec![addr.to_string()]);
        let result = comp.check().await;
        assert_eq!(result.health, Health::Healthy);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn unreachable_target_is_transient_not_unhealthy() {
        let comp = NetworkLatencyComponent::new(vec!["127.0.0.1:1".to_string()]);
        let result = comp.check().await;
        assert_eq!(result.health, Health::Healthy);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn no_targets_configured_is_not_applicable() {
        let comp = NetworkLatencyComponent::new(vec![]);
        let result = comp.check().await;
        assert_eq!(result.reason, "not applicable");
    }
}
