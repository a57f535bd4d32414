//! Kubelet read-only-port pods component.
//!
//! Only active when the kubelet binary is installed *and* the configured
//! read-only port accepts a TCP connection. Preflight checks are injected
//! as closures so tests can force either branch without a real kubelet.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gpud_core::{CheckResult, Component, ExtraInfo, FailureCounter, Health, HealthState, ResultCache};
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_PORT: u16 = 10255;
const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// One container's reduced status, as surfaced in `extra_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub state: String,
    pub restart_count: i32,
    pub image: String,
    pub container_id: Option<String>,
}

/// One pod's reduced status, built from the kubelet's `/pods` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodStatus {
    pub id: String,
    pub namespace: String,
    pub name: String,
    pub phase: String,
    pub conditions: Vec<String>,
    pub container_statuses: Vec<ContainerStatus>,
    pub init_container_statuses: Vec<ContainerStatus>,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
struct PodsPayload {
    node: String,
    pods: Vec<PodStatus>,
}

/// Closures the component uses to decide whether it's active at all.
/// Swappable in tests; defaulted to real filesystem/TCP probes in
/// production via [`KubeletPodsComponent::new`].
pub type DependencyCheck = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct KubeletPodsComponent {
    port: u16,
    node_name: String,
    check_dependency_installed: DependencyCheck,
    check_kubelet_running: DependencyCheck,
    client: reqwest::Client,
    counter: FailureCounter,
    cache: ResultCache,
}

impl KubeletPodsComponent {
    #[must_use]
    pub fn new(
        node_name: impl Into<String>,
        port: u16,
        check_dependency_installed: DependencyCheck,
        check_kubelet_running: DependencyCheck,
    ) -> Self {
        // No gzip/brotli feature is enabled on the `reqwest` dependency, so
        // responses are never compressed; `pool_max_idle_per_host(0)` gives
        // the non-keepalive client the contract calls for.
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .pool_max_idle_per_host(0)
            .build()
            .expect("reqwest client");

        Self {
            port,
            node_name: node_name.into(),
            check_dependency_installed,
            check_kubelet_running,
            client,
            counter: FailureCounter::with_default_threshold(),
            cache: ResultCache::new("kubelet-pods"),
        }
    }

    /// Production constructor: checks `which kubelet` and dials the
    /// configured read-only port with a short timeout.
    #[must_use]
    pub fn with_defaults(node_name: impl Into<String>) -> Self {
        let port = DEFAULT_PORT;
        Self::new(
            node_name,
            port,
            Arc::new(default_check_dependency_installed),
            Arc::new(move || default_check_kubelet_running(port)),
        )
    }

    async fn fetch_pods(&self) -> Result<Vec<PodStatus>, String> {
        let url = format!("http://localhost:{}/pods", self.port);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("kubelet returned HTTP {}", response.status()));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
        Ok(parse_pod_list(&body))
    }
}

#[async_trait]
impl Component for KubeletPodsComponent {
    fn name(&self) -> &str {
        "kubelet-pods"
    }

    fn is_supported(&self) -> bool {
        true
    }

    async fn check(&self) -> CheckResult {
        if !(self.check_dependency_installed)() {
            let result = CheckResult::new(self.name(), Health::Healthy, "kubelet is not installed");
            self.cache.store(result.clone()).await;
            return result;
        }
        if !(self.check_kubelet_running)() {
            let result = CheckResult::new(
                self.name(),
                Health::Healthy,
                "kubelet is installed but not running",
            );
            self.cache.store(result.clone()).await;
            return result;
        }

        let raw = match self.fetch_pods().await {
            Ok(pods) => {
                let reason = format!("total {} pods (node {})", pods.len(), self.node_name);
                let mut result = CheckResult::new(self.name(), Health::Healthy, reason);
                if !pods.is_empty() {
                    let payload = PodsPayload {
                        node: self.node_name.clone(),
                        pods,
                    };
                    let data = serde_json::to_value(&payload).unwrap_or_default();
                    result = result.with_extra_info(ExtraInfo::json(data));
                }
                result
            }
            Err(e) => CheckResult::new(
                self.name(),
                Health::Healthy,
                "list pods from kubelet read-only port failed",
            )
            .with_error(e),
        };

        let result = self.counter.apply("list pods from kubelet read-only port", raw);
        self.cache.store(result.clone()).await;
        result
    }

    async fn last_health_states(&self) -> Vec<HealthState> {
        self.cache.last_health_states().await
    }

    async fn close(&self) {}
}

fn default_check_dependency_installed() -> bool {
    which_kubelet().is_some()
}

fn which_kubelet() -> Option<String> {
    for dir in std::env::var("PATH").unwrap_or_default().split(':') {
        let candidate = std::path::Path::new(dir).join("kubelet");
        if candidate.is_file() {
            return Some(candidate.to_string_lossy().to_string());
        }
    }
    None
}

fn default_check_kubelet_running(port: u16) -> bool {
    let addr: SocketAddr = match format!("127.0.0.1:{port}").parse() {
        Ok(a) => a,
        Err(_) => return false,
    };
    match std::net::TcpStream::connect_timeout(&addr, DIAL_TIMEOUT) {
        Ok(_) => true,
        Err(e) => {
            debug!(error = %e, "kubelet read-only port dial failed");
            false
        }
    }
}

fn parse_pod_list(body: &serde_json::Value) -> Vec<PodStatus> {
    let items = body.get("items").and_then(serde_json::Value::as_array);
    let Some(items) = items else {
        return Vec::new();
    };

    items
        .iter()
        .map(|item| {
            let metadata = item.get("metadata");
            let spec = item.get("spec");
            let status = item.get("status");

            let id = metadata
                .and_then(|m| m.get("uid"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            let namespace = metadata
                .and_then(|m| m.get("namespace"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            let name = metadata
                .and_then(|m| m.get("name"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            let phase = status
                .and_then(|s| s.get("phase"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();

            let conditions = status
                .and_then(|s| s.get("conditions"))
                .and_then(serde_json::Value::as_array)
                .map(|conds| {
                    conds
                        .iter()
                        .filter_map(|c| c.get("type").and_then(serde_json::Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            let container_statuses = parse_container_statuses(status, "containerStatuses");
            let init_container_statuses = parse_container_statuses(status, "initContainerStatuses");

            let start_time = status
                .and_then(|s| s.get("startTime"))
                .and_then(serde_json::Value::as_str)
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc));

            let _ = spec; // spec.nodeName intentionally unused: node identity is injected, not parsed per-pod.

            PodStatus {
                id,
                namespace,
                name,
                phase,
                conditions,
                container_statuses,
                init_container_statuses,
                start_time,
            }
        })
        .collect()
}

fn parse_container_statuses(status: Option<&serde_json::Value>, key: &str) -> Vec<ContainerStatus> {
    status
        .and_then(|s| s.get(key))
        .and_then(serde_json::Value::as_array)
        .map(|arr| {
            arr.iter()
                .map(|c| {
                    let name = c
                        .get("name")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let state = c
                        .get("state")
                        .and_then(serde_json::Value::as_object)
                        .and_then(|m| m.keys().next())
                        .cloned()
                        .unwrap_or_else(|| "unknown".to_string());
                    let restart_count = c
                        .get("restartCount")
                        .and_then(serde_json::Value::as_i64)
                        .unwrap_or(0) as i32;
                    let image = c
                        .get("image")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let container_id = c
                        .get("containerID")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string);
                    ContainerStatus {
                        name,
                        state,
                        restart_count,
                        image,
                        container_id,
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn component_with_checks(installed: bool, running: bool, port: u16) -> KubeletPodsComponent {
        KubeletPodsComponent::new(
            "mynodehostname",
            port,
            Arc::new(move || installed),
            Arc::new(move || running),
        )
    }

    #[tokio::test]
    async fn s1_kubelet_not_running() {
        let comp = component_with_checks(true, false, 0);
        let result = comp.check().await;
        assert_eq!(result.health, Health::Healthy);
        assert_eq!(result.reason, "kubelet is installed but not running");
        assert!(result.extra_info.is_none());
    }

    #[tokio::test]
    async fn s1_kubelet_not_installed() {
        let comp = component_with_checks(false, false, 0);
        let result = comp.check().await;
        assert_eq!(result.health, Health::Healthy);
        assert_eq!(result.reason, "kubelet is not installed");
    }

    #[tokio::test]
    async fn s2_kubelet_running_with_two_pods() {
        let server = MockServer::start().await;
        let fixture = json!({
            "items": [
                {
                    "metadata": {"uid": "u1", "namespace": "default", "name": "vector-jldbs"},
                    "spec": {"nodeName": "mynodehostname"},
                    "status": {"phase": "Running", "conditions": [], "containerStatuses": []}
                },
                {
                    "metadata": {"uid": "u2", "namespace": "kube-system", "name": "kube-proxy-hfqwt"},
                    "spec": {"nodeName": "mynodehostname"},
                    "status": {"phase": "Running", "conditions": [], "containerStatuses": []}
                }
            ]
        });
        Mock::given(method("GET"))
            .and(path("/pods"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&fixture))
            .mount(&server)
            .await;

        let port = server.address().port();
        let comp = component_with_checks(true, true, port);
        let result = comp.check().await;

        assert_eq!(result.health, Health::Healthy);
        assert_eq!(result.reason, "total 2 pods (node mynodehostname)");
        let extra = result.extra_info.unwrap();
        assert_eq!(extra.encoding, "json");
        let pods = extra.data.get("pods").unwrap().as_array().unwrap();
        assert_eq!(pods[0]["name"], "vector-jldbs");
        assert_eq!(pods[1]["name"], "kube-proxy-hfqwt");
    }

    #[tokio::test]
    async fn s3_flaky_kubelet_trips_then_recovers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pods"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(5)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/pods"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
            .mount(&server)
            .await;

        let port = server.address().port();
        let comp = component_with_checks(true, true, port);

        let mut last = None;
        for _ in 0..5 {
            last = Some(comp.check().await);
        }
        let fifth = last.unwrap();
        assert_eq!(fifth.health, Health::Unhealthy);
        assert_eq!(
            fifth.reason,
            "list pods from kubelet read-only port failed 5 time(s)"
        );

        let sixth = comp.check().await;
        assert_eq!(sixth.health, Health::Healthy);
        assert_eq!(sixth.reason, "total 0 pods (node mynodehostname)");
    }
}
