//! Thin axum layer over the registry's in-process API.
//!
//! Mirrors the teacher's `ci::server` shape (`ServerState` + `build_router`
//! + `run_server`, one handler per route, `TraceLayer` for request spans):
//! see `crates/healer/src/ci/server.rs`. The full HTTPS transport this
//! would sit behind is out of scope (`SPEC_FULL.md` §6); this only shows
//! the seam a real transport plugs into.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use gpud_core::{GpudError, HealthState};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::bootstrap::Daemon;

/// Body size cap for plugin-spec registration requests.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the router every route hangs off of. `TraceLayer` gives one span
/// per request the way the teacher's `build_router` does; the timeout and
/// body-limit layers guard the transport seam against a slow or oversized
/// client the way a production ingress would.
pub fn build_router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/healthz", get(liveness_handler))
        .route("/api/v1/health", get(list_health_states_handler))
        .route("/api/v1/health/{component}", get(component_health_handler))
        .route("/api/v1/components/{component}/trigger", post(trigger_check_handler))
        .route("/api/v1/components/{component}", axum::routing::delete(deregister_handler))
        .route("/api/v1/plugins", get(list_plugins_handler).post(register_plugin_handler))
        .route("/api/v1/plugins/{name}", put(update_plugin_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(daemon)
}

/// Bind and serve until the process receives a shutdown signal, then close
/// every component. Mirrors the teacher's `run_server`.
pub async fn serve(daemon: Arc<Daemon>, bind_addr: &str) -> anyhow::Result<()> {
    let registry = daemon.registry.clone();
    let app = build_router(daemon);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "gpud serving");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.close_all().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    status: &'static str,
    version: &'static str,
}

async fn liveness_handler() -> impl IntoResponse {
    Json(LivenessResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Deserialize)]
struct ListHealthQuery {
    component: Option<String>,
}

/// `GetHealthStates`: every registered component's last cached result, or
/// a single component's when `?component=` is given.
async fn list_health_states_handler(
    State(daemon): State<Arc<Daemon>>,
    Query(query): Query<ListHealthQuery>,
) -> impl IntoResponse {
    if let Some(name) = query.component {
        return component_health_handler(State(daemon), Path(name)).await.into_response();
    }

    let components = daemon.registry.list().await;
    let mut states: Vec<HealthState> = Vec::with_capacity(components.len());
    for component in components {
        states.extend(component.last_health_states().await);
    }
    Json(states).into_response()
}

async fn component_health_handler(
    State(daemon): State<Arc<Daemon>>,
    Path(component): Path<String>,
) -> impl IntoResponse {
    match daemon.registry.get(&component).await {
        Ok(component) => Json(component.last_health_states().await).into_response(),
        Err(err) => gpud_error_response(&err),
    }
}

/// `TriggerCheck`: synchronously run one component's `Check` and return the
/// fresh result.
async fn trigger_check_handler(
    State(daemon): State<Arc<Daemon>>,
    Path(component): Path<String>,
) -> impl IntoResponse {
    match daemon.registry.trigger_check(&component).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => gpud_error_response(&err),
    }
}

async fn deregister_handler(State(daemon): State<Arc<Daemon>>, Path(component): Path<String>) -> impl IntoResponse {
    match daemon.registry.deregister(&component).await {
        Ok(()) => {
            daemon.plugin_specs.write().await.remove(&component);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => gpud_error_response(&err),
    }
}

async fn list_plugins_handler(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    let specs: Vec<_> = daemon.plugin_specs.read().await.values().cloned().collect();
    Json(specs)
}

/// `RegisterCustomPlugin`.
async fn register_plugin_handler(
    State(daemon): State<Arc<Daemon>>,
    Json(spec): Json<gpud_plugins::PluginSpec>,
) -> impl IntoResponse {
    match crate::bootstrap::register_plugin(
        &daemon.registry,
        &daemon.plugin_specs,
        &daemon.plugin_manager,
        &daemon.bash_path,
        daemon.plugin_minimum_retry,
        spec,
    )
    .await
    {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => anyhow_error_response(&err),
    }
}

/// `UpdateCustomPlugin`. `name` in the path must match the spec's own
/// derived component name; a mismatch is a validation error rather than a
/// silent rename.
async fn update_plugin_handler(
    State(daemon): State<Arc<Daemon>>,
    Path(name): Path<String>,
    Json(spec): Json<gpud_plugins::PluginSpec>,
) -> impl IntoResponse {
    if spec.component_name() != name {
        return gpud_error_response(&GpudError::validation(format!(
            "path component '{name}' does not match spec-derived name '{}'",
            spec.component_name()
        )));
    }

    match crate::bootstrap::update_plugin(
        &daemon.registry,
        &daemon.plugin_specs,
        &daemon.plugin_manager,
        &daemon.bash_path,
        daemon.plugin_minimum_retry,
        spec,
    )
    .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => anyhow_error_response(&err),
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn gpud_error_response(err: &GpudError) -> axum::response::Response {
    let status = match err {
        GpudError::NotFound(_) => StatusCode::NOT_FOUND,
        GpudError::AlreadyExists(_) => StatusCode::CONFLICT,
        GpudError::Validation(_) => StatusCode::BAD_REQUEST,
        GpudError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        GpudError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        GpudError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "gpud internal error");
    }
    (status, Json(ErrorResponse { error: err.to_string() })).into_response()
}

/// `register_plugin`/`update_plugin` return `anyhow::Error` (they wrap
/// `SpecError` and `GpudError` behind one boundary); downcast back to
/// `GpudError` for status-code mapping when possible, otherwise this is a
/// spec-validation failure and gets `400`.
fn anyhow_error_response(err: &anyhow::Error) -> axum::response::Response {
    if let Some(gpud_err) = err.downcast_ref::<GpudError>() {
        return gpud_error_response(gpud_err);
    }
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: err.to_string() })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::bootstrap;
    use crate::config::GpudConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    async fn test_daemon() -> (Arc<Daemon>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = GpudConfig {
            ledger_db_path: dir.path().join("ledger.sqlite"),
            mount_points: vec!["/".to_string()],
            ..GpudConfig::default()
        };
        let daemon = bootstrap(&config, CancellationToken::new()).await.unwrap();
        (Arc::new(daemon), dir)
    }

    #[tokio::test]
    async fn liveness_returns_ok() {
        let (daemon, _dir) = test_daemon().await;
        let app = build_router(daemon);

        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn trigger_check_on_unknown_component_is_404() {
        let (daemon, _dir) = test_daemon().await;
        let app = build_router(daemon);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/components/does-not-exist/trigger")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trigger_check_on_cpu_returns_a_result() {
        let (daemon, _dir) = test_daemon().await;
        let app = build_router(daemon);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/components/cpu/trigger")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_plugin_then_list_contains_it() {
        let (daemon, _dir) = test_daemon().await;
        let app = build_router(daemon);

        let body = serde_json::json!({
            "pluginName": "gpu-xid-check",
            "type": "component",
            "mode": "manual",
            "healthStatePlugin": [
                {"name": "probe", "runBashScript": {"script": "echo ok"}}
            ]
        });

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/plugins")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(Request::builder().uri("/api/v1/plugins").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
