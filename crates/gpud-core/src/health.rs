//! The health-state model shared by every component: [`Health`], the
//! per-check [`HealthState`] row, and the immutable [`CheckResult`]
//! snapshot a `Check` call produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The four health values a component can report. Never empty on a
/// [`CheckResult`] — exactly one of these is always set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
    Initializing,
}

impl Health {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "Healthy",
            Self::Degraded => "Degraded",
            Self::Unhealthy => "Unhealthy",
            Self::Initializing => "Initializing",
        }
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Extra JSON payload attached to a [`HealthState`] when a component's
/// typed payload is non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraInfo {
    pub data: serde_json::Value,
    pub encoding: String,
}

impl ExtraInfo {
    #[must_use]
    pub fn json(data: serde_json::Value) -> Self {
        Self {
            data,
            encoding: "json".to_string(),
        }
    }
}

/// One row of health output for a component, as returned by
/// `LastHealthStates`/`Check` and consumed by the (external) API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthState {
    pub name: String,
    pub health: Health,
    pub reason: String,
    pub error: Option<String>,
    pub extra_info: Option<ExtraInfo>,
}

impl HealthState {
    #[must_use]
    pub fn new(name: impl Into<String>, health: Health, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            health,
            reason: reason.into(),
            error: None,
            extra_info: None,
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub fn with_extra_info(mut self, extra: ExtraInfo) -> Self {
        self.extra_info = Some(extra);
        self
    }

    /// The canonical "not checked yet" state every component returns before
    /// its first `Check` completes.
    #[must_use]
    pub fn no_data_yet(name: impl Into<String>) -> Self {
        Self::new(name, Health::Healthy, "no data yet")
    }
}

/// The immutable record produced by one invocation of `Check`.
///
/// Invariant: if `error` is `Some`, `health` must be `Unhealthy` or
/// `Degraded` unless the component's soft-error predicate says otherwise —
/// that predicate is applied by the component before constructing this
/// result, not enforced here, since only the component knows which errors
/// of its own are "soft".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub component_name: String,
    pub timestamp: DateTime<Utc>,
    pub health: Health,
    pub reason: String,
    pub error: Option<String>,
    pub extra_info: Option<ExtraInfo>,
}

impl CheckResult {
    #[must_use]
    pub fn new(component_name: impl Into<String>, health: Health, reason: impl Into<String>) -> Self {
        Self {
            component_name: component_name.into(),
            timestamp: Utc::now(),
            health,
            reason: reason.into(),
            error: None,
            extra_info: None,
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub fn with_extra_info(mut self, extra: ExtraInfo) -> Self {
        self.extra_info = Some(extra);
        self
    }

    /// A short line for operator display, e.g. in scan output.
    #[must_use]
    pub fn summary(&self) -> String {
        format!("{}: {} ({})", self.component_name, self.health, self.reason)
    }

    /// Full multi-line representation; built-in components override the
    /// equivalent on their typed payload and fall back to this.
    #[must_use]
    pub fn to_display_string(&self) -> String {
        let mut out = self.summary();
        if let Some(err) = &self.error {
            out.push_str(&format!("\n  error: {err}"));
        }
        if let Some(extra) = &self.extra_info {
            out.push_str(&format!(
                "\n  data: {}",
                serde_json::to_string_pretty(&extra.data).unwrap_or_default()
            ));
        }
        out
    }

    #[must_use]
    pub fn health_states(&self) -> Vec<HealthState> {
        let mut state = HealthState::new(self.component_name.clone(), self.health, self.reason.clone());
        if let Some(err) = &self.error {
            state = state.with_error(err.clone());
        }
        if let Some(extra) = &self.extra_info {
            state = state.with_extra_info(extra.clone());
        }
        vec![state]
    }
}
