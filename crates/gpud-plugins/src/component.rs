//! Synthesizes a [`gpud_core::Component`] from a [`PluginSpec`]: running its
//! steps in order, parsing the final step's stdout, and reporting the
//! result through the same `Component` contract every built-in uses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gpud_core::{CheckResult, Component, ExtraInfo, Health, ResultCache};
use serde_json::json;
use tracing::warn;

use crate::parser;
use crate::runner::{PluginManager, RunOptions};
use crate::spec::PluginSpec;

pub struct PluginComponent {
    spec: PluginSpec,
    component_name: String,
    manager: Arc<PluginManager>,
    bash_path: String,
    minimum_retry: Duration,
    cache: ResultCache,
}

impl PluginComponent {
    #[must_use]
    pub fn new(
        spec: PluginSpec,
        manager: Arc<PluginManager>,
        bash_path: impl Into<String>,
        minimum_retry: Duration,
    ) -> Self {
        let component_name = spec.component_name();
        Self {
            cache: ResultCache::new(component_name.clone()),
            component_name,
            spec,
            manager,
            bash_path: bash_path.into(),
            minimum_retry,
        }
    }

    #[must_use]
    pub fn is_manual(&self) -> bool {
        self.spec.mode == crate::spec::PluginMode::Manual
    }

    #[must_use]
    pub fn is_init(&self) -> bool {
        self.spec.plugin_type == crate::spec::PluginType::Init
    }

    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.spec.interval()
    }

    async fn run_steps(&self) -> CheckResult {
        let opts = RunOptions {
            minimum_retry: self.minimum_retry,
        };

        let mut last_stdout = String::new();
        for step in &self.spec.health_state_plugin {
            let script = match step.run_bash_script.decode() {
                Ok(s) => s,
                Err(e) => {
                    return CheckResult::new(
                        &self.component_name,
                        Health::Unhealthy,
                        format!("step '{}' has invalid script content", step.name),
                    )
                    .with_error(e.to_string());
                }
            };

            let outcome = self
                .manager
                .start_bash_script(&self.bash_path, &step.name, &script, self.spec.timeout(), opts)
                .await;

            match outcome {
                Ok(run) if run.exit_code == 0 => {
                    last_stdout = run.stdout;
                }
                Ok(run) => {
                    return CheckResult::new(
                        &self.component_name,
                        Health::Unhealthy,
                        format!("step '{}' exited with code {}", step.name, run.exit_code),
                    )
                    .with_error(format!("stdout: {}\nstderr: {}", run.stdout, run.stderr));
                }
                Err(e) => {
                    warn!(component = %self.component_name, step = %step.name, error = %e, "plugin step failed to run");
                    return CheckResult::new(
                        &self.component_name,
                        Health::Unhealthy,
                        format!("step '{}' failed to run", step.name),
                    )
                    .with_error(e.to_string());
                }
            }
        }

        self.build_success_result(&last_stdout)
    }

    /// All steps succeeded, so the component itself is always `Healthy`
    /// with reason `"ok"` here — the parser's extracted fields (including
    /// a `health`/`name` field the plugin's own JSON happens to carry) are
    /// informational and land in `extra_info` only. See `DESIGN.md` for
    /// why this resolves the spec's parser-override language in favor of
    /// its own worked example.
    fn build_success_result(&self, final_stdout: &str) -> CheckResult {
        let mut extra = serde_json::Map::new();

        if let Some(extractions) = &self.spec.parser {
            let parsed = parser::parse(final_stdout, extractions);
            for (field, value) in parsed.fields {
                extra.insert(field, value);
            }
        }

        extra.insert(
            "last_check_ts_unix_seconds".to_string(),
            json!(chrono::Utc::now().timestamp()),
        );

        CheckResult::new(&self.component_name, Health::Healthy, "ok")
            .with_extra_info(ExtraInfo::json(serde_json::Value::Object(extra)))
    }
}

#[async_trait]
impl Component for PluginComponent {
    fn name(&self) -> &str {
        &self.component_name
    }

    async fn check(&self) -> CheckResult {
        let result = self.run_steps().await;
        self.cache.store(result.clone()).await;
        result
    }

    async fn last_health_states(&self) -> Vec<gpud_core::HealthState> {
        self.cache.last_health_states().await
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ContentType, PluginMode, PluginType, RunBashScript, Step};
    use crate::spec::JsonPathExtraction;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct InMemoryLedger {
        rows: Mutex<HashMap<String, gpud_core::LedgerEntry>>,
    }

    impl InMemoryLedger {
        fn new() -> Self {
            Self {
                rows: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl gpud_core::PluginLedger for InMemoryLedger {
        async fn get(&self, script_id: &str) -> gpud_core::Result<Option<gpud_core::LedgerEntry>> {
            Ok(self.rows.lock().unwrap().get(script_id).cloned())
        }

        async fn record_start(&self, script_id: &str, script_name: &str, started: i64) -> gpud_core::Result<()> {
            let mut rows = self.rows.lock().unwrap();
            let entry = rows.entry(script_id.to_string()).or_default();
            entry.last_started_unix_seconds = Some(started);
            entry.script_name = Some(script_name.to_string());
            Ok(())
        }

        async fn update_exit_code(&self, script_id: &str, code: i32) -> gpud_core::Result<()> {
            self.rows.lock().unwrap().entry(script_id.to_string()).or_default().last_exit_code = Some(code);
            Ok(())
        }

        async fn update_output(&self, script_id: &str, output: &str) -> gpud_core::Result<()> {
            self.rows.lock().unwrap().entry(script_id.to_string()).or_default().last_output =
                Some(output.to_string());
            Ok(())
        }
    }

    /// S7: a plugin whose final step prints `{"name":"X","health":"degraded"}`,
    /// registered with a `$.name`/`$.health` parser, still reports the
    /// component itself as `Healthy`/`"ok"` (every step exited 0) while the
    /// parsed fields land in `extra_info` as data rather than overriding the
    /// verdict — see `DESIGN.md`'s resolution of the spec's parser-override
    /// ambiguity against scenario S7.
    #[tokio::test]
    async fn auto_plugin_with_parser_reports_healthy_and_surfaces_parsed_fields() {
        let spec = PluginSpec {
            plugin_name: "degraded-reporter".to_string(),
            plugin_type: PluginType::Component,
            mode: PluginMode::Auto,
            timeout_secs: 30,
            interval_secs: 60,
            health_state_plugin: vec![
                Step {
                    name: "step1".to_string(),
                    run_bash_script: RunBashScript {
                        script: "true".to_string(),
                        content_type: ContentType::Plaintext,
                    },
                },
                Step {
                    name: "step2".to_string(),
                    run_bash_script: RunBashScript {
                        script: "true".to_string(),
                        content_type: ContentType::Plaintext,
                    },
                },
                Step {
                    name: "step3".to_string(),
                    run_bash_script: RunBashScript {
                        script: "echo '{\"name\":\"X\",\"health\":\"degraded\"}'".to_string(),
                        content_type: ContentType::Plaintext,
                    },
                },
            ],
            parser: Some(vec![
                JsonPathExtraction {
                    field: "name".to_string(),
                    query: "$.name".to_string(),
                },
                JsonPathExtraction {
                    field: "health".to_string(),
                    query: "$.health".to_string(),
                },
            ]),
        };

        let manager = Arc::new(PluginManager::new(Arc::new(InMemoryLedger::new()), None));
        let component = PluginComponent::new(spec, manager, "/bin/bash", Duration::ZERO);

        let before = chrono::Utc::now().timestamp();
        let result = component.check().await;
        let after = chrono::Utc::now().timestamp();

        assert_eq!(result.health, Health::Healthy);
        assert_eq!(result.reason, "ok");

        let extra = result.extra_info.expect("success result always carries extra_info");
        assert_eq!(extra.encoding, "json");
        let data = extra.data.as_object().expect("extra_info.data is a JSON object");
        assert_eq!(data.get("name").unwrap(), "X");
        assert_eq!(data.get("health").unwrap(), "degraded");

        let ts = data
            .get("last_check_ts_unix_seconds")
            .and_then(serde_json::Value::as_i64)
            .expect("last_check_ts_unix_seconds present");
        assert!(ts >= before - 1 && ts <= after + 1);

        let states = component.last_health_states().await;
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].health, Health::Healthy);
    }
}
