//! Wire format for custom-plugin definitions.
//!
//! Parsed from YAML or JSON via `serde`, with `deny_unknown_fields` so a
//! malformed spec (typo'd key, wrong nesting) is rejected outright rather
//! than silently ignored.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where a plugin component runs: on the scheduler (`Auto`) or only on
/// explicit trigger (`Manual`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginMode {
    Auto,
    Manual,
}

/// Whether a plugin spec describes a recurring component or a one-shot
/// bootstrap-time init step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Component,
    Init,
}

/// `script` may be given as plaintext or base64-encoded bash content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Plaintext,
    Base64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RunBashScript {
    pub script: String,
    #[serde(default = "default_content_type")]
    pub content_type: ContentType,
}

fn default_content_type() -> ContentType {
    ContentType::Plaintext
}

impl RunBashScript {
    /// Decode `script` into the literal bash source to execute.
    pub fn decode(&self) -> Result<String, SpecError> {
        match self.content_type {
            ContentType::Plaintext => Ok(self.script.clone()),
            ContentType::Base64 => {
                use base64::Engine as _;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(self.script.as_bytes())
                    .map_err(|e| SpecError::InvalidBase64(e.to_string()))?;
                String::from_utf8(bytes).map_err(|e| SpecError::InvalidBase64(e.to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    pub run_bash_script: RunBashScript,
}

/// One JSON-path extraction applied to the final step's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct JsonPathExtraction {
    pub field: String,
    pub query: String,
}

fn default_interval_secs() -> u64 {
    0
}

fn default_timeout_secs() -> u64 {
    30
}

/// A custom-plugin component definition, as registered through
/// `RegisterCustomPlugin`/loaded from the plugin spec file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PluginSpec {
    pub plugin_name: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    pub mode: PluginMode,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 0 means "run once per component check" (i.e. driven purely by the
    /// scheduler's own tick, no independent interval of its own).
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    pub health_state_plugin: Vec<Step>,
    /// An ordered list of JSON-path extractions applied to the final
    /// step's stdout; `None` means no parsing is attempted.
    #[serde(default)]
    pub parser: Option<Vec<JsonPathExtraction>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("invalid base64 script content: {0}")]
    InvalidBase64(String),
    #[error("plugin spec parse error: {0}")]
    Parse(String),
    #[error("plugin spec validation error: {0}")]
    Validation(String),
}

impl PluginSpec {
    pub fn from_yaml(input: &str) -> Result<Vec<Self>, SpecError> {
        serde_yaml::from_str(input).map_err(|e| SpecError::Parse(e.to_string()))
    }

    pub fn from_json(input: &str) -> Result<Vec<Self>, SpecError> {
        serde_json::from_str(input).map_err(|e| SpecError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.plugin_name.trim().is_empty() {
            return Err(SpecError::Validation("pluginName is required".to_string()));
        }
        if self.health_state_plugin.is_empty() {
            return Err(SpecError::Validation(
                "healthStatePlugin must have at least one step".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        if self.interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.interval_secs))
        }
    }

    /// Derive the registry component name: lowercase, non-alphanumerics
    /// collapsed to a single `-`.
    #[must_use]
    pub fn component_name(&self) -> String {
        sanitize_component_name(&self.plugin_name)
    }
}

#[must_use]
pub fn sanitize_component_name(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_was_dash = false;
    for ch in lowered.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_lowercases_and_collapses_runs() {
        assert_eq!(sanitize_component_name("My Cool Plugin!!"), "my-cool-plugin");
        assert_eq!(sanitize_component_name("gpu___xid-Check"), "gpu-xid-check");
        assert_eq!(sanitize_component_name("---leading"), "leading");
    }

    #[test]
    fn base64_script_decodes() {
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode("echo hi");
        let step = RunBashScript {
            script: encoded,
            content_type: ContentType::Base64,
        };
        assert_eq!(step.decode().unwrap(), "echo hi");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let yaml = "
- pluginName: x
  type: component
  mode: auto
  healthStatePlugin:
    - name: step1
      runBashScript:
        script: echo hi
  unknownField: true
";
        let err = PluginSpec::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, SpecError::Parse(_)));
    }

    #[test]
    fn interval_zero_means_no_independent_interval() {
        let spec = PluginSpec {
            plugin_name: "p".to_string(),
            plugin_type: PluginType::Component,
            mode: PluginMode::Auto,
            timeout_secs: 30,
            interval_secs: 0,
            health_state_plugin: vec![],
            parser: None,
        };
        assert_eq!(spec.interval(), None);
    }
}
