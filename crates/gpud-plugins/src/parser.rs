//! Applies a plugin's JSON-path extractions to the final step's stdout.
//!
//! Non-matching paths are skipped silently (the spec's stated behavior).
//! See `DESIGN.md` for why a `name`/`health` field in the plugin's raw
//! output lands only in `extra_info` here rather than overriding the
//! component's own health — the worked example in the spec's scenario S7
//! reports `Healthy` for a plugin whose JSON says `"health":"degraded"`,
//! so this parser surfaces those fields as data, not as a verdict.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::spec::JsonPathExtraction;

#[derive(Debug, Clone, Default)]
pub struct ParsedOutput {
    /// Extracted `{field: value}` pairs, destined for `extra_info`.
    pub fields: BTreeMap<String, Value>,
}

/// Parse `stdout` as JSON and run each extraction against it. If `stdout`
/// isn't valid JSON, returns an empty `ParsedOutput` rather than erroring —
/// a plugin author who configured a parser on non-JSON output gets no
/// extra fields, not a hard failure.
#[must_use]
pub fn parse(stdout: &str, extractions: &[JsonPathExtraction]) -> ParsedOutput {
    let Ok(value) = serde_json::from_str::<Value>(stdout.trim()) else {
        debug!("plugin stdout was not valid JSON; skipping parser");
        return ParsedOutput::default();
    };

    let mut fields = BTreeMap::new();
    for extraction in extractions {
        match jsonpath_lib::select(&value, &extraction.query) {
            Ok(matches) if !matches.is_empty() => {
                fields.insert(extraction.field.clone(), matches[0].clone());
            }
            _ => {
                debug!(query = %extraction.query, "json-path query had no match, skipping");
            }
        }
    }

    ParsedOutput { fields }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_matching_fields_and_overrides() {
        let stdout = r#"{"name":"X","health":"degraded","score":7}"#;
        let extractions = vec![
            JsonPathExtraction {
                field: "name".to_string(),
                query: "$.name".to_string(),
            },
            JsonPathExtraction {
                field: "health".to_string(),
                query: "$.health".to_string(),
            },
        ];
        let parsed = parse(stdout, &extractions);
        assert_eq!(parsed.fields.get("name").unwrap(), "X");
        assert_eq!(parsed.fields.get("health").unwrap(), "degraded");
    }

    #[test]
    fn non_matching_query_is_skipped_silently() {
        let stdout = r#"{"name":"X"}"#;
        let extractions = vec![JsonPathExtraction {
            field: "missing".to_string(),
            query: "$.nope".to_string(),
        }];
        let parsed = parse(stdout, &extractions);
        assert!(parsed.fields.is_empty());
    }

    #[test]
    fn non_json_stdout_yields_empty_result() {
        let parsed = parse("not json at all", &[]);
        assert!(parsed.fields.is_empty());
    }
}
