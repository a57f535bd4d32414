//! Custom bash-plugin runtime: spec parsing, the rate-limited/deduped
//! script runner, JSON-path output parsing, and the synthesized
//! [`gpud_core::Component`] that wires them together.

pub mod component;
pub mod parser;
pub mod runner;
pub mod spec;

pub use component::PluginComponent;
pub use runner::{PluginManager, RunOptions, RunOutcome};
pub use spec::{
    sanitize_component_name, ContentType, JsonPathExtraction, PluginMode, PluginSpec, PluginType,
    RunBashScript, SpecError, Step,
};
