//! Workflow document model — the types the engine consumes after YAML parsing.
//!
//! Schema validation beyond what the engine itself needs (i.e. catching structurally
//! invalid documents before they reach [`crate::engine::Engine`]) is the concern of an
//! external collaborator; this module only defines the shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A workflow document as parsed from YAML. Unknown top-level keys are accepted for
/// forward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDocument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub params: HashMap<String, ParamSpec>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub flows: Option<Flows>,
    pub steps: Vec<Step>,

    /// Anything else in the document that the engine doesn't interpret.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// The name of the implicit flow used when a document declares no `flows` block.
pub const IMPLICIT_FLOW_NAME: &str = "all";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flows {
    #[serde(default)]
    pub default: Option<String>,
    pub definitions: Vec<FlowDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    pub steps: Vec<String>,
}

/// A single step in a workflow document. Unknown keys are rejected (`deny_unknown_fields`)
/// to catch typos.
///
/// `params:` is accepted as a deprecated alias for `inputs:`; when both are present,
/// `inputs:` wins.
///
/// `name` defaults to an empty string when absent: a top-level step always needs one
/// (the engine rejects duplicates and dangling flow/jump references at validation
/// time), but a batch step's `task:` sub-mapping is deserialized through this same
/// type and is allowed to omit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    #[serde(default)]
    pub name: String,
    pub task: String,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(rename = "params", default, skip_serializing_if = "Option::is_none")]
    pub legacy_params: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub on_error: Option<ErrorPolicy>,
    #[serde(default)]
    pub outputs: Option<OutputsSpec>,
}

impl Step {
    /// The effective input map, applying the `params:`-is-a-deprecated-alias-for-`inputs:`
    /// rule.
    pub fn effective_inputs(&self) -> &HashMap<String, Value> {
        if self.inputs.is_empty() {
            self.legacy_params.as_ref().unwrap_or(&self.inputs)
        } else {
            &self.inputs
        }
    }

    pub fn uses_legacy_params(&self) -> bool {
        self.inputs.is_empty() && self.legacy_params.is_some()
    }
}

/// `outputs:` may name one or several step-result keys to also surface into the
/// top-level `outputs` context map (legacy alias; canonical access stays
/// `steps.<name>.result.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputsSpec {
    Single(String),
    Many(Vec<String>),
}

impl OutputsSpec {
    pub fn names(&self) -> Vec<&str> {
        match self {
            OutputsSpec::Single(s) => vec![s.as_str()],
            OutputsSpec::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    Fail,
    Retry,
    Continue,
    Next,
}

impl Default for ErrorAction {
    fn default() -> Self {
        ErrorAction::Fail
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPolicy {
    #[serde(default)]
    pub action: ErrorAction,
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub delay: f64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            action: ErrorAction::Fail,
            retry: 0,
            delay: 0.0,
            next: None,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// The record the engine writes into `steps.<name>` after a step runs (or is skipped).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retries: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration: f64,
    /// Indices already processed by a `batch` step, for resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<BatchProgress>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BatchProgress {
    pub completed_indices: Vec<usize>,
}

impl StepResult {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            result: Value::Null,
            error: None,
            error_message: None,
            retries: 0,
            timestamp: Utc::now(),
            duration: 0.0,
            progress: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            result: Value::Null,
            ..Self::pending()
        }
    }

    pub fn running() -> Self {
        Self {
            status: StepStatus::Running,
            ..Self::pending()
        }
    }

    /// Normalizes a handler's return value via [`normalize_result`].
    pub fn completed(result: Value, retries: u32, duration: f64) -> Self {
        let normalized = normalize_result(result);
        Self {
            status: StepStatus::Completed,
            result: normalized,
            retries,
            duration,
            timestamp: Utc::now(),
            ..Self::pending()
        }
    }

    pub fn failed(error: String, error_message: String, retries: u32, duration: f64) -> Self {
        Self {
            status: StepStatus::Failed,
            result: Value::Null,
            error: Some(error),
            error_message: Some(error_message),
            retries,
            duration,
            timestamp: Utc::now(),
            progress: None,
        }
    }
}

/// Wraps a non-mapping task result as `{ "result": value }`; mappings pass through
/// unchanged.
pub fn normalize_result(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        other => serde_json::json!({ "result": other }),
    }
}
