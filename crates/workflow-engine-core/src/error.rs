//! Error taxonomy for the workflow engine.
//!
//! Every failure surfaced by this crate is one of four kinds:
//!
//! - [`WorkflowValidationError`]: document-level issues, raised before any step runs.
//! - [`TemplateError`]: template parse / undefined-variable / filter-type errors.
//! - [`TaskExecutionError`]: a failure inside a task handler.
//! - [`WorkflowError`]: the terminal, caller-visible error, wrapping the others.

use std::collections::HashMap;

/// Issues found while validating a workflow document or flow selection, before
/// any step has started executing.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowValidationError {
    #[error("missing required parameter: {name}")]
    MissingRequiredParam { name: String },

    #[error("unknown flow: {name}")]
    UnknownFlow { name: String },

    #[error("flow {flow} references unknown step: {step}")]
    UnknownStepInFlow { flow: String, step: String },

    #[error("duplicate flow name: {name}")]
    DuplicateFlowName { name: String },

    #[error("duplicate step name: {name}")]
    DuplicateStepName { name: String },

    #[error("on_error.next on step {step} references unknown step: {target}")]
    UnknownJumpTarget { step: String, target: String },

    #[error("action=next on step {step} requires on_error.next")]
    MissingJumpTarget { step: String },
}

/// A template failed to resolve. Carries the keys available in each namespace so
/// the caller can see what *was* in scope.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error(
        "undefined variable '{expr}' in template; available namespaces: {}",
        format_available(.available)
    )]
    Undefined {
        expr: String,
        available: HashMap<String, Vec<String>>,
    },

    #[error("template syntax error in '{template}': {message}")]
    Syntax { template: String, message: String },

    #[error("filter '{filter}' cannot be applied to value of type {value_type}")]
    FilterTypeMismatch { filter: String, value_type: String },

    #[error("namespace '{namespace}' has no such key: {key}; available keys: {available:?}")]
    NotFound {
        namespace: String,
        key: String,
        available: Vec<String>,
    },

    #[error("template rendering failed: {message}")]
    RenderError { message: String },
}

fn format_available(available: &HashMap<String, Vec<String>>) -> String {
    let mut namespaces: Vec<&String> = available.keys().collect();
    namespaces.sort();
    namespaces
        .into_iter()
        .map(|ns| format!("{}=[{}]", ns, available[ns].join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A failure raised by (or funneled through) a task handler during dispatch.
#[derive(Debug, thiserror::Error)]
#[error("task '{task_type}' failed in step '{step_name}' after {retries} retries: {original_error}")]
pub struct TaskExecutionError {
    pub step_name: String,
    pub task_type: String,
    pub retries: u32,
    #[source]
    pub original_error: Box<WorkflowError>,
}

impl TaskExecutionError {
    pub fn new(step_name: impl Into<String>, task_type: impl Into<String>, original_error: WorkflowError) -> Self {
        Self {
            step_name: step_name.into(),
            task_type: task_type.into(),
            retries: 0,
            original_error: Box::new(original_error),
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// The top-level error type returned to callers of the engine.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow validation failed: {0}")]
    Validation(#[from] WorkflowValidationError),

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("step '{step_name}' failed: {error_message}")]
    StepFailed {
        step_name: String,
        #[source]
        source: TaskExecutionError,
        error_message: String,
    },

    #[error("jump count exceeded bound of {limit} while processing on_error.next chains")]
    JumpLimitExceeded { limit: u32 },

    #[error("state store error: {message}")]
    StateStore { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("task type not registered: {task_type}")]
    UnknownTaskType { task_type: String },
}

impl WorkflowError {
    pub fn step_failed(source: TaskExecutionError, error_message: impl Into<String>) -> Self {
        Self::StepFailed {
            step_name: source.step_name.clone(),
            source,
            error_message: error_message.into(),
        }
    }
}

impl From<std::io::Error> for WorkflowError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for WorkflowError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization { message: e.to_string() }
    }
}

impl From<TaskExecutionError> for WorkflowError {
    fn from(e: TaskExecutionError) -> Self {
        let message = e.to_string();
        Self::StepFailed {
            step_name: e.step_name.clone(),
            source: e,
            error_message: message,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WorkflowError>;
