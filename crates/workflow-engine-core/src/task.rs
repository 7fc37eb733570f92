//! # Task Dispatch Contract
//!
//! [`TaskHandler`] is the single-method capability every registered task type must
//! implement — a tagged-union-free way of doing polymorphism without an inheritance
//! hierarchy. [`TaskConfig`] is the per-invocation object handed to a handler;
//! [`TaskRegistry`] is the process-wide name→handler map, populated at startup and
//! then treated as read-only for the remainder of the process.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{TaskExecutionError, WorkflowError};
use crate::template::TemplateEngine;
use crate::workflow::Step;

/// The capability every task type must implement. A handler receives a
/// [`TaskConfig`] describing one step invocation and returns either a JSON mapping
/// (stored as-is) or any other JSON-serializable value (wrapped as `{ result: value
/// }` by the engine's normalization rule).
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, config: &TaskConfig) -> Result<Value, TaskExecutionError>;
}

/// The object handed to every task handler invocation.
pub struct TaskConfig {
    name: String,
    task_type: String,
    step: Step,
    workspace: PathBuf,
    context: Context,
    engine: Arc<TemplateEngine>,
    processed_inputs: once_cell::sync::OnceCell<HashMap<String, Value>>,
}

impl TaskConfig {
    pub fn new(
        name: impl Into<String>,
        task_type: impl Into<String>,
        step: Step,
        workspace: PathBuf,
        context: Context,
        engine: Arc<TemplateEngine>,
    ) -> Self {
        Self {
            name: name.into(),
            task_type: task_type.into(),
            step,
            workspace,
            context,
            engine,
            processed_inputs: once_cell::sync::OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn step(&self) -> &Step {
        &self.step
    }

    pub fn workspace(&self) -> &PathBuf {
        &self.workspace
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Runs template resolution over `step.inputs`, memoized so repeated
    /// calls within one handler invocation don't re-render.
    pub fn process_inputs(&self) -> Result<&HashMap<String, Value>, WorkflowError> {
        if let Some(cached) = self.processed_inputs.get() {
            return Ok(cached);
        }
        let root = self.context.to_render_root();
        let mut processed = HashMap::with_capacity(self.step.effective_inputs().len());
        for (key, value) in self.step.effective_inputs() {
            let rendered = self.engine.process_value(value, &root)?;
            processed.insert(key.clone(), rendered);
        }
        // OnceCell::set can race under concurrent callers; losing the race is fine,
        // the loser's result is identical (template resolution is pure).
        let _ = self.processed_inputs.set(processed);
        Ok(self.processed_inputs.get().expect("just set"))
    }

    /// Looks up a single variable by namespace/name, bypassing `process_inputs`.
    pub fn get_variable(&self, namespace: &str, name: &str) -> Result<Value, WorkflowError> {
        Ok(self.context.get(namespace, name)?)
    }

    pub fn get_available_variables(&self) -> HashMap<String, Vec<String>> {
        self.context.available()
    }
}

/// Process-wide name→handler map. Registration is explicit (`register`), not a
/// `ctor`/`inventory`-style global side-effect registry.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    /// Registers `handler` under `task_type`. Returns an error if the name is
    /// already taken: name collisions are rejected at registration time.
    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), WorkflowError> {
        let task_type = task_type.into();
        if self.handlers.contains_key(&task_type) {
            return Err(WorkflowError::Configuration {
                message: format!("task type '{}' is already registered", task_type),
            });
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}
