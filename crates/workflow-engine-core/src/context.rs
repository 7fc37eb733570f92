//! # Context Model
//!
//! [`Context`] is the only thing templates and task handlers may read from. It exposes
//! exactly four top-level namespaces — `args`, `env`, `steps`, and (inside a batch
//! sub-task) `batch` — plus a handful of scalar globals (`workflow_name`, `workspace`,
//! `run_number`, `timestamp`, `workflow_file`).
//!
//! A `Context` is cheap to snapshot: every mutation (`with_step_result`, `with_batch`)
//! returns a new `Context` built from a clone of the previous one, so a reference handed
//! to concurrent batch workers is never observably mutated out from under them.

use serde_json::Value;
use std::collections::HashMap;

use crate::error::TemplateError;

/// A JSON value keyed by name, forming one namespace (`args`, `env`, or the ad hoc
/// per-batch-item `batch` namespace).
pub type Namespace = HashMap<String, Value>;

#[derive(Debug, Clone)]
pub struct Context {
    args: Namespace,
    env: Namespace,
    steps: HashMap<String, Value>,
    outputs: Namespace,
    batch: Option<Namespace>,
    error: Option<Namespace>,
    workflow_name: String,
    workflow_file: String,
    workspace: String,
    run_number: u64,
    timestamp: String,
}

/// Handle returned by [`Context::get`] when a namespace/key lookup fails, carrying
/// enough information for [`TemplateError::NotFound`].
pub struct Lookup<'a> {
    pub namespace: &'a str,
    pub key: &'a str,
}

impl Context {
    pub fn new(
        workflow_name: impl Into<String>,
        workflow_file: impl Into<String>,
        workspace: impl Into<String>,
        run_number: u64,
        args: Namespace,
        env: Namespace,
    ) -> Self {
        Self {
            args,
            env,
            steps: HashMap::new(),
            outputs: HashMap::new(),
            batch: None,
            error: None,
            workflow_name: workflow_name.into(),
            workflow_file: workflow_file.into(),
            workspace: workspace.into(),
            run_number,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn run_number(&self) -> u64 {
        self.run_number
    }

    /// Looks up `namespace.key`. Namespaces other than `args`, `env`, `steps`, `batch`
    /// and the scalar globals do not exist and always fail.
    pub fn get(&self, namespace: &str, name: &str) -> Result<Value, TemplateError> {
        let ns = self.resolve_namespace(namespace)?;
        ns.get(name).cloned().ok_or_else(|| TemplateError::NotFound {
            namespace: namespace.to_string(),
            key: name.to_string(),
            available: {
                let mut keys: Vec<String> = ns.keys().cloned().collect();
                keys.sort();
                keys
            },
        })
    }

    fn resolve_namespace(&self, namespace: &str) -> Result<&Namespace, TemplateError> {
        match namespace {
            "args" => Ok(&self.args),
            "env" => Ok(&self.env),
            "outputs" => Ok(&self.outputs),
            "batch" => self.batch.as_ref().ok_or_else(|| TemplateError::NotFound {
                namespace: "batch".to_string(),
                key: String::new(),
                available: Vec::new(),
            }),
            "error" => self.error.as_ref().ok_or_else(|| TemplateError::NotFound {
                namespace: "error".to_string(),
                key: String::new(),
                available: Vec::new(),
            }),
            other => Err(TemplateError::NotFound {
                namespace: other.to_string(),
                key: String::new(),
                available: self.available().into_keys().collect(),
            }),
        }
    }

    /// Returns the step result stored for `name`, if the step has started.
    pub fn step(&self, name: &str) -> Option<&Value> {
        self.steps.get(name)
    }

    /// The full set of keys available per namespace, for [`TemplateError`] enrichment
    /// and for [`crate::task::TaskConfig::get_available_variables`].
    pub fn available(&self) -> HashMap<String, Vec<String>> {
        let mut map = HashMap::new();
        map.insert("args".to_string(), sorted_keys(&self.args));
        map.insert("env".to_string(), sorted_keys(&self.env));
        map.insert("steps".to_string(), {
            let mut keys: Vec<String> = self.steps.keys().cloned().collect();
            keys.sort();
            keys
        });
        if !self.outputs.is_empty() {
            map.insert("outputs".to_string(), sorted_keys(&self.outputs));
        }
        if let Some(batch) = &self.batch {
            map.insert("batch".to_string(), sorted_keys(batch));
        }
        if let Some(error) = &self.error {
            map.insert("error".to_string(), sorted_keys(error));
        }
        map.insert(
            "globals".to_string(),
            vec![
                "workflow_name".to_string(),
                "workspace".to_string(),
                "run_number".to_string(),
                "timestamp".to_string(),
                "workflow_file".to_string(),
            ],
        );
        map
    }

    /// Returns a JSON object suitable for handing to the template engine as the
    /// render root: `{ args, env, steps, outputs, batch?, workflow_name, ... }`.
    pub fn to_render_root(&self) -> Value {
        let mut root = serde_json::Map::new();
        root.insert("args".to_string(), Value::Object(self.args.clone().into_iter().collect()));
        root.insert("env".to_string(), Value::Object(self.env.clone().into_iter().collect()));
        root.insert("steps".to_string(), Value::Object(self.steps.clone().into_iter().collect()));
        root.insert("outputs".to_string(), Value::Object(self.outputs.clone().into_iter().collect()));
        if let Some(batch) = &self.batch {
            root.insert("batch".to_string(), Value::Object(batch.clone().into_iter().collect()));
        }
        if let Some(error) = &self.error {
            root.insert("error".to_string(), Value::Object(error.clone().into_iter().collect()));
        }
        root.insert("workflow_name".to_string(), Value::String(self.workflow_name.clone()));
        root.insert("workflow_file".to_string(), Value::String(self.workflow_file.clone()));
        root.insert("workspace".to_string(), Value::String(self.workspace.clone()));
        root.insert("run_number".to_string(), serde_json::json!(self.run_number));
        root.insert("timestamp".to_string(), Value::String(self.timestamp.clone()));
        Value::Object(root)
    }

    /// Returns a copy of this context with `name`'s step result recorded (or replaced).
    /// Previous snapshots (e.g. ones already handed to a running batch) are unaffected.
    pub fn with_step_result(&self, name: &str, result: Value) -> Self {
        let mut next = self.clone();
        next.steps.insert(name.to_string(), result);
        next
    }

    /// Applies the legacy `outputs:` alias: copies `steps.<name>.<field>` (or the whole
    /// result, if `field` is absent) onto the top-level `outputs` namespace.
    pub fn with_legacy_output(&self, output_name: &str, value: Value) -> Self {
        let mut next = self.clone();
        next.outputs.insert(output_name.to_string(), value);
        next
    }

    /// Shadows the `batch` namespace for one sub-task invocation; used only by the
    /// batch processor, never by the main step loop.
    pub fn with_batch(&self, item: Value, index: usize, total: usize, name: &str) -> Self {
        let mut next = self.clone();
        let mut batch_ns = Namespace::new();
        batch_ns.insert("item".to_string(), item);
        batch_ns.insert("index".to_string(), serde_json::json!(index));
        batch_ns.insert("total".to_string(), serde_json::json!(total));
        batch_ns.insert("name".to_string(), Value::String(name.to_string()));
        next.batch = Some(batch_ns);
        next
    }

    /// Extends the context with an `error = { step, message, retry_count, task_type,
    /// original }` namespace for resolving `on_error.message` templates.
    pub fn with_error(&self, error_ns: Namespace) -> Self {
        let mut next = self.clone();
        next.error = Some(error_ns);
        next
    }
}

fn sorted_keys(ns: &Namespace) -> Vec<String> {
    let mut keys: Vec<String> = ns.keys().cloned().collect();
    keys.sort();
    keys
}
