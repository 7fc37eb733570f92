//! # Engine
//!
//! [`Engine`] owns a validated [`WorkflowDocument`], a [`TaskRegistry`], and a
//! workspace directory, and drives one run: resolving a flow, walking its steps in
//! order, dispatching each to a task handler, and applying the per-step error-action
//! state machine (`fail` / `retry` / `continue` / `next`) when a step errors.
//!
//! Validation happens once, at construction, so a bad document fails fast instead of
//! partway through a run.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::batch::{BatchInputs, BatchProcessor};
use crate::config::EngineConfig;
use crate::context::{Context, Namespace};
use crate::error::{TaskExecutionError, WorkflowError, WorkflowValidationError};
use crate::state::{RunState, RunStatus, StateStore};
use crate::task::{TaskConfig, TaskRegistry};
use crate::template::{looks_like_template, TemplateEngine};
use crate::workflow::{ErrorAction, Step, StepResult, WorkflowDocument, IMPLICIT_FLOW_NAME};

/// The built-in task type a `batch` step must use; any other `task:` value on a
/// batch-shaped step is just an ordinary task.
pub const BATCH_TASK_TYPE: &str = "batch";

/// Inputs to one call to [`Engine::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub args: HashMap<String, Value>,
    pub flow: Option<String>,
    pub resume: bool,
    pub start_from: Option<String>,
    pub skip_steps: HashSet<String>,
}

pub struct Engine {
    doc: WorkflowDocument,
    registry: TaskRegistry,
    workspace: PathBuf,
    config: EngineConfig,
    template_engine: Arc<TemplateEngine>,
    state_store: StateStore,
}

impl Engine {
    /// Validates `doc` and builds an engine. See [`Engine::validate`] for the checks
    /// performed.
    pub fn new(doc: WorkflowDocument, registry: TaskRegistry, workspace: PathBuf) -> Result<Self, WorkflowError> {
        Self::with_config(doc, registry, workspace, EngineConfig::default())
    }

    pub fn with_config(
        doc: WorkflowDocument,
        registry: TaskRegistry,
        workspace: PathBuf,
        config: EngineConfig,
    ) -> Result<Self, WorkflowError> {
        Self::validate(&doc)?;
        let state_store = StateStore::with_state_dir(&workspace, &config.state_dir_name);
        Ok(Self {
            doc,
            registry,
            workspace,
            config,
            template_engine: Arc::new(TemplateEngine::new()),
            state_store,
        })
    }

    pub fn document(&self) -> &WorkflowDocument {
        &self.doc
    }

    /// Checks a document is internally consistent before any step runs:
    /// - No two steps share a name.
    /// - No two flow definitions share a name.
    /// - Every flow references only declared step names.
    /// - `flows.default`, if set, names a declared flow.
    /// - Every `on_error.next` target names a declared step.
    /// - `action: next` without `on_error.next` is rejected.
    ///
    /// Also logs a deprecation warning (not a validation failure) for any step still
    /// using the legacy `params:` key instead of `inputs:`.
    fn validate(doc: &WorkflowDocument) -> Result<(), WorkflowValidationError> {
        let mut seen_steps = HashSet::new();
        for step in &doc.steps {
            if !seen_steps.insert(step.name.as_str()) {
                return Err(WorkflowValidationError::DuplicateStepName { name: step.name.clone() });
            }
        }

        if let Some(flows) = &doc.flows {
            let mut seen_flows = HashSet::new();
            for flow in &flows.definitions {
                if !seen_flows.insert(flow.name.as_str()) {
                    return Err(WorkflowValidationError::DuplicateFlowName { name: flow.name.clone() });
                }
                for step_name in &flow.steps {
                    if !seen_steps.contains(step_name.as_str()) {
                        return Err(WorkflowValidationError::UnknownStepInFlow {
                            flow: flow.name.clone(),
                            step: step_name.clone(),
                        });
                    }
                }
            }
            if let Some(default) = &flows.default {
                if !seen_flows.contains(default.as_str()) {
                    return Err(WorkflowValidationError::UnknownFlow { name: default.clone() });
                }
            }
        }

        for step in &doc.steps {
            if let Some(policy) = &step.on_error {
                match policy.action {
                    ErrorAction::Next => {
                        let target = policy.next.as_ref().ok_or_else(|| {
                            WorkflowValidationError::MissingJumpTarget { step: step.name.clone() }
                        })?;
                        if !seen_steps.contains(target.as_str()) {
                            return Err(WorkflowValidationError::UnknownJumpTarget {
                                step: step.name.clone(),
                                target: target.clone(),
                            });
                        }
                    }
                    _ => {
                        if let Some(target) = &policy.next {
                            if !seen_steps.contains(target.as_str()) {
                                return Err(WorkflowValidationError::UnknownJumpTarget {
                                    step: step.name.clone(),
                                    target: target.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }

        for step in &doc.steps {
            if step.uses_legacy_params() {
                warn!(step = %step.name, "step uses deprecated 'params:' key; use 'inputs:' instead");
            }
        }

        Ok(())
    }

    /// Resolves `requested` (or the document's default, or the implicit all-steps
    /// flow) into an ordered list of step names.
    fn resolve_flow(&self, requested: Option<&str>) -> Result<(String, Vec<String>), WorkflowError> {
        match (&self.doc.flows, requested) {
            (Some(flows), Some(name)) => {
                let flow = flows
                    .definitions
                    .iter()
                    .find(|f| f.name == name)
                    .ok_or_else(|| WorkflowValidationError::UnknownFlow { name: name.to_string() })?;
                Ok((flow.name.clone(), flow.steps.clone()))
            }
            (Some(flows), None) => {
                if let Some(default) = &flows.default {
                    let flow = flows
                        .definitions
                        .iter()
                        .find(|f| &f.name == default)
                        .expect("validated at construction");
                    Ok((flow.name.clone(), flow.steps.clone()))
                } else {
                    Ok((IMPLICIT_FLOW_NAME.to_string(), self.doc.steps.iter().map(|s| s.name.clone()).collect()))
                }
            }
            (None, Some(name)) if name == IMPLICIT_FLOW_NAME => {
                Ok((IMPLICIT_FLOW_NAME.to_string(), self.doc.steps.iter().map(|s| s.name.clone()).collect()))
            }
            (None, Some(name)) => Err(WorkflowError::from(WorkflowValidationError::UnknownFlow { name: name.to_string() })),
            (None, None) => Ok((IMPLICIT_FLOW_NAME.to_string(), self.doc.steps.iter().map(|s| s.name.clone()).collect())),
        }
    }

    fn check_required_params(&self, args: &HashMap<String, Value>) -> Result<(), WorkflowValidationError> {
        for (name, spec) in &self.doc.params {
            if spec.required && !args.contains_key(name) && spec.default.is_none() {
                return Err(WorkflowValidationError::MissingRequiredParam { name: name.clone() });
            }
        }
        Ok(())
    }

    fn build_args_namespace(&self, args: &HashMap<String, Value>) -> Namespace {
        let mut resolved = Namespace::new();
        for (name, spec) in &self.doc.params {
            if let Some(default) = &spec.default {
                resolved.insert(name.clone(), default.clone());
            }
        }
        for (name, value) in args {
            resolved.insert(name.clone(), value.clone());
        }
        resolved
    }

    /// Builds the `env` namespace as `process env ⊕ workflow.env`, with the
    /// workflow's values winning: every process environment variable is visible
    /// (so `{{ env.PATH }}` etc. resolve even when undeclared in the document),
    /// and `doc.env` entries overlay/overwrite them. `doc.env` values may
    /// themselves be templates, resolved against `args` and the raw process env
    /// built so far.
    fn build_env_namespace(&self, args_ns: &Namespace) -> Result<Namespace, WorkflowError> {
        let mut env = Namespace::new();
        for (key, value) in std::env::vars() {
            env.insert(key, Value::String(value));
        }

        if !self.doc.env.is_empty() {
            let mut root = serde_json::Map::new();
            root.insert("args".to_string(), Value::Object(args_ns.clone().into_iter().collect()));
            root.insert("env".to_string(), Value::Object(env.clone().into_iter().collect()));
            root.insert("workflow_name".to_string(), Value::String(self.doc.name.clone()));
            root.insert("workspace".to_string(), Value::String(self.workspace.display().to_string()));
            let root = Value::Object(root);

            for (key, raw_value) in &self.doc.env {
                let resolved = if looks_like_template(raw_value) {
                    self.template_engine.render(raw_value, &root)?
                } else {
                    raw_value.clone()
                };
                env.insert(key.clone(), Value::String(resolved));
            }
        }

        Ok(env)
    }

    fn step_by_name(&self, name: &str) -> Option<&Step> {
        self.doc.steps.iter().find(|s| s.name == name)
    }

    /// Runs the resolved flow to completion (or until a step's error policy stops the
    /// run), persisting [`RunState`] after every step so a crash mid-run can be
    /// resumed. On success returns the final state; on failure the state is still
    /// persisted to disk (inspect it via [`StateStore::load`]) but the error is
    /// returned in place of it.
    pub async fn run(&self, options: RunOptions) -> Result<RunState, WorkflowError> {
        self.check_required_params(&options.args)?;
        let (flow_name, flow_steps) = self.resolve_flow(options.flow.as_deref())?;

        let run_number = if options.resume {
            self.state_store.latest_run_number(&self.doc.name).await?
        } else {
            self.state_store.latest_run_number(&self.doc.name).await? + 1
        };

        let mut state = if options.resume {
            self.state_store
                .load(&self.doc.name, run_number)
                .await?
                .unwrap_or_else(|| RunState::new(&self.doc.name, run_number, &flow_name, options.args.clone()))
        } else {
            RunState::new(&self.doc.name, run_number, &flow_name, options.args.clone())
        };
        state.status = RunStatus::InProgress;
        self.state_store.save(&state).await?;

        let span = info_span!("workflow_run", workflow = %self.doc.name, flow = %flow_name, run = run_number);
        async {
            info!(steps = flow_steps.len(), "starting run");
            let result = self.run_flow(&flow_name, &flow_steps, &options, &mut state).await;
            match &result {
                Ok(()) => {
                    state.status = RunStatus::Completed;
                    info!("run completed");
                }
                Err(e) => {
                    state.status = RunStatus::Failed;
                    warn!(error = %e, "run failed");
                }
            }
            self.state_store.save(&state).await?;
            result.map(|()| state.clone())
        }
        .instrument(span)
        .await
    }

    async fn run_flow(
        &self,
        flow_name: &str,
        flow_steps: &[String],
        options: &RunOptions,
        state: &mut RunState,
    ) -> Result<(), WorkflowError> {
        let args_ns = self.build_args_namespace(&options.args);
        let env_ns = self.build_env_namespace(&args_ns)?;
        let mut context = Context::new(&self.doc.name, &self.doc.name, self.workspace.display().to_string(), state.run_number, args_ns, env_ns);

        for (name, result) in &state.step_results {
            context = context.with_step_result(name, result.result.clone());
            if let Some(step) = self.step_by_name(name) {
                if let Some(outputs) = &step.outputs {
                    for output_name in outputs.names() {
                        if let Some(v) = result.result.get(output_name) {
                            context = context.with_legacy_output(output_name, v.clone());
                        }
                    }
                }
            }
        }

        let mut cursor = 0usize;
        if let Some(start_from) = &options.start_from {
            cursor = flow_steps.iter().position(|s| s == start_from).ok_or_else(|| {
                WorkflowError::from(WorkflowValidationError::UnknownStepInFlow {
                    flow: flow_name.to_string(),
                    step: start_from.clone(),
                })
            })?;
        }

        let mut jumps_taken = 0u32;

        while cursor < flow_steps.len() {
            let step_name = &flow_steps[cursor];
            let step = self
                .step_by_name(step_name)
                .expect("flow was validated against declared steps");

            if options.skip_steps.contains(step_name) {
                debug!(step = %step_name, "skipping (requested)");
                state.record_skipped(step_name, StepResult::skipped());
                self.state_store.save(state).await?;
                cursor += 1;
                continue;
            }

            if options.resume && state.completed_steps.iter().any(|s| s == step_name) {
                debug!(step = %step_name, "already completed, skipping for resume");
                cursor += 1;
                continue;
            }

            if let Some(condition) = &step.condition {
                let root = context.to_render_root();
                let rendered = self.template_engine.render(condition, &root)?;
                if !is_truthy(&rendered) {
                    debug!(step = %step_name, condition = %condition, "condition false, skipping");
                    state.record_skipped(step_name, StepResult::skipped());
                    self.state_store.save(state).await?;
                    cursor += 1;
                    continue;
                }
            }

            let outcome = self.run_step(step, &context, state).await;

            match outcome {
                Ok((result_value, context_with_step, duration)) => {
                    context = context_with_step;
                    let retries = state.retries_for(step_name);
                    state.record_completed(step_name, StepResult::completed(result_value, retries, duration));
                    self.state_store.save(state).await?;
                    cursor += 1;
                }
                Err(StepOutcomeError::Stop(err)) => {
                    let error_message = err.to_string();
                    state.record_failed(
                        step_name,
                        StepResult::failed(error_message.clone(), error_message.clone(), state.retries_for(step_name), 0.0),
                        error_message,
                    );
                    self.state_store.save(state).await?;
                    return Err(err);
                }
                Err(StepOutcomeError::Continue(error_message, duration)) => {
                    state.record_completed(step_name, StepResult::failed(error_message.clone(), error_message, state.retries_for(step_name), duration));
                    self.state_store.save(state).await?;
                    cursor += 1;
                }
                Err(StepOutcomeError::Jump(target, error_ns, error_message, duration)) => {
                    jumps_taken += 1;
                    if jumps_taken > self.config.jump_limit {
                        return Err(WorkflowError::JumpLimitExceeded { limit: self.config.jump_limit });
                    }
                    state.record_completed(step_name, StepResult::failed(error_message.clone(), error_message, state.retries_for(step_name), duration));
                    context = context.with_error(error_ns);
                    self.state_store.save(state).await?;
                    cursor = flow_steps.iter().position(|s| s == &target).ok_or_else(|| {
                        WorkflowError::from(WorkflowValidationError::UnknownJumpTarget {
                            step: step_name.clone(),
                            target: target.clone(),
                        })
                    })?;
                }
            }
        }

        Ok(())
    }

    /// Runs a single step, including its `on_error.retry` loop. Returns either the
    /// step's completed value and an updated context, or one of the three
    /// non-success error actions (`continue`, `next`, or an error that should stop
    /// the run — covering `fail` and retry exhaustion without a fallback action).
    async fn run_step(
        &self,
        step: &Step,
        context: &Context,
        state: &mut RunState,
    ) -> Result<(Value, Context, f64), StepOutcomeError> {
        let policy = step.on_error.clone().unwrap_or_default();
        let mut attempt = state.retries_for(&step.name);
        let span = info_span!("step", name = %step.name, task = %step.task);
        let started = Instant::now();

        loop {
            let dispatch_result = self
                .dispatch(step, context, state)
                .instrument(span.clone())
                .await;

            match dispatch_result {
                Ok(value) => {
                    let duration = started.elapsed().as_secs_f64();
                    let context = context.with_step_result(&step.name, crate::workflow::normalize_result(value.clone()));
                    let context = apply_legacy_outputs(context, step, &value);
                    return Ok((value, context, duration));
                }
                Err(task_err) => {
                    let error_message = task_err.to_string();
                    if attempt < policy.retry && policy.action == ErrorAction::Retry {
                        attempt += 1;
                        state.record_retry(&step.name);
                        warn!(step = %step.name, attempt, max = policy.retry, "step failed, retrying");
                        if policy.delay > 0.0 {
                            tokio::time::sleep(std::time::Duration::from_secs_f64(policy.delay)).await;
                        }
                        continue;
                    }

                    let duration = started.elapsed().as_secs_f64();
                    let (resolved_message, error_ns) =
                        self.resolve_error_message(context, step, &error_message, attempt, &policy);
                    match policy.action {
                        ErrorAction::Retry | ErrorAction::Fail => {
                            return Err(StepOutcomeError::Stop(WorkflowError::step_failed(task_err, resolved_message)));
                        }
                        ErrorAction::Continue => {
                            warn!(step = %step.name, error = %resolved_message, "step failed, continuing per on_error");
                            return Err(StepOutcomeError::Continue(resolved_message, duration));
                        }
                        ErrorAction::Next => {
                            let target = policy.next.clone().expect("validated at construction");
                            warn!(step = %step.name, target = %target, "step failed, jumping");
                            return Err(StepOutcomeError::Jump(target, error_ns, resolved_message, duration));
                        }
                    }
                }
            }
        }
    }

    /// Resolves `on_error.message` (if set) as a template against `context` extended
    /// with `error = { step, message, retry_count, task_type, original }`. A render
    /// failure is logged and replaced by the raw error message — it must never mask
    /// the underlying task failure. Returns the resolved message alongside the
    /// `error` namespace, so callers can carry it forward (e.g. for a `next` jump).
    fn resolve_error_message(
        &self,
        context: &Context,
        step: &Step,
        error_message: &str,
        attempt: u32,
        policy: &crate::workflow::ErrorPolicy,
    ) -> (String, Namespace) {
        let mut error_ns = Namespace::new();
        error_ns.insert("step".to_string(), Value::String(step.name.clone()));
        error_ns.insert("message".to_string(), Value::String(error_message.to_string()));
        error_ns.insert("retry_count".to_string(), serde_json::json!(attempt));
        error_ns.insert("task_type".to_string(), Value::String(step.task.clone()));
        error_ns.insert("original".to_string(), Value::String(error_message.to_string()));

        let resolved = match &policy.message {
            Some(template) => {
                let root = context.with_error(error_ns.clone()).to_render_root();
                match self.template_engine.render(template, &root) {
                    Ok(rendered) => rendered,
                    Err(e) => {
                        warn!(step = %step.name, error = %e, "on_error.message failed to render, using raw error");
                        error_message.to_string()
                    }
                }
            }
            None => error_message.to_string(),
        };
        (resolved, error_ns)
    }

    async fn dispatch(&self, step: &Step, context: &Context, state: &mut RunState) -> Result<Value, TaskExecutionError> {
        if step.task == BATCH_TASK_TYPE {
            return self.dispatch_batch(step, context, state).await;
        }

        let handler = self.registry.get(&step.task).ok_or_else(|| {
            TaskExecutionError::new(
                &step.name,
                &step.task,
                WorkflowError::UnknownTaskType { task_type: step.task.clone() },
            )
        })?;

        let config = TaskConfig::new(
            &step.name,
            &step.task,
            step.clone(),
            self.workspace.clone(),
            context.clone(),
            self.template_engine.clone(),
        );

        handler.execute(&config).await
    }

    async fn dispatch_batch(&self, step: &Step, context: &Context, state: &mut RunState) -> Result<Value, TaskExecutionError> {
        let config = TaskConfig::new(
            &step.name,
            &step.task,
            step.clone(),
            self.workspace.clone(),
            context.clone(),
            self.template_engine.clone(),
        );
        let processed = config.process_inputs().map_err(|e| TaskExecutionError::new(&step.name, &step.task, e))?;
        let inputs = BatchInputs::from_processed(processed)
            .map_err(|e| TaskExecutionError::new(&step.name, &step.task, e))?;

        let processor = BatchProcessor::new(Arc::new(self.registry.clone()), self.template_engine.clone());
        let result = processor
            .run(
                inputs,
                &step.name,
                context,
                self.workspace.clone(),
                state,
                &self.state_store,
                self.config.default_max_workers,
            )
            .await
            .map_err(|e| TaskExecutionError::new(&step.name, &step.task, e))?;

        serde_json::to_value(&result).map_err(|e| {
            TaskExecutionError::new(&step.name, &step.task, WorkflowError::from(e))
        })
    }
}

fn apply_legacy_outputs(context: Context, step: &Step, raw_result: &Value) -> Context {
    let mut context = context;
    if let Some(outputs) = &step.outputs {
        let normalized = crate::workflow::normalize_result(raw_result.clone());
        for name in outputs.names() {
            if let Some(v) = normalized.get(name) {
                context = context.with_legacy_output(name, v.clone());
            }
        }
    }
    context
}

fn is_truthy(rendered: &str) -> bool {
    !matches!(rendered.trim(), "" | "false" | "False" | "0" | "null" | "None")
}

enum StepOutcomeError {
    /// `fail` (or retry exhaustion with no other action): stop the run.
    Stop(WorkflowError),
    /// `continue`: record the failure and move to the next step in flow order.
    Continue(String, f64),
    /// `next`: record the failure and jump to a named step.
    Jump(String, Namespace, String, f64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskHandler;
    use async_trait::async_trait;

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn execute(&self, config: &TaskConfig) -> Result<Value, TaskExecutionError> {
            let inputs = config.process_inputs().map_err(|e| TaskExecutionError::new(config.name(), config.task_type(), e))?;
            Ok(inputs.get("message").cloned().unwrap_or(Value::Null))
        }
    }

    fn doc_with_steps(steps: Vec<Step>) -> WorkflowDocument {
        WorkflowDocument {
            name: "test-workflow".to_string(),
            description: None,
            version: None,
            params: HashMap::new(),
            env: HashMap::new(),
            flows: None,
            steps,
            extra: HashMap::new(),
        }
    }

    fn step(name: &str, task: &str) -> Step {
        Step {
            name: name.to_string(),
            task: task.to_string(),
            inputs: HashMap::new(),
            legacy_params: None,
            condition: None,
            on_error: None,
            outputs: None,
        }
    }

    #[tokio::test]
    async fn runs_linear_flow_successfully() {
        let tmp = tempfile::tempdir().unwrap();
        let doc = doc_with_steps(vec![step("greet", "echo")]);
        let mut registry = TaskRegistry::new();
        registry.register("echo", Arc::new(EchoHandler)).unwrap();

        let engine = Engine::new(doc, registry, tmp.path().to_path_buf()).unwrap();
        let state = engine.run(RunOptions::default()).await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert!(state.completed_steps.contains(&"greet".to_string()));
    }

    #[tokio::test]
    async fn custom_state_dir_name_is_honored() {
        let tmp = tempfile::tempdir().unwrap();
        let doc = doc_with_steps(vec![step("greet", "echo")]);
        let mut registry = TaskRegistry::new();
        registry.register("echo", Arc::new(EchoHandler)).unwrap();

        let config = EngineConfig { state_dir_name: "custom_state".to_string(), ..EngineConfig::default() };
        let engine = Engine::with_config(doc, registry, tmp.path().to_path_buf(), config).unwrap();
        engine.run(RunOptions::default()).await.unwrap();

        assert!(tmp.path().join("custom_state").join("test-workflow").join("run_1.json").exists());
        assert!(!tmp.path().join(".workflow_state").exists());
    }

    #[tokio::test]
    async fn rejects_unknown_jump_target_at_construction() {
        let mut bad_step = step("a", "echo");
        bad_step.on_error = Some(crate::workflow::ErrorPolicy {
            action: ErrorAction::Next,
            retry: 0,
            delay: 0.0,
            next: Some("missing".to_string()),
            message: None,
        });
        let doc = doc_with_steps(vec![bad_step]);
        let registry = TaskRegistry::new();
        let result = Engine::new(doc, registry, PathBuf::from("/tmp"));
        assert!(result.is_err());
    }
}
