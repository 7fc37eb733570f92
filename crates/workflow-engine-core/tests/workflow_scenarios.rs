//! Integration tests exercising the scheduler's per-step error-action state machine,
//! the batch processor, and resume.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use workflow_engine_core::state::RunStatus;
use workflow_engine_core::workflow::StepStatus;
use workflow_engine_core::{Engine, RunOptions, TaskConfig, TaskExecutionError, TaskHandler, TaskRegistry, WorkflowDocument};

struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(&self, config: &TaskConfig) -> Result<Value, TaskExecutionError> {
        let inputs = config
            .process_inputs()
            .map_err(|e| TaskExecutionError::new(config.name(), config.task_type(), e))?;
        Ok(json!({ "message": inputs.get("message").cloned().unwrap_or(Value::Null) }))
    }
}

/// Fails `fail_count` times, then succeeds.
struct FlakyHandler {
    attempts: AtomicU32,
    fail_count: u32,
}

impl FlakyHandler {
    fn new(fail_count: u32) -> Self {
        Self { attempts: AtomicU32::new(0), fail_count }
    }
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    async fn execute(&self, config: &TaskConfig) -> Result<Value, TaskExecutionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_count {
            return Err(TaskExecutionError::new(
                config.name(),
                config.task_type(),
                workflow_engine_core::WorkflowError::Configuration { message: format!("attempt {} failed", attempt) },
            ));
        }
        Ok(json!({ "ok": true, "attempt": attempt }))
    }
}

struct AlwaysFailHandler;

#[async_trait]
impl TaskHandler for AlwaysFailHandler {
    async fn execute(&self, config: &TaskConfig) -> Result<Value, TaskExecutionError> {
        Err(TaskExecutionError::new(
            config.name(),
            config.task_type(),
            workflow_engine_core::WorkflowError::Configuration { message: "boom".to_string() },
        ))
    }
}

/// Echoes `error.message` back, for asserting the `on_error.next` jump target sees
/// the failure context.
struct ErrorEchoHandler;

#[async_trait]
impl TaskHandler for ErrorEchoHandler {
    async fn execute(&self, config: &TaskConfig) -> Result<Value, TaskExecutionError> {
        let message = config
            .get_variable("error", "message")
            .map_err(|e| TaskExecutionError::new(config.name(), config.task_type(), e))?;
        Ok(json!({ "recovered_from": message }))
    }
}

/// Fails for odd-indexed batch items, succeeds for even ones.
struct OddFailsHandler;

#[async_trait]
impl TaskHandler for OddFailsHandler {
    async fn execute(&self, config: &TaskConfig) -> Result<Value, TaskExecutionError> {
        let item = config
            .get_variable("batch", "item")
            .map_err(|e| TaskExecutionError::new(config.name(), config.task_type(), e))?;
        let n = item.as_i64().unwrap_or(0);
        if n % 2 == 1 {
            return Err(TaskExecutionError::new(
                config.name(),
                config.task_type(),
                workflow_engine_core::WorkflowError::Configuration { message: format!("{} is odd", n) },
            ));
        }
        Ok(json!({ "doubled": n * 2 }))
    }
}

fn doc_from_yaml(yaml: &str) -> WorkflowDocument {
    serde_yaml::from_str(yaml).expect("valid workflow yaml")
}

#[tokio::test]
async fn linear_flow_completes_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let doc = doc_from_yaml(
        r#"
name: linear
steps:
  - name: first
    task: echo
    inputs:
      message: "one"
  - name: second
    task: echo
    inputs:
      message: "{{ steps.first.message }} two"
"#,
    );
    let mut registry = TaskRegistry::new();
    registry.register("echo", Arc::new(EchoHandler)).unwrap();

    let engine = Engine::new(doc, registry, tmp.path().to_path_buf()).unwrap();
    let state = engine.run(RunOptions::default()).await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.completed_steps, vec!["first".to_string(), "second".to_string()]);
    assert_eq!(state.step_results["second"].result["message"], json!("one two"));
}

#[tokio::test]
async fn legacy_params_key_is_accepted_as_inputs_alias() {
    let tmp = tempfile::tempdir().unwrap();
    let doc = doc_from_yaml(
        r#"
name: legacy-params
steps:
  - name: only
    task: echo
    params:
      message: "via params"
"#,
    );
    let mut registry = TaskRegistry::new();
    registry.register("echo", Arc::new(EchoHandler)).unwrap();

    let engine = Engine::new(doc, registry, tmp.path().to_path_buf()).unwrap();
    let state = engine.run(RunOptions::default()).await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.step_results["only"].result["message"], json!("via params"));
}

#[tokio::test]
async fn retry_then_succeed() {
    let tmp = tempfile::tempdir().unwrap();
    let doc = doc_from_yaml(
        r#"
name: retrying
steps:
  - name: flaky
    task: flaky
    on_error:
      action: retry
      retry: 3
      delay: 0
"#,
    );
    let mut registry = TaskRegistry::new();
    registry.register("flaky", Arc::new(FlakyHandler::new(2))).unwrap();

    let engine = Engine::new(doc, registry, tmp.path().to_path_buf()).unwrap();
    let state = engine.run(RunOptions::default()).await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.step_results["flaky"].status, StepStatus::Completed);
    assert_eq!(state.step_results["flaky"].result["attempt"], json!(2));
}

#[tokio::test]
async fn continue_past_failure_runs_remaining_steps() {
    let tmp = tempfile::tempdir().unwrap();
    let doc = doc_from_yaml(
        r#"
name: continuing
steps:
  - name: broken
    task: always_fail
    on_error:
      action: continue
  - name: after
    task: echo
    inputs:
      message: "still ran"
"#,
    );
    let mut registry = TaskRegistry::new();
    registry.register("always_fail", Arc::new(AlwaysFailHandler)).unwrap();
    registry.register("echo", Arc::new(EchoHandler)).unwrap();

    let engine = Engine::new(doc, registry, tmp.path().to_path_buf()).unwrap();
    let state = engine.run(RunOptions::default()).await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.step_results["broken"].status, StepStatus::Failed);
    assert_eq!(state.step_results["after"].status, StepStatus::Completed);
    assert_eq!(state.step_results["after"].result["message"], json!("still ran"));
}

#[tokio::test]
async fn jump_on_error_skips_intervening_steps_and_carries_context() {
    let tmp = tempfile::tempdir().unwrap();
    let doc = doc_from_yaml(
        r#"
name: jumping
steps:
  - name: broken
    task: always_fail
    on_error:
      action: next
      next: recover
  - name: skipped
    task: echo
    inputs:
      message: "should not run"
  - name: recover
    task: error_echo
"#,
    );
    let mut registry = TaskRegistry::new();
    registry.register("always_fail", Arc::new(AlwaysFailHandler)).unwrap();
    registry.register("echo", Arc::new(EchoHandler)).unwrap();
    registry.register("error_echo", Arc::new(ErrorEchoHandler)).unwrap();

    let engine = Engine::new(doc, registry, tmp.path().to_path_buf()).unwrap();
    let state = engine.run(RunOptions::default()).await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert!(!state.completed_steps.contains(&"skipped".to_string()));
    assert_eq!(
        state.step_results["recover"].result["recovered_from"],
        json!("task 'always_fail' failed in step 'broken' after 0 retries: configuration error: boom")
    );
}

#[tokio::test]
async fn on_error_message_is_template_resolved() {
    let tmp = tempfile::tempdir().unwrap();
    let doc = doc_from_yaml(
        r#"
name: templated-error
steps:
  - name: broken
    task: always_fail
    on_error:
      action: continue
      message: "step {{ error.step }} failed: {{ error.message }}"
"#,
    );
    let mut registry = TaskRegistry::new();
    registry.register("always_fail", Arc::new(AlwaysFailHandler)).unwrap();

    let engine = Engine::new(doc, registry, tmp.path().to_path_buf()).unwrap();
    let state = engine.run(RunOptions::default()).await.unwrap();

    let broken = &state.step_results["broken"];
    assert_eq!(broken.status, StepStatus::Failed);
    let resolved = broken.error_message.as_deref().unwrap();
    assert!(resolved.starts_with("step broken failed: "), "unexpected message: {}", resolved);
    assert!(resolved.contains("boom"), "unexpected message: {}", resolved);
}

#[tokio::test]
async fn batch_step_reports_partial_failures() {
    let tmp = tempfile::tempdir().unwrap();
    let doc = doc_from_yaml(
        r#"
name: batching
steps:
  - name: double_all
    task: batch
    inputs:
      items: [1, 2, 3, 4]
      task:
        name: double
        task: odd_fails
      max_workers: 2
"#,
    );
    let mut registry = TaskRegistry::new();
    registry.register("odd_fails", Arc::new(OddFailsHandler)).unwrap();

    let engine = Engine::new(doc, registry, tmp.path().to_path_buf()).unwrap();
    let state = engine.run(RunOptions::default()).await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    let result = &state.step_results["double_all"].result;
    assert_eq!(result["stats"]["total"], json!(4));
    assert_eq!(result["stats"]["processed"], json!(2));
    assert_eq!(result["stats"]["failed"], json!(2));
}

#[tokio::test]
async fn batch_resume_does_not_redispatch_completed_items() {
    let tmp = tempfile::tempdir().unwrap();
    let yaml = r#"
name: batch-resumable
steps:
  - name: double_all
    task: batch
    inputs:
      items: [1, 2, 3, 4]
      task:
        name: double
        task: counting
      chunk_size: 2
      max_workers: 1
"#;

    let counter = Arc::new(AtomicU32::new(0));

    struct CountingHandler {
        counter: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn execute(&self, config: &TaskConfig) -> Result<Value, TaskExecutionError> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            let item = config
                .get_variable("batch", "item")
                .map_err(|e| TaskExecutionError::new(config.name(), config.task_type(), e))?;
            Ok(json!({ "doubled": item.as_i64().unwrap_or(0) * 2 }))
        }
    }

    // First run completes the whole batch (chunk_size=2, so two chunks of
    // progress get persisted). Simulate a prior interrupted run by hand-editing
    // the persisted state's batch progress back to only the first chunk, then
    // re-running with `resume: true`: only the second chunk's two items should
    // be dispatched again.
    let doc = doc_from_yaml(yaml);
    let mut registry = TaskRegistry::new();
    registry.register("counting", Arc::new(CountingHandler { counter: counter.clone() })).unwrap();
    let engine = Engine::new(doc, registry, tmp.path().to_path_buf()).unwrap();
    let state = engine.run(RunOptions::default()).await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(counter.load(Ordering::SeqCst), 4);

    let store = workflow_engine_core::StateStore::new(tmp.path());
    let mut saved = store.load("batch-resumable", 1).await.unwrap().unwrap();
    saved.status = RunStatus::Failed;
    saved.completed_steps.clear();
    let step_result = saved.step_results.get_mut("double_all").unwrap();
    step_result.status = StepStatus::Running;
    step_result.progress = Some(workflow_engine_core::workflow::BatchProgress { completed_indices: vec![0, 1] });
    store.save(&saved).await.unwrap();

    counter.store(0, Ordering::SeqCst);
    let doc = doc_from_yaml(yaml);
    let mut registry = TaskRegistry::new();
    registry.register("counting", Arc::new(CountingHandler { counter: counter.clone() })).unwrap();
    let engine = Engine::new(doc, registry, tmp.path().to_path_buf()).unwrap();
    let state = engine.run(RunOptions { resume: true, ..RunOptions::default() }).await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(counter.load(Ordering::SeqCst), 2, "only the unfinished chunk's items should redispatch");
    assert_eq!(state.step_results["double_all"].result["stats"]["total"], json!(4));
}

#[tokio::test]
async fn resume_skips_completed_steps_after_a_failed_run() {
    let tmp = tempfile::tempdir().unwrap();
    let yaml = r#"
name: resumable
steps:
  - name: first
    task: echo
    inputs:
      message: "one"
  - name: second
    task: flaky
"#;

    // First run: "second" always fails and stops the run.
    {
        let doc = doc_from_yaml(yaml);
        let mut registry = TaskRegistry::new();
        registry.register("echo", Arc::new(EchoHandler)).unwrap();
        registry.register("flaky", Arc::new(FlakyHandler::new(u32::MAX))).unwrap();
        let engine = Engine::new(doc, registry, tmp.path().to_path_buf()).unwrap();
        let err = engine.run(RunOptions::default()).await;
        assert!(err.is_err());
    }

    // Second run: resume, with a handler for "second" that now succeeds. "first"
    // must not re-run.
    let doc = doc_from_yaml(yaml);
    let mut registry = TaskRegistry::new();
    registry.register("echo", Arc::new(EchoHandler)).unwrap();
    registry.register("flaky", Arc::new(FlakyHandler::new(0))).unwrap();
    let engine = Engine::new(doc, registry, tmp.path().to_path_buf()).unwrap();

    let state = engine
        .run(RunOptions { resume: true, ..RunOptions::default() })
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.completed_steps, vec!["first".to_string(), "second".to_string()]);
}

#[tokio::test]
async fn missing_required_param_fails_before_any_step_runs() {
    let tmp = tempfile::tempdir().unwrap();
    let doc = doc_from_yaml(
        r#"
name: requires-param
params:
  required_value:
    type: string
    required: true
steps:
  - name: only
    task: echo
    inputs:
      message: "{{ args.required_value }}"
"#,
    );
    let registry = TaskRegistry::new();
    let engine = Engine::new(doc, registry, tmp.path().to_path_buf()).unwrap();

    let result = engine.run(RunOptions::default()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn env_namespace_exposes_process_env_and_workflow_env_wins() {
    let tmp = tempfile::tempdir().unwrap();
    // SAFETY: test-only process env mutation, keyed under names unlikely to
    // collide with other tests running in the same process.
    std::env::set_var("WORKFLOW_SCENARIOS_TEST_UNDECLARED", "from-process");
    std::env::set_var("WORKFLOW_SCENARIOS_TEST_OVERRIDDEN", "from-process");

    let doc = doc_from_yaml(
        r#"
name: env-precedence
env:
  WORKFLOW_SCENARIOS_TEST_OVERRIDDEN: "from-workflow"
  WORKFLOW_SCENARIOS_TEST_TEMPLATED: "{{ args.suffix }}-templated"
steps:
  - name: read_env
    task: echo
    inputs:
      message: "{{ env.WORKFLOW_SCENARIOS_TEST_UNDECLARED }}/{{ env.WORKFLOW_SCENARIOS_TEST_OVERRIDDEN }}/{{ env.WORKFLOW_SCENARIOS_TEST_TEMPLATED }}"
"#,
    );
    let mut registry = TaskRegistry::new();
    registry.register("echo", Arc::new(EchoHandler)).unwrap();
    let engine = Engine::new(doc, registry, tmp.path().to_path_buf()).unwrap();

    let mut args = std::collections::HashMap::new();
    args.insert("suffix".to_string(), json!("ok"));
    let state = engine.run(RunOptions { args, ..RunOptions::default() }).await.unwrap();

    std::env::remove_var("WORKFLOW_SCENARIOS_TEST_UNDECLARED");
    std::env::remove_var("WORKFLOW_SCENARIOS_TEST_OVERRIDDEN");

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(
        state.step_results["read_env"].result["message"],
        json!("from-process/from-workflow/ok-templated")
    );
}

#[tokio::test]
async fn batch_sub_task_name_is_optional() {
    let tmp = tempfile::tempdir().unwrap();
    let doc = doc_from_yaml(
        r#"
name: batch-unnamed-subtask
steps:
  - name: double_all
    task: batch
    inputs:
      items: [1, 2]
      task:
        task: odd_fails
"#,
    );
    let mut registry = TaskRegistry::new();
    registry.register("odd_fails", Arc::new(OddFailsHandler)).unwrap();
    let engine = Engine::new(doc, registry, tmp.path().to_path_buf()).unwrap();

    let state = engine.run(RunOptions::default()).await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.step_results["double_all"].result["stats"]["total"], json!(2));
}

#[tokio::test]
async fn undefined_template_variable_is_an_enriched_error() {
    let tmp = tempfile::tempdir().unwrap();
    let doc = doc_from_yaml(
        r#"
name: undefined-var
steps:
  - name: broken
    task: echo
    inputs:
      message: "{{ args.does_not_exist }}"
"#,
    );
    let mut registry = TaskRegistry::new();
    registry.register("echo", Arc::new(EchoHandler)).unwrap();
    let engine = Engine::new(doc, registry, tmp.path().to_path_buf()).unwrap();

    let result = engine.run(RunOptions::default()).await;
    let err = result.unwrap_err().to_string();
    assert!(err.contains("does_not_exist"), "unexpected error message: {}", err);
}
