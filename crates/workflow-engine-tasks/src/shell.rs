use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::process::Command;
use workflow_engine_core::{TaskConfig, TaskExecutionError, TaskHandler, WorkflowError};

const DEFAULT_TIMEOUT_SECS: f64 = 30.0;

/// Runs `command` through `sh -c`, optionally bounded by a `timeout` (seconds,
/// default 30) and run inside `cwd` (relative to the workspace, default the
/// workspace root). Returns `{ stdout, stderr, exit_code }`; a non-zero exit code
/// is not itself an error — a step's `on_error` policy decides what matters.
pub struct ShellTask;

#[async_trait]
impl TaskHandler for ShellTask {
    async fn execute(&self, config: &TaskConfig) -> Result<Value, TaskExecutionError> {
        let inputs = config
            .process_inputs()
            .map_err(|e| TaskExecutionError::new(config.name(), config.task_type(), e))?;

        let command = inputs
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TaskExecutionError::new(
                    config.name(),
                    config.task_type(),
                    WorkflowError::Configuration { message: "missing required input 'command'".to_string() },
                )
            })?;

        let timeout_secs = inputs.get("timeout").and_then(Value::as_f64).unwrap_or(DEFAULT_TIMEOUT_SECS);
        let workdir = match inputs.get("cwd").and_then(Value::as_str) {
            Some(cwd) => config.workspace().join(cwd),
            None => config.workspace().clone(),
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&workdir);

        let child = cmd.output();
        let output = tokio::time::timeout(Duration::from_secs_f64(timeout_secs), child)
            .await
            .map_err(|_| {
                TaskExecutionError::new(
                    config.name(),
                    config.task_type(),
                    WorkflowError::Configuration {
                        message: format!("command timed out after {}s: {}", timeout_secs, command),
                    },
                )
            })?
            .map_err(|e| {
                TaskExecutionError::new(
                    config.name(),
                    config.task_type(),
                    WorkflowError::Io { message: format!("spawning '{}': {}", command, e) },
                )
            })?;

        Ok(json!({
            "stdout": String::from_utf8_lossy(&output.stdout).to_string(),
            "stderr": String::from_utf8_lossy(&output.stderr).to_string(),
            "exit_code": output.status.code().unwrap_or(-1),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use workflow_engine_core::{Context, Step, TemplateEngine};

    fn config_with_command(workspace: &std::path::Path, command: &str) -> TaskConfig {
        let mut inputs = HashMap::new();
        inputs.insert("command".to_string(), Value::String(command.to_string()));
        let step = Step {
            name: "run".to_string(),
            task: "shell".to_string(),
            inputs,
            legacy_params: None,
            condition: None,
            on_error: None,
            outputs: None,
        };
        let context = Context::new("wf", "wf.yaml", workspace.display().to_string(), 1, HashMap::new(), HashMap::new());
        TaskConfig::new("run", "shell", step, workspace.to_path_buf(), context, Arc::new(TemplateEngine::new()))
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_with_command(tmp.path(), "echo hi");
        let result = ShellTask.execute(&config).await.unwrap();
        assert_eq!(result["stdout"], json!("hi\n"));
        assert_eq!(result["exit_code"], json!(0));
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_with_command(tmp.path(), "exit 3");
        let result = ShellTask.execute(&config).await.unwrap();
        assert_eq!(result["exit_code"], json!(3));
    }
}
