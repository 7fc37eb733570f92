use async_trait::async_trait;
use serde_json::{json, Value};
use workflow_engine_core::{TaskConfig, TaskExecutionError, TaskHandler, WorkflowError};

fn string_input(config: &TaskConfig, inputs: &std::collections::HashMap<String, Value>, key: &str) -> Result<String, TaskExecutionError> {
    inputs
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            TaskExecutionError::new(
                config.name(),
                config.task_type(),
                WorkflowError::Configuration { message: format!("missing required input '{}'", key) },
            )
        })
}

/// Reads a UTF-8 text file relative to the run's workspace and returns its
/// `content`. Paths are resolved under `config.workspace()`; absolute paths escape
/// that sandbox deliberately (matching how `shell` lets commands run anywhere the
/// OS permits) — constraining them is left to the caller's own workflow design.
pub struct ReadFileTask;

#[async_trait]
impl TaskHandler for ReadFileTask {
    async fn execute(&self, config: &TaskConfig) -> Result<Value, TaskExecutionError> {
        let inputs = config
            .process_inputs()
            .map_err(|e| TaskExecutionError::new(config.name(), config.task_type(), e))?;
        let path = string_input(config, inputs, "path")?;
        let resolved = config.workspace().join(&path);

        let content = tokio::fs::read_to_string(&resolved).await.map_err(|e| {
            TaskExecutionError::new(
                config.name(),
                config.task_type(),
                WorkflowError::Io { message: format!("reading '{}': {}", resolved.display(), e) },
            )
        })?;

        Ok(json!({ "content": content, "path": path }))
    }
}

/// Writes `content` to a file relative to the run's workspace, creating parent
/// directories as needed. Returns the number of bytes written.
pub struct WriteFileTask;

#[async_trait]
impl TaskHandler for WriteFileTask {
    async fn execute(&self, config: &TaskConfig) -> Result<Value, TaskExecutionError> {
        let inputs = config
            .process_inputs()
            .map_err(|e| TaskExecutionError::new(config.name(), config.task_type(), e))?;
        let path = string_input(config, inputs, "path")?;
        let content = string_input(config, inputs, "content")?;
        let resolved = config.workspace().join(&path);

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                TaskExecutionError::new(
                    config.name(),
                    config.task_type(),
                    WorkflowError::Io { message: format!("creating '{}': {}", parent.display(), e) },
                )
            })?;
        }

        tokio::fs::write(&resolved, &content).await.map_err(|e| {
            TaskExecutionError::new(
                config.name(),
                config.task_type(),
                WorkflowError::Io { message: format!("writing '{}': {}", resolved.display(), e) },
            )
        })?;

        Ok(json!({ "path": path, "bytes_written": content.len() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use workflow_engine_core::{Context, Step, TemplateEngine};

    fn config(workspace: &std::path::Path, name: &str, task: &str, inputs: HashMap<String, Value>) -> TaskConfig {
        let step = Step {
            name: name.to_string(),
            task: task.to_string(),
            inputs,
            legacy_params: None,
            condition: None,
            on_error: None,
            outputs: None,
        };
        let context = Context::new("wf", "wf.yaml", workspace.display().to_string(), 1, HashMap::new(), HashMap::new());
        TaskConfig::new(name, task, step, workspace.to_path_buf(), context, Arc::new(TemplateEngine::new()))
    }

    #[tokio::test]
    async fn writes_then_reads_back() {
        let tmp = tempfile::tempdir().unwrap();

        let mut write_inputs = HashMap::new();
        write_inputs.insert("path".to_string(), Value::String("out.txt".to_string()));
        write_inputs.insert("content".to_string(), Value::String("hello".to_string()));
        let write_config = config(tmp.path(), "write", "write_file", write_inputs);
        let write_result = WriteFileTask.execute(&write_config).await.unwrap();
        assert_eq!(write_result["bytes_written"], json!(5));

        let mut read_inputs = HashMap::new();
        read_inputs.insert("path".to_string(), Value::String("out.txt".to_string()));
        let read_config = config(tmp.path(), "read", "read_file", read_inputs);
        let read_result = ReadFileTask.execute(&read_config).await.unwrap();
        assert_eq!(read_result["content"], json!("hello"));
    }

    #[tokio::test]
    async fn read_missing_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut inputs = HashMap::new();
        inputs.insert("path".to_string(), Value::String("missing.txt".to_string()));
        let config = config(tmp.path(), "read", "read_file", inputs);
        assert!(ReadFileTask.execute(&config).await.is_err());
    }
}
