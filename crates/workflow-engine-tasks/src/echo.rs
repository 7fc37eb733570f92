use async_trait::async_trait;
use serde_json::Value;
use workflow_engine_core::{TaskConfig, TaskExecutionError, TaskHandler};

/// Returns its `message` input unchanged. Mostly useful for smoke-testing a
/// workflow document's flow graph and template wiring without doing real work.
pub struct EchoTask;

#[async_trait]
impl TaskHandler for EchoTask {
    async fn execute(&self, config: &TaskConfig) -> Result<Value, TaskExecutionError> {
        let inputs = config
            .process_inputs()
            .map_err(|e| TaskExecutionError::new(config.name(), config.task_type(), e))?;
        Ok(inputs.get("message").cloned().unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use workflow_engine_core::{Context, Step, TemplateEngine};

    fn config_with_message(message: &str) -> TaskConfig {
        let mut inputs = HashMap::new();
        inputs.insert("message".to_string(), Value::String(message.to_string()));
        let step = Step {
            name: "greet".to_string(),
            task: "echo".to_string(),
            inputs,
            legacy_params: None,
            condition: None,
            on_error: None,
            outputs: None,
        };
        let context = Context::new("wf", "wf.yaml", "/tmp", 1, HashMap::new(), HashMap::new());
        TaskConfig::new("greet", "echo", step, "/tmp".into(), context, Arc::new(TemplateEngine::new()))
    }

    #[tokio::test]
    async fn returns_message_verbatim() {
        let config = config_with_message("hello");
        let result = EchoTask.execute(&config).await.unwrap();
        assert_eq!(result, Value::String("hello".to_string()));
    }
}
