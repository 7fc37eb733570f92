//! # Batch Processor
//!
//! Fan-out of a sub-task over a collection of items: contiguous chunks, a bounded
//! worker pool per chunk, per-item retry, and index-ordered result aggregation. The
//! worker pool is a [`tokio::task::JoinSet`] gated by a [`tokio::sync::Semaphore`]
//! rather than a dedicated thread pool.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::context::Context;
use crate::error::{TaskExecutionError, WorkflowError};
use crate::state::{RunState, StateStore};
use crate::task::{TaskConfig, TaskRegistry};
use crate::template::TemplateEngine;
use crate::workflow::{BatchProgress, Step, StepResult, StepStatus};

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRetryPolicy {
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub delay: f64,
}

/// Parsed, already-template-resolved inputs of a `batch` step.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchInputs {
    pub items: Vec<Value>,
    pub task: Step,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub parallel: Option<bool>,
    #[serde(default)]
    pub retry: Option<BatchRetryPolicy>,
    #[serde(default = "default_continue_on_error")]
    pub continue_on_error: bool,
}

fn default_continue_on_error() -> bool {
    true
}

impl BatchInputs {
    pub fn from_processed(processed: &HashMap<String, Value>) -> Result<Self, WorkflowError> {
        let value = Value::Object(processed.clone().into_iter().collect());
        serde_json::from_value(value).map_err(|e| WorkflowError::Configuration {
            message: format!("invalid batch inputs: {}", e),
        })
    }

    fn effective_max_workers(&self, default_max_workers: usize) -> usize {
        match self.max_workers {
            Some(n) if n > 0 => n,
            _ => {
                if self.parallel == Some(false) {
                    1
                } else {
                    default_max_workers.max(1)
                }
            }
        }
    }

    fn effective_chunk_size(&self) -> usize {
        match self.chunk_size {
            Some(n) if n > 0 => n,
            _ => self.items.len().max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemRecord {
    pub index: usize,
    pub item: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStats {
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub retried: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub processed_items: Vec<ItemRecord>,
    pub stats: BatchStats,
    pub failed: Vec<ItemRecord>,
}

pub struct BatchProcessor {
    registry: Arc<TaskRegistry>,
    engine: Arc<TemplateEngine>,
}

impl BatchProcessor {
    pub fn new(registry: Arc<TaskRegistry>, engine: Arc<TemplateEngine>) -> Self {
        Self { registry, engine }
    }

    /// Runs the batch to completion, persisting `completed_indices` into
    /// `state.step_results[step_name].progress` after every chunk so a crash
    /// mid-batch can resume without re-dispatching already-finished items. Indices
    /// already recorded as completed from a prior, interrupted run are skipped on
    /// re-entry; their original `item` value still appears in `processed_items`
    /// (see the note on the final assembly loop below), but no new result payload
    /// is produced for them since the original wasn't retained across the crash.
    pub async fn run(
        &self,
        inputs: BatchInputs,
        step_name: &str,
        base_context: &Context,
        workspace: PathBuf,
        state: &mut RunState,
        state_store: &StateStore,
        default_max_workers: usize,
    ) -> Result<BatchResult, WorkflowError> {
        let total = inputs.items.len();
        let mut slots: Vec<Option<ItemRecord>> = vec![None; total];
        let already_completed: Vec<usize> = state
            .step_results
            .get(step_name)
            .and_then(|r| r.progress.as_ref())
            .map(|p| p.completed_indices.clone())
            .unwrap_or_default();
        let skip: std::collections::HashSet<usize> = already_completed.iter().copied().collect();
        let mut completed_indices: Vec<usize> = already_completed.clone();

        let chunk_size = inputs.effective_chunk_size();
        let max_workers = inputs.effective_max_workers(default_max_workers);
        let retry = inputs.retry.clone().unwrap_or(BatchRetryPolicy { max_attempts: 0, delay: 0.0 });
        let continue_on_error = inputs.continue_on_error;
        let mut retried_count = 0u32;

        let indices: Vec<usize> = (0..total).collect();
        for chunk in indices.chunks(chunk_size) {
            let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
            let mut joinset: JoinSet<(usize, Result<Value, String>, u32)> = JoinSet::new();

            for &index in chunk {
                if skip.contains(&index) {
                    continue;
                }
                let item = inputs.items[index].clone();
                let sub_task = inputs.task.clone();
                let registry = self.registry.clone();
                let engine = self.engine.clone();
                let ctx = base_context.with_batch(item.clone(), index, total, step_name);
                let workspace = workspace.clone();
                let permit = semaphore.clone().acquire_owned();
                let retry = retry.clone();

                joinset.spawn(async move {
                    let _permit = permit.await.expect("semaphore not closed");
                    let mut attempt = 0u32;
                    loop {
                        match dispatch_sub_task(&registry, &engine, &sub_task, &ctx, &workspace).await {
                            Ok(value) => return (index, Ok(value), attempt),
                            Err(e) => {
                                if attempt < retry.max_attempts {
                                    attempt += 1;
                                    if retry.delay > 0.0 {
                                        tokio::time::sleep(Duration::from_secs_f64(retry.delay)).await;
                                    }
                                    continue;
                                }
                                return (index, Err(e.to_string()), attempt);
                            }
                        }
                    }
                });
            }

            let mut chunk_done = Vec::new();
            while let Some(joined) = joinset.join_next().await {
                let (index, outcome, attempts) = joined.map_err(|e| WorkflowError::Configuration {
                    message: format!("batch worker panicked: {}", e),
                })?;
                retried_count += attempts;
                let item = inputs.items[index].clone();
                let record = match outcome {
                    Ok(value) => ItemRecord { index, item, result: Some(value), error: None },
                    Err(error) => {
                        if !continue_on_error {
                            chunk_done.push(index);
                            chunk_done.sort_unstable();
                            completed_indices.extend(chunk_done.iter().copied());
                            save_progress(state, state_store, step_name, &completed_indices).await?;
                            return Err(WorkflowError::from(TaskExecutionError::new(
                                step_name,
                                "batch",
                                WorkflowError::Configuration {
                                    message: format!("item {} failed: {}", index, error),
                                },
                            )));
                        }
                        ItemRecord { index, item, result: None, error: Some(error) }
                    }
                };
                chunk_done.push(index);
                slots[index] = Some(record);
            }
            chunk_done.sort_unstable();
            completed_indices.extend(chunk_done.iter().copied());
            save_progress(state, state_store, step_name, &completed_indices).await?;
        }

        let mut processed_items = Vec::with_capacity(total);
        let mut failed = Vec::new();
        let mut processed = 0usize;
        let mut failed_count = 0usize;
        for (index, slot) in slots.into_iter().enumerate() {
            if let Some(record) = slot {
                if record.error.is_some() {
                    failed_count += 1;
                    failed.push(record.clone());
                } else {
                    processed += 1;
                }
                processed_items.push(record);
            } else if skip.contains(&index) {
                // Already completed in a prior run; re-surface as processed without
                // a result payload, since the original wasn't retained.
                processed += 1;
                processed_items.push(ItemRecord {
                    index,
                    item: inputs.items[index].clone(),
                    result: None,
                    error: None,
                });
            }
        }

        Ok(BatchResult {
            processed_items,
            stats: BatchStats {
                total,
                processed,
                failed: failed_count,
                retried: retried_count as usize,
            },
            failed,
        })
    }
}

/// Records `completed_indices` into `state.step_results[step_name].progress` and
/// persists the run state, so a crash between chunks resumes without
/// re-dispatching items already finished. The step's own status stays `Running`
/// until the engine records its terminal outcome once the whole batch returns.
async fn save_progress(
    state: &mut RunState,
    state_store: &StateStore,
    step_name: &str,
    completed_indices: &[usize],
) -> Result<(), WorkflowError> {
    let mut indices = completed_indices.to_vec();
    indices.sort_unstable();
    indices.dedup();
    let entry = state
        .step_results
        .entry(step_name.to_string())
        .or_insert_with(StepResult::running);
    entry.status = StepStatus::Running;
    entry.progress = Some(BatchProgress { completed_indices: indices });
    state_store.save(state).await
}

async fn dispatch_sub_task(
    registry: &TaskRegistry,
    engine: &TemplateEngine,
    sub_task: &Step,
    ctx: &Context,
    workspace: &PathBuf,
) -> Result<Value, WorkflowError> {
    let handler = registry
        .get(&sub_task.task)
        .ok_or_else(|| WorkflowError::UnknownTaskType { task_type: sub_task.task.clone() })?;

    let config = TaskConfig::new(
        sub_task.name.clone(),
        sub_task.task.clone(),
        sub_task.clone(),
        workspace.clone(),
        ctx.clone(),
        Arc::new(clone_engine(engine)),
    );

    handler
        .execute(&config)
        .await
        .map(crate::workflow::normalize_result)
        .map_err(WorkflowError::from)
}

/// `TemplateEngine` doesn't implement `Clone` (it owns a `Handlebars` registry); batch
/// workers each get their own engine instance built with the same fixed, stateless
/// filter set, which is cheap and avoids sharing mutable handlebars state across tasks.
fn clone_engine(_engine: &TemplateEngine) -> TemplateEngine {
    TemplateEngine::new()
}
