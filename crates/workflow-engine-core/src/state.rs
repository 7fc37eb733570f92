//! # State Store
//!
//! Persists enough about a run to resume a failed workflow without re-executing
//! completed steps, and to show run history. The on-disk format is the JSON document
//! writes are crash-safe via write-temp,
//! fsync, rename-over, mirroring how the teacher crate persists event-sourced state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::error::WorkflowError;
use crate::workflow::StepResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedStep {
    pub step_name: String,
    pub error: String,
    pub failed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetryState {
    pub attempt: u32,
}

/// The persisted state of one workflow run. Written to
/// `.workflow_state/<workflow_name>/run_<run_number>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub workflow_name: String,
    pub run_number: u64,
    pub flow: String,
    pub status: RunStatus,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub last_updated: chrono::DateTime<chrono::Utc>,
    pub completed_steps: Vec<String>,
    pub step_results: HashMap<String, StepResult>,
    pub failed_step: Option<FailedStep>,
    pub retry_state: HashMap<String, RetryState>,
    pub params: HashMap<String, serde_json::Value>,
}

impl RunState {
    pub fn new(
        workflow_name: impl Into<String>,
        run_number: u64,
        flow: impl Into<String>,
        params: HashMap<String, serde_json::Value>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            workflow_name: workflow_name.into(),
            run_number,
            flow: flow.into(),
            status: RunStatus::NotStarted,
            start_time: now,
            last_updated: now,
            completed_steps: Vec::new(),
            step_results: HashMap::new(),
            failed_step: None,
            retry_state: HashMap::new(),
            params,
        }
    }

    pub fn record_completed(&mut self, name: &str, result: StepResult) {
        self.step_results.insert(name.to_string(), result);
        if !self.completed_steps.iter().any(|s| s == name) {
            self.completed_steps.push(name.to_string());
        }
        self.retry_state.remove(name);
        self.last_updated = chrono::Utc::now();
    }

    pub fn record_skipped(&mut self, name: &str, result: StepResult) {
        self.step_results.insert(name.to_string(), result);
        self.last_updated = chrono::Utc::now();
    }

    pub fn record_failed(&mut self, name: &str, result: StepResult, error: String) {
        self.step_results.insert(name.to_string(), result);
        self.failed_step = Some(FailedStep {
            step_name: name.to_string(),
            error,
            failed_at: chrono::Utc::now(),
        });
        self.last_updated = chrono::Utc::now();
    }

    pub fn record_retry(&mut self, name: &str) {
        let entry = self.retry_state.entry(name.to_string()).or_default();
        entry.attempt += 1;
        self.last_updated = chrono::Utc::now();
    }

    pub fn reset_step(&mut self, name: &str) {
        self.step_results.remove(name);
        self.completed_steps.retain(|s| s != name);
        self.retry_state.remove(name);
        if self.failed_step.as_ref().is_some_and(|f| f.step_name == name) {
            self.failed_step = None;
        }
        self.last_updated = chrono::Utc::now();
    }

    pub fn retries_for(&self, name: &str) -> u32 {
        self.retry_state.get(name).map(|r| r.attempt).unwrap_or(0)
    }
}

/// Filesystem-backed state store, rooted at a workspace directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

/// Default value of [`crate::config::EngineConfig::state_dir_name`], used by
/// [`StateStore::new`] for callers that don't carry an `EngineConfig` around.
pub const DEFAULT_STATE_DIR_NAME: &str = ".workflow_state";

impl StateStore {
    pub fn new(workspace: impl AsRef<Path>) -> Self {
        Self::with_state_dir(workspace, DEFAULT_STATE_DIR_NAME)
    }

    /// Roots the store at `workspace/state_dir_name`, honoring
    /// [`crate::config::EngineConfig::state_dir_name`] (e.g. `WORKFLOW_STATE_DIR`).
    pub fn with_state_dir(workspace: impl AsRef<Path>, state_dir_name: impl AsRef<str>) -> Self {
        Self {
            root: workspace.as_ref().join(state_dir_name.as_ref()),
        }
    }

    fn run_path(&self, workflow_name: &str, run_number: u64) -> PathBuf {
        self.root
            .join(workflow_name)
            .join(format!("run_{}.json", run_number))
    }

    /// Loads a previously persisted run, if present.
    pub async fn load(&self, workflow_name: &str, run_number: u64) -> Result<Option<RunState>, WorkflowError> {
        let path = self.run_path(workflow_name, run_number);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&path).await?;
        let state: RunState = serde_json::from_slice(&bytes)?;
        Ok(Some(state))
    }

    /// Returns the highest run number already recorded for `workflow_name`, or 0 if none.
    pub async fn latest_run_number(&self, workflow_name: &str) -> Result<u64, WorkflowError> {
        let dir = self.root.join(workflow_name);
        if !dir.exists() {
            return Ok(0);
        }
        let mut highest = 0u64;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(num) = name.strip_prefix("run_").and_then(|s| s.strip_suffix(".json")) {
                if let Ok(n) = num.parse::<u64>() {
                    highest = highest.max(n);
                }
            }
        }
        Ok(highest)
    }

    /// Writes `state` crash-safely: write to a temp file in the same directory,
    /// flush, then rename over the destination.
    pub async fn save(&self, state: &RunState) -> Result<(), WorkflowError> {
        let dir = self.root.join(&state.workflow_name);
        tokio::fs::create_dir_all(&dir).await?;
        let final_path = self.run_path(&state.workflow_name, state.run_number);
        let tmp_path = dir.join(format!("run_{}.json.tmp", state.run_number));

        let bytes = serde_json::to_vec_pretty(state)?;
        {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }
}
