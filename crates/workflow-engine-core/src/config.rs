//! # Engine Configuration
//!
//! Environment-driven knobs for the scheduler and batch processor: a `from_env`
//! constructor plus a `validate` gate run once at construction time.

use crate::error::WorkflowError;

/// Default cap on the number of `on_error.next` jumps a single run may take before
/// the engine gives up and returns [`WorkflowError::JumpLimitExceeded`]. Without a
/// cap, two steps whose `on_error.next` point at each other would loop forever.
pub const DEFAULT_JUMP_LIMIT: u32 = 1024;

const DEFAULT_MAX_WORKERS: usize = 8;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on `on_error.next` jumps taken in one run.
    pub jump_limit: u32,
    /// Default worker count for `batch` steps that don't set their own `max_workers`.
    pub default_max_workers: usize,
    /// Root directory state files and run history are written under, relative to a
    /// workflow's workspace. Always `.workflow_state` in practice; exposed for tests.
    pub state_dir_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            jump_limit: DEFAULT_JUMP_LIMIT,
            default_max_workers: DEFAULT_MAX_WORKERS,
            state_dir_name: ".workflow_state".to_string(),
        }
    }
}

impl EngineConfig {
    /// Builds a config from environment variables, falling back to defaults for any
    /// that are unset: `WORKFLOW_JUMP_LIMIT`, `WORKFLOW_MAX_WORKERS`,
    /// `WORKFLOW_STATE_DIR`.
    pub fn from_env() -> Result<Self, WorkflowError> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("WORKFLOW_JUMP_LIMIT") {
            config.jump_limit = raw.parse().map_err(|_| WorkflowError::Configuration {
                message: format!("WORKFLOW_JUMP_LIMIT must be a positive integer, got '{}'", raw),
            })?;
        }

        if let Ok(raw) = std::env::var("WORKFLOW_MAX_WORKERS") {
            config.default_max_workers = raw.parse().map_err(|_| WorkflowError::Configuration {
                message: format!("WORKFLOW_MAX_WORKERS must be a positive integer, got '{}'", raw),
            })?;
        }

        if let Ok(raw) = std::env::var("WORKFLOW_STATE_DIR") {
            config.state_dir_name = raw;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.jump_limit == 0 {
            return Err(WorkflowError::Configuration {
                message: "jump_limit must be at least 1".to_string(),
            });
        }
        if self.default_max_workers == 0 {
            return Err(WorkflowError::Configuration {
                message: "default_max_workers must be at least 1".to_string(),
            });
        }
        if self.state_dir_name.is_empty() {
            return Err(WorkflowError::Configuration {
                message: "state_dir_name must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.jump_limit, DEFAULT_JUMP_LIMIT);
    }

    #[test]
    fn rejects_zero_jump_limit() {
        let config = EngineConfig { jump_limit: 0, ..EngineConfig::default() };
        assert!(config.validate().is_err());
    }
}
