//! # Workflow Engine Core
//!
//! This crate provides the core primitives of the YAML-driven workflow engine:
//! - Workflow document model ([`workflow`]) and the `Step` / `ErrorPolicy` types that
//!   drive execution.
//! - A namespaced, copy-on-write [`context::Context`] that is the only thing templates
//!   and task handlers may read from.
//! - A Handlebars-backed [`template`] engine with strict-undefined semantics and
//!   enriched error messages.
//! - A [`state`] store that persists enough to resume a failed run without
//!   re-executing completed steps.
//! - The [`task`] dispatch contract (`TaskHandler` + `TaskConfig` + `TaskRegistry`).
//! - The [`engine`] scheduler that ties all of the above together, including the
//!   per-step error-action state machine.
//! - The [`batch`] processor: chunked, worker-pool execution of a sub-task over a
//!   collection of items.
//!
//! ## Core Concepts
//!
//! A [`workflow::WorkflowDocument`] declares `params`, `env`, `flows`, and an ordered
//! list of `steps`. The [`engine::Engine`] resolves a flow (a named, ordered subset of
//! step names), then walks that flow in order, resolving each step's `inputs` through
//! the template engine against the current [`context::Context`], dispatching to a
//! [`task::TaskHandler`] registered under the step's `task` name, and recording a
//! [`workflow::StepResult`] back into the context's `steps` namespace.
//!
//! ## Examples
//!
//! ```rust,ignore
//! use workflow_engine_core::{
//!     engine::Engine,
//!     task::TaskRegistry,
//!     workflow::WorkflowDocument,
//! };
//!
//! let doc: WorkflowDocument = serde_yaml::from_str(yaml_source)?;
//! let registry = TaskRegistry::new();
//! let engine = Engine::new(doc, registry, "/tmp/workspace".into())?;
//! let state = engine.run(Default::default()).await?;
//! ```

pub mod batch;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod state;
pub mod task;
pub mod template;
pub mod workflow;

pub use context::Context;
pub use engine::{Engine, RunOptions};
pub use error::{TaskExecutionError, TemplateError, WorkflowError, WorkflowValidationError};
pub use state::{RunState, StateStore};
pub use task::{TaskConfig, TaskHandler, TaskRegistry};
pub use template::TemplateEngine;
pub use workflow::{ErrorAction, ErrorPolicy, Step, StepResult, StepStatus, WorkflowDocument};

/// Current version of the workflow engine core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports.
pub mod prelude {
    pub use crate::{
        context::Context,
        engine::{Engine, RunOptions},
        error::{TaskExecutionError, TemplateError, WorkflowError, WorkflowValidationError},
        state::{RunState, StateStore},
        task::{TaskConfig, TaskHandler, TaskRegistry},
        template::TemplateEngine,
        workflow::{ErrorAction, ErrorPolicy, Step, StepResult, StepStatus, WorkflowDocument},
    };
    pub use async_trait::async_trait;
    pub use serde_json::{json, Value};
}
