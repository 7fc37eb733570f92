//! # Reference Task Handlers
//!
//! Built-in [`TaskHandler`](workflow_engine_core::TaskHandler) implementations: `echo`,
//! `shell`, `read_file`, and `write_file`. These exist so a workflow document is
//! runnable out of the box without the caller having to register anything — and so
//! the engine's own integration tests have something concrete to dispatch to.

mod echo;
mod fs;
mod shell;

pub use echo::EchoTask;
pub use fs::{ReadFileTask, WriteFileTask};
pub use shell::ShellTask;

use std::sync::Arc;
use workflow_engine_core::{TaskRegistry, WorkflowError};

/// Registers every reference task handler under its conventional name. Workflow
/// documents that only use these task types need no other setup.
pub fn register_all(registry: &mut TaskRegistry) -> Result<(), WorkflowError> {
    registry.register("echo", Arc::new(EchoTask))?;
    registry.register("shell", Arc::new(ShellTask))?;
    registry.register("read_file", Arc::new(ReadFileTask))?;
    registry.register("write_file", Arc::new(WriteFileTask))?;
    Ok(())
}
