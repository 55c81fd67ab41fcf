//! Step execution layer
//!
//! This module contains the [`StepExecutor`] seam, its operating system
//! process implementation and the per-run workspace guard.

mod command;
mod traits;
mod workspace;

pub use command::{CommandExecutor, resolve_working_dir, split_command};
pub use traits::StepExecutor;
pub use workspace::{Workspace, clear_readonly};
