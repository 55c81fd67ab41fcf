//! Step execution traits
//!
//! The pipeline runner and result store depend on [`StepExecutor`] rather
//! than on a concrete process runner so either can be driven by a scripted
//! executor in tests.

use crate::pipeline::{ExecError, Step, StepOutcome};
use std::path::Path;
use std::time::Duration;

/// Trait for running a single step to completion or timeout
pub trait StepExecutor: Send + Sync {
    /// Executes `step` and returns its outcome
    ///
    /// `default_timeout` applies when the step carries no timeout of its own.
    /// `base_dir` roots the step's relative working directory; when absent
    /// the process's current directory is used.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] only when the command cannot be launched. A
    /// nonzero exit or a timeout is reported inside the [`StepOutcome`].
    fn execute(
        &self,
        step: &Step,
        default_timeout: Option<Duration>,
        base_dir: Option<&Path>,
    ) -> Result<StepOutcome, ExecError>;
}
