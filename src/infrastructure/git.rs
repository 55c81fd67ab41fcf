//! Git invocations through a [`StepExecutor`]
//!
//! The result store never links a git library; it shells out to the `git`
//! binary like any other step, so every call is subject to a timeout and
//! can be scripted in tests.

use super::results::StoreError;
use crate::executor::StepExecutor;
use crate::pipeline::{Step, StepOutcome};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// A git working copy operated on through an executor
#[derive(Clone)]
pub struct GitRepo {
    dir: PathBuf,
    executor: Arc<dyn StepExecutor>,
}

impl std::fmt::Debug for GitRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRepo").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl GitRepo {
    /// Wraps an existing working copy
    pub fn open(dir: impl Into<PathBuf>, executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            dir: dir.into(),
            executor,
        }
    }

    /// Clones `remote` into `dir`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Clone`] when git cannot be launched or fails.
    pub fn clone_remote(
        remote: &str,
        dir: impl Into<PathBuf>,
        executor: Arc<dyn StepExecutor>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        let target = dir.to_string_lossy();
        let step = git_step(&["clone", "-v", remote, &*target]);
        let clone_error = |reason: String| StoreError::Clone {
            remote: remote.to_string(),
            reason,
        };

        let outcome = executor
            .execute(&step, Some(timeout), None)
            .map_err(|e| clone_error(e.to_string()))?;
        if !outcome.succeeded() {
            let detail = outcome.stderr().last().unwrap_or_default().to_string();
            return Err(clone_error(if outcome.timed_out {
                "timed out".to_string()
            } else {
                format!("exit code {}: {detail}", outcome.exit_code)
            }));
        }

        tracing::info!(remote = %remote, dir = %dir.display(), "Cloned results repository");
        Ok(Self::open(dir, executor))
    }

    /// Working copy directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Runs `git <args>` in the working copy, failing on nonzero exit
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Launch`] or [`StoreError::Git`].
    pub fn run(&self, args: &[&str], timeout: Duration) -> Result<StepOutcome, StoreError> {
        let outcome = self.exec(args, timeout)?;
        if outcome.succeeded() {
            Ok(outcome)
        } else {
            Err(StoreError::Git {
                step: subcommand(args),
                exit_code: outcome.exit_code,
                timed_out: outcome.timed_out,
            })
        }
    }

    /// Runs `git <args>` and reports whether it exited zero
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Launch`] when git cannot be started and
    /// [`StoreError::Git`] when it times out.
    pub fn succeeds(&self, args: &[&str], timeout: Duration) -> Result<bool, StoreError> {
        let outcome = self.exec(args, timeout)?;
        if outcome.timed_out {
            return Err(StoreError::Git {
                step: subcommand(args),
                exit_code: outcome.exit_code,
                timed_out: true,
            });
        }
        Ok(outcome.succeeded())
    }

    fn exec(&self, args: &[&str], timeout: Duration) -> Result<StepOutcome, StoreError> {
        let step = git_step(args);
        tracing::debug!(command = %step.command, "Running git");
        self.executor
            .execute(&step, Some(timeout), Some(&self.dir))
            .map_err(|source| StoreError::Launch {
                step: subcommand(args),
                source,
            })
    }
}

fn git_step(args: &[&str]) -> Step {
    let words = std::iter::once("git").chain(args.iter().copied());
    Step::new(shell_words::join(words)).with_name(format!("git {}", subcommand(args)))
}

fn subcommand(args: &[&str]) -> String {
    args.first().copied().unwrap_or("").to_string()
}
