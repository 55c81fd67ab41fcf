//! Git-backed result store
//!
//! Each completed run is written to `<working copy>/<title>/`:
//!
//! | File | Content |
//! |------|---------|
//! | `log.txt` | stage log, see [`crate::report::log`] |
//! | `tests.txt` | test counters |
//! | `build-status.svg` | build badge |
//! | `test-status.svg` | test badge |
//!
//! The working copy may be shared by several daemons, so every save runs
//! under a [`SentinelLock`] covering fetch, checkout, write, commit and
//! push. A failed attempt releases the lock and the whole sequence is
//! retried after a delay.

use super::config::{ConfigError, ResultsConfig};
use super::git::GitRepo;
use super::lock::SentinelLock;
use crate::executor::StepExecutor;
use crate::pipeline::{ExecError, RunOutcome};
use crate::report::{self, TestSummary};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use url::Url;

/// Stage log file name
pub const LOG_FILE: &str = "log.txt";
/// Test counter file name
pub const TESTS_FILE: &str = "tests.txt";
/// Build badge file name
pub const BUILD_BADGE_FILE: &str = "build-status.svg";
/// Test badge file name
pub const TEST_BADGE_FILE: &str = "test-status.svg";

/// Errors publishing results
#[derive(Error, Debug)]
pub enum StoreError {
    /// The results repository could not be cloned
    #[error("Failed to clone results repository '{remote}': {reason}")]
    Clone {
        /// Remote that was cloned.
        remote: String,
        /// Why the clone failed.
        reason: String,
    },

    /// Another writer holds the lock
    ///
    /// A lock left behind by a killed daemon is never cleared automatically;
    /// the holder's PID tells an operator whether it is stale.
    #[error("Results lock {} is held by {}", .path.display(), lock_holder(.holder))]
    LockHeld {
        /// Lock file path.
        path: PathBuf,
        /// PID recorded in the lock file, when readable.
        holder: Option<u32>,
    },

    /// Filesystem failure
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A git command failed or timed out
    #[error("git {step} failed (exit code {exit_code}, timed out: {timed_out})")]
    Git {
        /// Git subcommand.
        step: String,
        /// Exit code of the git process.
        exit_code: i32,
        /// Whether it was killed for exceeding its timeout.
        timed_out: bool,
    },

    /// Git could not be started
    #[error("Failed to launch git {step}: {source}")]
    Launch {
        /// Git subcommand.
        step: String,
        /// Launch error.
        #[source]
        source: ExecError,
    },

    /// Every attempt failed
    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        #[source]
        last: Box<StoreError>,
    },
}

#[allow(clippy::ref_option)]
fn lock_holder(holder: &Option<u32>) -> String {
    match holder {
        Some(pid) => format!("process {pid}"),
        None => "another writer".to_string(),
    }
}

/// Publishes the results of a finished run
pub trait ResultPublisher: Send + Sync {
    /// Persists `outcome` and its classified tests
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the results could not be published.
    fn publish(&self, outcome: &RunOutcome, tests: &TestSummary) -> Result<(), StoreError>;
}

/// Builds status links for task result directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultLinks {
    base: Option<Url>,
    local_root: PathBuf,
}

impl ResultLinks {
    /// Links under `base`, or `file://` links into `local_root` without one
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `base` is not a hierarchical URL.
    pub fn new(base: Option<&str>, local_root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let base = base
            .map(|raw| {
                let url = Url::parse(raw)
                    .map_err(|e| ConfigError::Invalid(format!("result link base '{raw}': {e}")))?;
                if url.cannot_be_a_base() {
                    return Err(ConfigError::Invalid(format!(
                        "result link base '{raw}' cannot hold path segments"
                    )));
                }
                Ok(url)
            })
            .transpose()?;
        Ok(Self {
            base,
            local_root: local_root.into(),
        })
    }

    /// Links as configured for a result store
    ///
    /// # Errors
    ///
    /// See [`ResultLinks::new`].
    pub fn from_config(config: &ResultsConfig) -> Result<Self, ConfigError> {
        Self::new(config.result_link_base.as_deref(), &config.directory)
    }

    /// Percent-escaped link to the results of `title`
    #[must_use]
    pub fn link_for(&self, title: &str) -> String {
        if let Some(base) = &self.base {
            let mut url = base.clone();
            if let Ok(mut segments) = url.path_segments_mut() {
                segments.pop_if_empty().push(title);
            }
            return url.into();
        }

        let path = self.local_root.join(title);
        let path = std::path::absolute(&path).unwrap_or(path);
        Url::from_file_path(&path).map_or_else(|()| path.display().to_string(), String::from)
    }
}

/// Result store backed by a git working copy
#[derive(Debug)]
pub struct ResultStore {
    config: ResultsConfig,
    git: GitRepo,
    lock_path: PathBuf,
    links: ResultLinks,
}

impl ResultStore {
    /// Opens the working copy, cloning the remote first when it is missing
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Clone`] when no remote is configured or the
    /// clone fails.
    pub fn open(config: ResultsConfig, executor: Arc<dyn StepExecutor>) -> Result<Self, StoreError> {
        let remote = config.remote.clone().ok_or_else(|| StoreError::Clone {
            remote: String::new(),
            reason: "no results remote configured".to_string(),
        })?;
        let links = ResultLinks::from_config(&config).map_err(|e| StoreError::Clone {
            remote: remote.clone(),
            reason: e.to_string(),
        })?;

        let git = if config.directory.join(".git").exists() {
            GitRepo::open(&config.directory, executor)
        } else {
            if let Some(parent) = config.directory.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            GitRepo::clone_remote(&remote, &config.directory, executor, config.git_timeout)?
        };

        Ok(Self {
            lock_path: config.lock_path(),
            config,
            git,
            links,
        })
    }

    /// Local working copy
    #[must_use]
    pub fn working_copy(&self) -> &Path {
        self.git.dir()
    }

    /// Directory holding the results of `title`
    #[must_use]
    pub fn task_dir(&self, title: &str) -> PathBuf {
        self.git.dir().join(title)
    }

    /// Status link for `title`
    #[must_use]
    pub fn result_link(&self, title: &str) -> String {
        self.links.link_for(title)
    }

    /// Commits and pushes the results of one run
    ///
    /// Each attempt takes the sentinel lock, syncs the results branch,
    /// writes the reports, commits and pushes. Failed attempts are retried
    /// after `retry_delay`, up to `max_attempts` in total.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RetriesExhausted`] wrapping the last failure.
    pub fn save_results(&self, outcome: &RunOutcome, tests: &TestSummary) -> Result<(), StoreError> {
        let title = &outcome.spec.title;
        let attempts = self.config.max_attempts.max(1);
        let mut last = None;

        for attempt in 1..=attempts {
            match self.save_once(outcome, tests) {
                Ok(()) => {
                    tracing::info!(task = %title, attempt, "Results published");
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        task = %title,
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "Saving results failed"
                    );
                    last = Some(err);
                }
            }
            if attempt < attempts {
                thread::sleep(self.config.retry_delay);
            }
        }

        Err(StoreError::RetriesExhausted {
            attempts,
            last: Box::new(last.unwrap_or(StoreError::LockHeld {
                path: self.lock_path.clone(),
                holder: None,
            })),
        })
    }

    fn save_once(&self, outcome: &RunOutcome, tests: &TestSummary) -> Result<(), StoreError> {
        let _lock = SentinelLock::acquire(&self.lock_path)?;
        let timeout = self.config.git_timeout;
        let branch = self.config.branch.as_str();
        let upstream = format!("origin/{branch}");

        self.git.run(&["fetch", "-q", "origin"], timeout)?;
        if self
            .git
            .succeeds(&["rev-parse", "-q", "--verify", &upstream], timeout)?
        {
            self.git
                .run(&["checkout", "-q", "-f", "-B", branch, &upstream], timeout)?;
        } else {
            self.git.run(&["checkout", "-q", "-f", "-B", branch], timeout)?;
        }

        self.write_reports(outcome, tests)?;

        let message = format!("Results for '{}'", outcome.spec.title);
        self.git.run(&["add", "--all"], timeout)?;
        self.git
            .run(&["commit", "-q", "--allow-empty", "-m", &message], timeout)?;
        self.git
            .run(&["push", "-q", "-u", "origin", branch], self.config.push_timeout)?;
        Ok(())
    }

    fn write_reports(&self, outcome: &RunOutcome, tests: &TestSummary) -> Result<(), StoreError> {
        let dir = self.task_dir(&outcome.spec.title);
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut tests_log = Vec::new();
        report::write_test_log(&mut tests_log, tests).map_err(|source| StoreError::Io {
            path: dir.join(TESTS_FILE),
            source,
        })?;

        let files: [(&str, Vec<u8>); 4] = [
            (LOG_FILE, report::render_run_log(outcome).into_bytes()),
            (TESTS_FILE, tests_log),
            (BUILD_BADGE_FILE, report::build_badge(outcome).into_bytes()),
            (TEST_BADGE_FILE, report::test_badge(outcome, tests).into_bytes()),
        ];
        for (name, content) in files {
            let path = dir.join(name);
            fs::write(&path, content).map_err(|source| StoreError::Io { path, source })?;
        }
        Ok(())
    }
}

impl ResultPublisher for ResultStore {
    fn publish(&self, outcome: &RunOutcome, tests: &TestSummary) -> Result<(), StoreError> {
        self.save_results(outcome, tests)
    }
}
