//! # cci - a small self-hosted build and test daemon
//!
//! `cci` accepts run requests over a JSON-over-TCP protocol, runs a
//! project's pipeline (checkout, build, test) as external processes under
//! timeout control, classifies test output and publishes the results to a
//! shared git repository.
//!
//! ## Layout
//!
//! - [`pipeline`]: build specs, steps, outcomes and the stage runner
//! - [`executor`]: process execution and per-run workspaces
//! - [`report`]: stage log, test classification and status badges
//! - [`infrastructure`]: configuration, logging and the result store
//! - [`server`]: wire protocol, request queue and worker pool
//!
//! ## Running a pipeline once
//!
//! ```no_run
//! use cci::prelude::*;
//! use std::sync::Arc;
//!
//! let spec = BuildSpec::new("widgets", "https://example.com/widgets.git")
//!     .build_step(Step::new("make"))
//!     .test_step(Step::new("make check"));
//! let runner = PipelineRunner::new(
//!     Arc::new(spec),
//!     Arc::new(CommandExecutor::default()),
//!     std::env::temp_dir().join("cci-workspaces"),
//! );
//! let outcome = runner.run_all();
//! print!("{}", render_run_log(&outcome));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod executor;
pub mod infrastructure;
pub mod pipeline;
pub mod report;
pub mod server;

// Prelude module for common imports
pub mod prelude;

// Re-export commonly used types
pub use executor::{CommandExecutor, StepExecutor, Workspace};
pub use infrastructure::{
    Config, ConfigError, ResultLinks, ResultPublisher, ResultStore, ResultsConfig, StoreError,
    init_logging,
};
pub use pipeline::{
    BuildSpec, ExecError, PipelineError, PipelineRunner, RunOutcome, StageName, StageOutcome, Step,
    StepOutcome, Validate, ValidationError,
};
pub use report::{MarkerParser, TestOutputParser, TestStats, TestSummary, classify_tests};
pub use server::{Dispatcher, RequestServer, RunId, ServerConfig, ServerError, StopReport, TaskTable};

/// Version of the cci crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
