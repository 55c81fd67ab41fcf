//! Prelude module for common imports

// Pipeline model and runner
pub use crate::pipeline::{
    BuildSpec, OutputLine, OutputStream, PipelineRunner, RunOutcome, StageName, StageOutcome, Step,
    StepOutcome, Validate,
};

// Execution
pub use crate::executor::{CommandExecutor, StepExecutor};

// Reporting
pub use crate::report::{
    MarkerParser, TestOutputParser, TestStats, TestSummary, classify_tests, render_run_log,
};

// Publishing and serving
pub use crate::infrastructure::{ResultLinks, ResultPublisher, ResultStore};
pub use crate::server::{Dispatcher, RequestServer, ServerConfig, TaskTable};
