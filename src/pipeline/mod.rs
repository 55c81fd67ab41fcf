//! Pipeline domain types and logic

pub mod errors;
pub mod runner;
pub mod spec;
pub mod steps;
pub mod types;


pub use errors::{ExecError, PipelineError, ValidationError};
pub use runner::{PipelineRunner, RunnerState};
pub use spec::BuildSpec;
pub use steps::Step;
pub use types::{
    OutputLine, OutputStream, RunOutcome, StageName, StageOutcome, StepOutcome, Validate,
};
