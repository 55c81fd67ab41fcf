//! Core types for pipeline domain
//!
//! This module contains the outcome values produced by running a
//! build specification: captured output lines, per-step outcomes,
//! per-stage outcomes and the assembled run outcome.

#![allow(clippy::must_use_candidate)]

use super::spec::BuildSpec;
use super::steps::Step;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Stream a captured line was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    /// Primary output
    Stdout,
    /// Error output
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// One complete line of process output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    /// Originating stream
    pub stream: OutputStream,
    /// Line text without the terminator
    pub text: String,
}

impl OutputLine {
    /// Creates a stdout line
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    /// Creates a stderr line
    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }
}

/// The three stages of every run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    /// Source checkout
    Setup,
    /// Build steps
    Build,
    /// Test steps
    Test,
}

impl StageName {
    /// All stages in execution order
    pub const ALL: [Self; 3] = [Self::Setup, Self::Build, Self::Test];

    /// Lowercase stage name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Build => "build",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "setup" => Ok(Self::Setup),
            "build" => Ok(Self::Build),
            "test" => Ok(Self::Test),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

/// Result of executing one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// The step that ran
    pub step: Step,
    /// Captured lines in receipt order
    pub lines: Vec<OutputLine>,
    /// Process exit code; `-1` when terminated by a signal or never launched
    pub exit_code: i32,
    /// Whether the step was killed for exceeding its timeout
    pub timed_out: bool,
    /// Wall-clock time from spawn to reap
    pub duration: Duration,
    /// Wall-clock time at spawn
    pub started_at: DateTime<Utc>,
    /// Set when the step could not be launched
    pub launch_error: Option<String>,
}

impl StepOutcome {
    /// Records a step that could not be launched
    pub fn launch_failed(step: Step, error: impl fmt::Display) -> Self {
        Self {
            step,
            lines: Vec::new(),
            exit_code: -1,
            timed_out: false,
            duration: Duration::ZERO,
            started_at: Utc::now(),
            launch_error: Some(error.to_string()),
        }
    }

    /// Exit code zero, no timeout, launched
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && self.launch_error.is_none()
    }

    /// Lines captured from stdout
    pub fn stdout(&self) -> impl Iterator<Item = &str> {
        self.lines_from(OutputStream::Stdout)
    }

    /// Lines captured from stderr
    pub fn stderr(&self) -> impl Iterator<Item = &str> {
        self.lines_from(OutputStream::Stderr)
    }

    fn lines_from(&self, stream: OutputStream) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter(move |line| line.stream == stream)
            .map(|line| line.text.as_str())
    }
}

/// Outcome of one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    /// Which stage this is
    pub stage: StageName,
    /// Outcomes of the steps that ran, in order
    pub steps: Vec<StepOutcome>,
    /// False when an earlier stage failed and this one was skipped
    pub attempted: bool,
}

impl StageOutcome {
    /// Creates the outcome of a stage that ran
    pub fn new(stage: StageName, steps: Vec<StepOutcome>) -> Self {
        Self {
            stage,
            steps,
            attempted: true,
        }
    }

    /// Creates the empty outcome of a skipped stage
    pub fn not_attempted(stage: StageName) -> Self {
        Self {
            stage,
            steps: Vec::new(),
            attempted: false,
        }
    }

    /// Every step succeeded; vacuously true for zero steps
    pub fn successful(&self) -> bool {
        self.steps.iter().all(StepOutcome::succeeded)
    }

    /// Attempted and successful
    ///
    /// Reports use this so a skipped stage never shows as passing.
    pub fn passed(&self) -> bool {
        self.attempted && self.successful()
    }

    /// Number of recorded step outcomes
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when no step outcome was recorded
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Outcome of one full run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// The spec that ran
    pub spec: Arc<BuildSpec>,
    /// Checkout stage
    pub setup: StageOutcome,
    /// Build stage
    pub build: StageOutcome,
    /// Test stage
    pub test: StageOutcome,
}

impl RunOutcome {
    /// Stages in execution order
    pub fn stages(&self) -> [&StageOutcome; 3] {
        [&self.setup, &self.build, &self.test]
    }

    /// Every stage was attempted and successful
    pub fn passed(&self) -> bool {
        self.stages().iter().all(|stage| stage.passed())
    }
}

/// Trait for validatable types
pub trait Validate {
    /// Type of validation error
    type Error;

    /// Validates this type
    fn validate(&self) -> std::result::Result<(), Self::Error>;
}
