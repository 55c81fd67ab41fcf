//! Persisted stage log
//!
//! The log is plain text, one block per stage:
//!
//! ```text
//! == Stage "build"
//! ---------------------------------------------------------------------------
//! >> make all
//! -- compiling widgets
//! !! warning: unused variable
//! [ERROR] Command exited with 2
//!
//! ```
//!
//! `--` marks stdout, `!!` stderr. A skipped stage carries a single
//! `(not attempted)` line. [`parse_run_log`] reads the format back.

use super::classify::{TestStats, TestSummary};
use crate::pipeline::{OutputLine, OutputStream, RunOutcome, StageName, StageOutcome, StepOutcome};
use std::fmt;
use std::io::{self, Write};
use thiserror::Error;

/// Separator under each stage header
pub const RULE: &str =
    "---------------------------------------------------------------------------";

const STAGE_PREFIX: &str = "== Stage \"";
const NOT_ATTEMPTED: &str = "(not attempted)";
const COMMAND_PREFIX: &str = ">> ";
const STDOUT_PREFIX: &str = "-- ";
const STDERR_PREFIX: &str = "!! ";
const TIMED_OUT: &str = "[ERROR] Command timed out";
const EXITED_PREFIX: &str = "[ERROR] Command exited with ";
const LAUNCH_PREFIX: &str = "[ERROR] Command could not be launched: ";

/// Why a step did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// Killed after exceeding its timeout
    TimedOut,
    /// Exited with a nonzero code
    Exited(i32),
    /// Never started
    Launch(String),
}

impl Failure {
    /// Annotation for a step outcome, `None` when it succeeded
    #[must_use]
    pub fn of(step: &StepOutcome) -> Option<Self> {
        if let Some(error) = &step.launch_error {
            Some(Self::Launch(error.replace('\n', " ")))
        } else if step.timed_out {
            Some(Self::TimedOut)
        } else if step.exit_code != 0 {
            Some(Self::Exited(step.exit_code))
        } else {
            None
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => f.write_str(TIMED_OUT),
            Self::Exited(code) => write!(f, "{EXITED_PREFIX}{code}"),
            Self::Launch(reason) => write!(f, "{LAUNCH_PREFIX}{reason}"),
        }
    }
}

/// Writes the log of every stage of a run
///
/// # Errors
///
/// Returns any error of the underlying writer.
pub fn write_run_log<W: Write>(out: &mut W, outcome: &RunOutcome) -> io::Result<()> {
    for stage in outcome.stages() {
        write_stage(out, stage)?;
    }
    Ok(())
}

/// Renders the run log into a string
#[must_use]
pub fn render_run_log(outcome: &RunOutcome) -> String {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = write_run_log(&mut buf, outcome);
    String::from_utf8_lossy(&buf).into_owned()
}

fn write_stage<W: Write>(out: &mut W, stage: &StageOutcome) -> io::Result<()> {
    writeln!(out, "{STAGE_PREFIX}{}\"", stage.stage)?;
    writeln!(out, "{RULE}")?;
    if !stage.attempted {
        writeln!(out, "{NOT_ATTEMPTED}")?;
    }
    for step in &stage.steps {
        writeln!(out, "{COMMAND_PREFIX}{}", step.step.command)?;
        for line in &step.lines {
            let prefix = match line.stream {
                OutputStream::Stdout => STDOUT_PREFIX,
                OutputStream::Stderr => STDERR_PREFIX,
            };
            writeln!(out, "{prefix}{}", line.text)?;
        }
        if let Some(failure) = Failure::of(step) {
            writeln!(out, "{failure}")?;
        }
    }
    writeln!(out)
}

/// Writes test counters: totals first, then one line per test step
///
/// # Errors
///
/// Returns any error of the underlying writer.
pub fn write_test_log<W: Write>(out: &mut W, summary: &TestSummary) -> io::Result<()> {
    write_counters(out, summary.total())?;
    for step in &summary.steps {
        writeln!(out)?;
        writeln!(out, "{COMMAND_PREFIX}{}", step.command)?;
        write_counters(out, step.stats)?;
    }
    Ok(())
}

fn write_counters<W: Write>(out: &mut W, stats: TestStats) -> io::Result<()> {
    writeln!(out, "tests_run: {}", stats.tests_run)?;
    writeln!(out, "tests_succeeded: {}", stats.tests_succeeded)?;
    writeln!(out, "tests_failed: {}", stats.tests_failed)
}

/// One step read back from a log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStep {
    /// Command line
    pub command: String,
    /// Output lines with their streams
    pub lines: Vec<OutputLine>,
    /// Failure annotation, if any
    pub failure: Option<Failure>,
}

impl ParsedStep {
    /// No failure annotation
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// One stage read back from a log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStage {
    /// Stage name
    pub stage: StageName,
    /// False when marked `(not attempted)`
    pub attempted: bool,
    /// Steps in log order
    pub steps: Vec<ParsedStep>,
}

/// Errors reading a stage log
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogParseError {
    /// Stage header names an unknown stage
    #[error("line {line}: unknown stage '{name}'")]
    UnknownStage {
        /// One-based line number.
        line: usize,
        /// Name found in the header.
        name: String,
    },

    /// Line does not fit the format at this position
    #[error("line {line}: unexpected '{text}'")]
    Unexpected {
        /// One-based line number.
        line: usize,
        /// Offending text.
        text: String,
    },
}

/// Parses a log written by [`write_run_log`]
///
/// # Errors
///
/// Returns [`LogParseError`] on the first line that does not fit.
pub fn parse_run_log(text: &str) -> Result<Vec<ParsedStage>, LogParseError> {
    let mut stages: Vec<ParsedStage> = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let unexpected = || LogParseError::Unexpected {
            line,
            text: raw.to_string(),
        };

        if let Some(rest) = raw.strip_prefix(STAGE_PREFIX) {
            let name = rest.strip_suffix('"').ok_or_else(unexpected)?;
            let stage = name.parse().map_err(|_| LogParseError::UnknownStage {
                line,
                name: name.to_string(),
            })?;
            stages.push(ParsedStage {
                stage,
                attempted: true,
                steps: Vec::new(),
            });
            continue;
        }
        if raw.is_empty() || raw == RULE {
            continue;
        }

        let stage = stages.last_mut().ok_or_else(unexpected)?;
        if raw == NOT_ATTEMPTED {
            stage.attempted = false;
        } else if let Some(command) = raw.strip_prefix(COMMAND_PREFIX) {
            stage.steps.push(ParsedStep {
                command: command.to_string(),
                lines: Vec::new(),
                failure: None,
            });
        } else {
            let step = stage.steps.last_mut().ok_or_else(unexpected)?;
            if let Some(out) = raw.strip_prefix(STDOUT_PREFIX) {
                step.lines.push(OutputLine::stdout(out));
            } else if let Some(err) = raw.strip_prefix(STDERR_PREFIX) {
                step.lines.push(OutputLine::stderr(err));
            } else if raw == TIMED_OUT {
                step.failure = Some(Failure::TimedOut);
            } else if let Some(code) = raw.strip_prefix(EXITED_PREFIX) {
                let code = code.parse().map_err(|_| unexpected())?;
                step.failure = Some(Failure::Exited(code));
            } else if let Some(reason) = raw.strip_prefix(LAUNCH_PREFIX) {
                step.failure = Some(Failure::Launch(reason.to_string()));
            } else {
                return Err(unexpected());
            }
        }
    }

    Ok(stages)
}
