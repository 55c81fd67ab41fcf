//! Test output classification
//!
//! Test steps report individual results through marker lines. The default
//! [`MarkerParser`] counts lines beginning with `[PASS]` or `[FAIL]`; other
//! conventions can be plugged in through [`TestOutputParser`].

use crate::pipeline::{StageOutcome, StepOutcome};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use thiserror::Error;

static PASS_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[PASS\]").expect("valid regex"));
static FAIL_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[FAIL\]").expect("valid regex"));

/// Test counters for one step, or a sum of steps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStats {
    /// Tests found
    pub tests_run: u64,
    /// Tests that passed
    pub tests_succeeded: u64,
    /// Tests that failed
    pub tests_failed: u64,
}

impl TestStats {
    /// Records one passing test
    pub fn record_pass(&mut self) {
        self.tests_run += 1;
        self.tests_succeeded += 1;
    }

    /// Records one failing test
    pub fn record_fail(&mut self) {
        self.tests_run += 1;
        self.tests_failed += 1;
    }
}

impl Add for TestStats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            tests_run: self.tests_run + rhs.tests_run,
            tests_succeeded: self.tests_succeeded + rhs.tests_succeeded,
            tests_failed: self.tests_failed + rhs.tests_failed,
        }
    }
}

impl AddAssign for TestStats {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for TestStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// Counters attributed to the test step that produced them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepTests {
    /// Command line of the test step
    pub command: String,
    /// Counters parsed from its output
    pub stats: TestStats,
}

/// Classified results of a whole test stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestSummary {
    /// One entry per successfully classified test step
    pub steps: Vec<StepTests>,
}

impl TestSummary {
    /// Sum over all steps
    #[must_use]
    pub fn total(&self) -> TestStats {
        self.steps.iter().map(|s| s.stats).sum()
    }
}

/// Error returned by a parser that cannot make sense of a step's output
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Cannot classify output of '{command}': {reason}")]
pub struct ClassifyError {
    /// Command line of the step
    pub command: String,
    /// Why classification failed
    pub reason: String,
}

/// Derives test counters from one test step's output
pub trait TestOutputParser: Send + Sync {
    /// Parses the captured lines of `step`
    ///
    /// # Errors
    ///
    /// Returns [`ClassifyError`] when the output cannot be classified.
    fn parse(&self, step: &StepOutcome) -> Result<TestStats, ClassifyError>;
}

/// Counts marker lines matching a pass or fail pattern
#[derive(Debug, Clone)]
pub struct MarkerParser {
    pass: Regex,
    fail: Regex,
}

impl Default for MarkerParser {
    fn default() -> Self {
        Self {
            pass: PASS_MARKER.clone(),
            fail: FAIL_MARKER.clone(),
        }
    }
}

impl MarkerParser {
    /// Creates a parser from custom patterns
    ///
    /// # Errors
    ///
    /// Returns the regex compilation error of either pattern.
    pub fn new(pass: &str, fail: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pass: Regex::new(pass)?,
            fail: Regex::new(fail)?,
        })
    }
}

impl TestOutputParser for MarkerParser {
    fn parse(&self, step: &StepOutcome) -> Result<TestStats, ClassifyError> {
        let mut stats = TestStats::default();
        for line in &step.lines {
            if self.fail.is_match(&line.text) {
                stats.record_fail();
            } else if self.pass.is_match(&line.text) {
                stats.record_pass();
            }
        }
        Ok(stats)
    }
}

/// Classifies every step of a test stage
///
/// Steps the parser rejects are logged and contribute nothing.
pub fn classify_tests(parser: &dyn TestOutputParser, stage: &StageOutcome) -> TestSummary {
    let mut summary = TestSummary::default();
    for step in &stage.steps {
        match parser.parse(step) {
            Ok(stats) => summary.steps.push(StepTests {
                command: step.step.command.clone(),
                stats,
            }),
            Err(err) => tracing::warn!(error = %err, "Skipping unclassifiable test output"),
        }
    }
    summary
}
