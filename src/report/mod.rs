//! Run reports
//!
//! Everything the result store persists for a run: the stage log, test
//! counters derived from test output, and the two status badges.

pub mod badge;
pub mod classify;
pub mod log;

pub use badge::{FAIL_COLOR, PASS_COLOR, build_badge, status_badge, test_badge};
pub use classify::{
    ClassifyError, MarkerParser, StepTests, TestOutputParser, TestStats, TestSummary,
    classify_tests,
};
pub use log::{
    Failure, LogParseError, ParsedStage, ParsedStep, parse_run_log, render_run_log,
    write_run_log, write_test_log,
};
