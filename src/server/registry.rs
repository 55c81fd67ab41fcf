//! Task table and run registry

use crate::pipeline::{BuildSpec, RunOutcome};
use crate::report::badge::{build_passed, tests_passed};
use crate::report::{TestStats, TestSummary};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identifier of a registered run
///
/// Identifiers start at 0 and increase by one per registered run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Verdicts and counters kept for a finished run
///
/// Captured output is published with the results and not retained here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Every stage was attempted and successful.
    pub passed: bool,
    /// Verdict shown on the build badge.
    pub build_passed: bool,
    /// Verdict shown on the test badge.
    pub tests_passed: bool,
    /// Test counters summed over all test steps.
    pub tests: TestStats,
    /// When the run was recorded as finished.
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    /// Condenses a finished run and its classified tests
    #[must_use]
    pub fn of(outcome: &RunOutcome, tests: &TestSummary) -> Self {
        Self {
            passed: outcome.passed(),
            build_passed: build_passed(outcome),
            tests_passed: tests_passed(outcome, tests),
            tests: tests.total(),
            finished_at: Utc::now(),
        }
    }
}

/// A registered run and, once finished, its summary
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Task being run.
    pub spec: Arc<BuildSpec>,
    /// Set exactly once when the run finishes.
    pub summary: Option<RunSummary>,
}

impl RunRecord {
    /// Whether the run has finished
    #[must_use]
    pub fn completed(&self) -> bool {
        self.summary.is_some()
    }
}

/// In-memory registry of every run since startup
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Mutex<Vec<RunRecord>>,
}

impl RunRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a pending record and returns its identifier
    ///
    /// Allocation and insertion happen under one lock, so concurrent
    /// callers receive distinct, increasing identifiers.
    pub fn register(&self, spec: Arc<BuildSpec>) -> RunId {
        let mut runs = self.runs.lock();
        let id = RunId(runs.len() as u64);
        runs.push(RunRecord {
            spec,
            summary: None,
        });
        id
    }

    /// Stores the summary of a pending run
    ///
    /// Returns false when the run is unknown or was already completed.
    pub fn complete(&self, run: RunId, summary: RunSummary) -> bool {
        let mut runs = self.runs.lock();
        let Some(record) = usize::try_from(run.0).ok().and_then(|i| runs.get_mut(i)) else {
            return false;
        };
        if record.summary.is_some() {
            return false;
        }
        record.summary = Some(summary);
        true
    }

    /// Snapshot of a run's record
    #[must_use]
    pub fn get(&self, run: RunId) -> Option<RunRecord> {
        let runs = self.runs.lock();
        usize::try_from(run.0).ok().and_then(|i| runs.get(i)).cloned()
    }

    /// Number of registered runs
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    /// Whether no run has been registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Immutable map from task name to its BuildSpec
#[derive(Debug, Clone, Default)]
pub struct TaskTable {
    tasks: HashMap<String, Arc<BuildSpec>>,
}

impl TaskTable {
    /// Table holding exactly one task
    #[must_use]
    pub fn single(spec: BuildSpec) -> Self {
        Self::from_specs([spec])
    }

    /// Table keyed by each spec's title; later titles replace earlier ones
    pub fn from_specs(specs: impl IntoIterator<Item = BuildSpec>) -> Self {
        let tasks = specs
            .into_iter()
            .map(|spec| (spec.title.clone(), Arc::new(spec)))
            .collect();
        Self { tasks }
    }

    /// Looks up a task by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<BuildSpec>> {
        self.tasks.get(name)
    }

    /// Names of the loaded tasks, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of loaded tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is loaded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{StageName, StageOutcome};
    use crate::report::StepTests;
    use std::collections::HashSet;
    use std::thread;

    fn spec(title: &str) -> BuildSpec {
        BuildSpec::new(title, "https://example.com/repo.git")
    }

    fn outcome(spec: &Arc<BuildSpec>) -> RunOutcome {
        RunOutcome {
            spec: Arc::clone(spec),
            setup: StageOutcome::new(StageName::Setup, Vec::new()),
            build: StageOutcome::new(StageName::Build, Vec::new()),
            test: StageOutcome::new(StageName::Test, Vec::new()),
        }
    }

    fn summary(spec: &Arc<BuildSpec>) -> RunSummary {
        RunSummary::of(&outcome(spec), &TestSummary::default())
    }

    #[test]
    fn test_ids_start_at_zero_and_increase() {
        let registry = RunRegistry::new();
        let spec = Arc::new(spec("widgets"));

        assert_eq!(registry.register(Arc::clone(&spec)), RunId(0));
        assert_eq!(registry.register(Arc::clone(&spec)), RunId(1));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_registration_yields_distinct_ids() {
        let registry = Arc::new(RunRegistry::new());
        let spec = Arc::new(spec("widgets"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let spec = Arc::clone(&spec);
                thread::spawn(move || (0..25).map(|_| registry.register(Arc::clone(&spec))).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            seen.extend(ids);
        }
        assert_eq!(seen.len(), 200);
        assert_eq!(seen.iter().max(), Some(&RunId(199)));
    }

    #[test]
    fn test_complete_sets_outcome_once() {
        let registry = RunRegistry::new();
        let spec = Arc::new(spec("widgets"));
        let run = registry.register(Arc::clone(&spec));

        assert!(!registry.get(run).unwrap().completed());
        assert!(registry.complete(run, summary(&spec)));
        assert!(registry.get(run).unwrap().completed());
        assert!(!registry.complete(run, summary(&spec)));
        assert!(!registry.complete(RunId(5), summary(&spec)));
    }

    #[test]
    fn test_summary_keeps_verdicts_and_counters() {
        let spec = Arc::new(spec("widgets"));
        let mut run = outcome(&spec);
        run.test = StageOutcome::not_attempted(StageName::Test);
        let tests = TestSummary {
            steps: vec![StepTests {
                command: "make check".to_string(),
                stats: TestStats {
                    tests_run: 2,
                    tests_succeeded: 1,
                    tests_failed: 1,
                },
            }],
        };

        let summary = RunSummary::of(&run, &tests);

        assert!(!summary.passed);
        assert!(summary.build_passed);
        assert!(!summary.tests_passed);
        assert_eq!(summary.tests.tests_run, 2);
    }

    #[test]
    fn test_unknown_run_is_none() {
        let registry = RunRegistry::new();
        assert!(registry.get(RunId(0)).is_none());
        assert!(registry.get(RunId(u64::MAX)).is_none());
    }

    #[test]
    fn test_task_table_lookup() {
        let table = TaskTable::from_specs([spec("widgets"), spec("gadgets")]);

        assert_eq!(table.len(), 2);
        assert_eq!(table.names(), vec!["gadgets", "widgets"]);
        assert_eq!(table.get("widgets").unwrap().title, "widgets");
        assert!(table.get("gizmos").is_none());
        assert_eq!(TaskTable::single(spec("widgets")).len(), 1);
    }
}
