//! Stage sequencing for one run
//!
//! A [`PipelineRunner`] drives the three stages of a build specification
//! strictly in order:
//!
//! 1. **setup** clones the repository into a fresh workspace
//! 2. **build** runs the build steps, stopping at the first failure
//! 3. **test** runs every test step regardless of earlier test failures
//!
//! A stage only runs when the previous one was successful; skipped stages
//! are recorded as empty, not-attempted outcomes. The runner owns the run's
//! [`Workspace`], which is removed when the runner is dropped.

use super::spec::BuildSpec;
use super::steps::Step;
use super::types::{RunOutcome, StageName, StageOutcome, StepOutcome};
use crate::executor::{StepExecutor, Workspace};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle of a [`PipelineRunner`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// No stage has started
    NotStarted,
    /// Checkout in progress or last run
    SetupRunning,
    /// Build steps in progress or last run
    BuildRunning,
    /// Test steps in progress or last run
    TestRunning,
    /// All stages have been dealt with
    Done,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not-started",
            Self::SetupRunning => "setup",
            Self::BuildRunning => "build",
            Self::TestRunning => "test",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Runs one build specification in its own workspace
pub struct PipelineRunner {
    spec: Arc<BuildSpec>,
    executor: Arc<dyn StepExecutor>,
    workspace_root: PathBuf,
    workspace: Workspace,
    state: RunnerState,
}

impl fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("task", &self.spec.title)
            .field("workspace", &self.workspace.path())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl PipelineRunner {
    /// Creates a runner with a freshly allocated workspace under `workspace_root`
    pub fn new(
        spec: Arc<BuildSpec>,
        executor: Arc<dyn StepExecutor>,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        let workspace_root = workspace_root.into();
        let workspace = Workspace::allocate(&workspace_root);
        Self {
            spec,
            executor,
            workspace_root,
            workspace,
            state: RunnerState::NotStarted,
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Directory the sources are checked out into
    #[must_use]
    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    /// Clones the repository into the workspace
    pub fn run_setup(&mut self) -> StageOutcome {
        self.state = RunnerState::SetupRunning;
        let step = self.spec.checkout_step(self.workspace.path());
        tracing::info!(
            task = %self.spec.title,
            stage = %StageName::Setup,
            workspace = %self.workspace.path().display(),
            "Running stage"
        );

        if let Err(err) = fs::create_dir_all(&self.workspace_root) {
            tracing::error!(
                root = %self.workspace_root.display(),
                error = %err,
                "Cannot create workspace root"
            );
            let outcome = StepOutcome::launch_failed(
                step,
                format!("cannot create workspace root: {err}"),
            );
            return StageOutcome::new(StageName::Setup, vec![outcome]);
        }

        let outcome = self.run_step(StageName::Setup, &step, None);
        StageOutcome::new(StageName::Setup, vec![outcome])
    }

    /// Runs build steps in order until one does not succeed
    pub fn run_build(&mut self) -> StageOutcome {
        self.state = RunnerState::BuildRunning;
        let spec = Arc::clone(&self.spec);
        self.log_stage_start(StageName::Build, spec.build_steps.len());

        let mut outcomes = Vec::with_capacity(spec.build_steps.len());
        for step in &spec.build_steps {
            let outcome = self.run_step(StageName::Build, step, Some(self.workspace.path()));
            let succeeded = outcome.succeeded();
            outcomes.push(outcome);
            if !succeeded {
                tracing::info!(
                    stage = %StageName::Build,
                    skipped = spec.build_steps.len() - outcomes.len(),
                    "Build step failed, skipping remaining steps"
                );
                break;
            }
        }
        StageOutcome::new(StageName::Build, outcomes)
    }

    /// Runs every test step
    ///
    /// Failing tests do not stop the stage; a step that cannot be launched does.
    pub fn run_test(&mut self) -> StageOutcome {
        self.state = RunnerState::TestRunning;
        let spec = Arc::clone(&self.spec);
        self.log_stage_start(StageName::Test, spec.test_steps.len());

        let mut outcomes = Vec::with_capacity(spec.test_steps.len());
        for step in &spec.test_steps {
            let outcome = self.run_step(StageName::Test, step, Some(self.workspace.path()));
            let launch_failed = outcome.launch_error.is_some();
            outcomes.push(outcome);
            if launch_failed {
                break;
            }
        }
        StageOutcome::new(StageName::Test, outcomes)
    }

    /// Runs setup, then build if setup succeeded, then test if build succeeded
    ///
    /// Consumes the runner, so the workspace is removed before this returns.
    #[must_use]
    pub fn run_all(mut self) -> RunOutcome {
        let start = Instant::now();

        let setup = self.run_setup();
        let build = if setup.successful() {
            self.run_build()
        } else {
            StageOutcome::not_attempted(StageName::Build)
        };
        let test = if setup.successful() && build.successful() {
            self.run_test()
        } else {
            StageOutcome::not_attempted(StageName::Test)
        };
        self.state = RunnerState::Done;

        let outcome = RunOutcome {
            spec: Arc::clone(&self.spec),
            setup,
            build,
            test,
        };
        tracing::info!(
            task = %self.spec.title,
            passed = outcome.passed(),
            duration_ms = start.elapsed().as_millis(),
            "Pipeline finished"
        );
        outcome
    }

    fn log_stage_start(&self, stage: StageName, steps: usize) {
        tracing::info!(task = %self.spec.title, stage = %stage, steps, "Running stage");
    }

    fn run_step(&self, stage: StageName, step: &Step, base_dir: Option<&Path>) -> StepOutcome {
        match self
            .executor
            .execute(step, self.spec.default_command_timeout, base_dir)
        {
            Ok(outcome) => {
                if !outcome.succeeded() {
                    tracing::info!(
                        stage = %stage,
                        command = %step.command,
                        exit_code = outcome.exit_code,
                        timed_out = outcome.timed_out,
                        "Step failed"
                    );
                }
                outcome
            }
            Err(err) => {
                tracing::warn!(
                    stage = %stage,
                    command = %step.command,
                    error = %err,
                    "Step could not be launched"
                );
                StepOutcome::launch_failed(step.clone(), err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ExecError;
    use chrono::Utc;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Executor that answers from a table of exit codes and records every call
    #[derive(Default)]
    struct ScriptedExecutor {
        exit_codes: HashMap<String, i32>,
        unlaunchable: Vec<String>,
        calls: Mutex<Vec<(String, Option<PathBuf>, Option<Duration>)>>,
    }

    impl ScriptedExecutor {
        fn exit(mut self, command: &str, code: i32) -> Self {
            self.exit_codes.insert(command.to_string(), code);
            self
        }

        fn unlaunchable(mut self, command: &str) -> Self {
            self.unlaunchable.push(command.to_string());
            self
        }

        fn commands(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(c, _, _)| c.clone()).collect()
        }
    }

    impl StepExecutor for ScriptedExecutor {
        fn execute(
            &self,
            step: &Step,
            default_timeout: Option<Duration>,
            base_dir: Option<&Path>,
        ) -> Result<StepOutcome, ExecError> {
            self.calls.lock().push((
                step.command.clone(),
                base_dir.map(Path::to_path_buf),
                default_timeout,
            ));
            if self.unlaunchable.contains(&step.command) {
                return Err(ExecError::Launch {
                    program: step.command.clone(),
                    reason: "not found".to_string(),
                });
            }

            let mut exit_code = self.exit_codes.get(&step.command).copied().unwrap_or(0);
            if step.command.starts_with("git clone") {
                let argv = shell_words::split(&step.command).unwrap();
                exit_code = self.exit_codes.get("git clone").copied().unwrap_or(0);
                if exit_code == 0 {
                    let target = PathBuf::from(argv.last().unwrap());
                    std::fs::create_dir_all(target.join(".git")).unwrap();
                    std::fs::write(target.join(".git/HEAD"), "ref: refs/heads/main").unwrap();
                }
            }

            Ok(StepOutcome {
                step: step.clone(),
                lines: Vec::new(),
                exit_code,
                timed_out: false,
                duration: Duration::from_millis(1),
                started_at: Utc::now(),
                launch_error: None,
            })
        }
    }

    fn runner(spec: BuildSpec, executor: &Arc<ScriptedExecutor>, root: &TempDir) -> PipelineRunner {
        let executor: Arc<dyn StepExecutor> = executor.clone();
        PipelineRunner::new(Arc::new(spec), executor, root.path())
    }

    fn spec() -> BuildSpec {
        BuildSpec::new("widgets", "https://example.com/widgets.git")
    }

    #[test]
    fn test_build_stops_at_first_failure() {
        let root = TempDir::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::default().exit("b", 1));
        let spec = spec()
            .build_step(Step::new("a"))
            .build_step(Step::new("b"))
            .build_step(Step::new("c"));

        let mut runner = runner(spec, &executor, &root);
        let build = runner.run_build();

        let commands: Vec<_> = build.steps.iter().map(|s| s.step.command.as_str()).collect();
        assert_eq!(commands, vec!["a", "b"]);
        assert!(!build.successful());
        assert!(!executor.commands().contains(&"c".to_string()));
    }

    #[test]
    fn test_test_stage_runs_every_step() {
        let root = TempDir::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::default().exit("a", 1));
        let spec = spec().test_step(Step::new("a")).test_step(Step::new("b"));

        let mut runner = runner(spec, &executor, &root);
        let test = runner.run_test();

        assert_eq!(test.len(), 2);
        assert!(!test.successful());
        assert_eq!(executor.commands(), vec!["a", "b"]);
    }

    #[test]
    fn test_launch_failure_stops_test_stage() {
        let root = TempDir::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::default().unlaunchable("missing"));
        let spec = spec()
            .test_step(Step::new("missing"))
            .test_step(Step::new("b"));

        let mut runner = runner(spec, &executor, &root);
        let test = runner.run_test();

        assert_eq!(test.len(), 1);
        assert_eq!(test.steps[0].exit_code, -1);
        assert!(test.steps[0].launch_error.is_some());
        assert!(!test.successful());
    }

    #[test]
    fn test_failing_setup_skips_build_and_test() {
        let root = TempDir::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::default().exit("git clone", 128));
        let spec = spec().build_step(Step::new("make")).test_step(Step::new("make check"));

        let outcome = runner(spec, &executor, &root).run_all();

        assert_eq!(outcome.setup.len(), 1);
        assert!(!outcome.setup.successful());
        assert!(outcome.build.is_empty());
        assert!(outcome.test.is_empty());
        assert!(!outcome.build.attempted);
        assert!(!outcome.test.attempted);
        assert_eq!(executor.commands().len(), 1);
    }

    #[test]
    fn test_failing_build_skips_test() {
        let root = TempDir::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::default().exit("make", 2));
        let spec = spec().build_step(Step::new("make")).test_step(Step::new("make check"));

        let outcome = runner(spec, &executor, &root).run_all();

        assert!(outcome.setup.passed());
        assert!(!outcome.build.successful());
        assert!(!outcome.test.attempted);
        assert!(!executor.commands().contains(&"make check".to_string()));
    }

    #[test]
    fn test_run_all_runs_steps_in_workspace_and_removes_it() {
        let root = TempDir::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::default());
        let spec = spec()
            .with_default_timeout(Duration::from_secs(30))
            .build_step(Step::new("make"))
            .test_step(Step::new("make check"));

        let runner = runner(spec, &executor, &root);
        let workspace = runner.workspace().to_path_buf();
        let outcome = runner.run_all();

        assert!(outcome.passed());
        assert!(!workspace.exists());

        let calls = executor.calls.lock().clone();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].1, None);
        assert_eq!(calls[1].1.as_deref(), Some(workspace.as_path()));
        assert_eq!(calls[2].1.as_deref(), Some(workspace.as_path()));
        assert!(calls.iter().all(|(_, _, t)| *t == Some(Duration::from_secs(30))));
    }

    #[test]
    fn test_state_transitions() {
        let root = TempDir::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::default());
        let mut runner = runner(spec(), &executor, &root);

        assert_eq!(runner.state(), RunnerState::NotStarted);
        let _ = runner.run_setup();
        assert_eq!(runner.state(), RunnerState::SetupRunning);
        let _ = runner.run_build();
        assert_eq!(runner.state(), RunnerState::BuildRunning);
        let _ = runner.run_test();
        assert_eq!(runner.state(), RunnerState::TestRunning);
    }

    #[test]
    fn test_dropping_runner_removes_workspace() {
        let root = TempDir::new().unwrap();
        let executor = Arc::new(ScriptedExecutor::default());
        let mut runner = runner(spec(), &executor, &root);

        let setup = runner.run_setup();
        let workspace = runner.workspace().to_path_buf();
        assert!(setup.passed());
        assert!(workspace.join(".git/HEAD").exists());

        drop(runner);
        assert!(!workspace.exists());
    }

    #[cfg(unix)]
    mod checkout {
        use super::*;
        use pretty_assertions::assert_eq;
        use crate::executor::CommandExecutor;
        use std::process::Command;

        fn git(dir: &Path, args: &[&str]) -> String {
            let output = Command::new("git")
                .arg("-C")
                .arg(dir)
                .args(["-c", "user.name=cci", "-c", "user.email=cci@example.com"])
                .args(args)
                .output()
                .unwrap();
            assert!(output.status.success(), "git {args:?} failed");
            String::from_utf8(output.stdout).unwrap().trim().to_string()
        }

        fn commit(dir: &Path, content: &str) -> String {
            std::fs::write(dir.join("VERSION"), content).unwrap();
            git(dir, &["add", "VERSION"]);
            git(dir, &["commit", "-q", "--no-gpg-sign", "-m", content]);
            git(dir, &["rev-parse", "HEAD"])
        }

        #[test]
        fn test_setup_checks_out_pinned_commit() {
            let origin = TempDir::new().unwrap();
            git(origin.path(), &["init", "-q"]);
            let pinned = commit(origin.path(), "v1");
            commit(origin.path(), "v2");

            let root = TempDir::new().unwrap();
            let spec = BuildSpec::new("widgets", format!("file://{}", origin.path().display()))
                .with_reference(pinned.as_str());
            let mut runner = PipelineRunner::new(
                Arc::new(spec),
                Arc::new(CommandExecutor::default()),
                root.path(),
            );

            let setup = runner.run_setup();

            assert_eq!(setup.len(), 1);
            assert!(setup.passed(), "checkout failed: {:?}", setup.steps[0].lines);
            let checkout = runner.workspace();
            assert_eq!(std::fs::read_to_string(checkout.join("VERSION")).unwrap(), "v1");
            assert_eq!(git(checkout, &["rev-parse", "HEAD"]), pinned);
        }

        #[test]
        fn test_setup_clones_branch_reference() {
            let origin = TempDir::new().unwrap();
            git(origin.path(), &["init", "-q"]);
            commit(origin.path(), "v1");
            git(origin.path(), &["branch", "release"]);
            commit(origin.path(), "v2");

            let root = TempDir::new().unwrap();
            let spec = BuildSpec::new("widgets", format!("file://{}", origin.path().display()))
                .with_reference("release");
            let mut runner = PipelineRunner::new(
                Arc::new(spec),
                Arc::new(CommandExecutor::default()),
                root.path(),
            );

            assert!(runner.run_setup().passed());
            assert_eq!(
                std::fs::read_to_string(runner.workspace().join("VERSION")).unwrap(),
                "v1"
            );
        }
    }
}
