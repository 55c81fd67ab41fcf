//! Request handling on worker threads
//!
//! A [`Dispatcher`] owns everything a worker needs to answer a request:
//! the task table, the run registry, the step executor, the test output
//! parser and, when publishing is enabled, the result store.

use super::ReplyHandle;
use super::protocol::{Request, RequestError, Response};
use super::registry::{RunId, RunRegistry, RunSummary, TaskTable};
use crate::executor::StepExecutor;
use crate::infrastructure::{ResultLinks, ResultPublisher};
use crate::pipeline::{BuildSpec, PipelineRunner, RunOutcome};
use crate::report::{MarkerParser, TestOutputParser, classify_tests};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Executes requests popped from the queue
pub struct Dispatcher {
    tasks: Arc<TaskTable>,
    runs: Arc<RunRegistry>,
    executor: Arc<dyn StepExecutor>,
    publisher: Option<Arc<dyn ResultPublisher>>,
    parser: Arc<dyn TestOutputParser>,
    links: ResultLinks,
    workspace_root: PathBuf,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("tasks", &self.tasks.names())
            .field("runs", &self.runs.len())
            .field("publishing", &self.publisher.is_some())
            .field("workspace_root", &self.workspace_root)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher that runs pipelines but publishes nothing
    pub fn new(
        tasks: TaskTable,
        executor: Arc<dyn StepExecutor>,
        workspace_root: impl Into<PathBuf>,
        links: ResultLinks,
    ) -> Self {
        Self {
            tasks: Arc::new(tasks),
            runs: Arc::new(RunRegistry::new()),
            executor,
            publisher: None,
            parser: Arc::new(MarkerParser::default()),
            links,
            workspace_root: workspace_root.into(),
        }
    }

    /// Publishes every finished run through `publisher`
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn ResultPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Classifies test output with `parser`
    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn TestOutputParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Registry of every run since startup
    #[must_use]
    pub fn runs(&self) -> &Arc<RunRegistry> {
        &self.runs
    }

    /// Loaded tasks
    #[must_use]
    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    /// Answers one request, writing exactly one reply
    ///
    /// A run request is acknowledged before the pipeline starts; the call
    /// then blocks until the run is executed, published and recorded.
    pub fn handle(&self, request: Request, reply: ReplyHandle) {
        match request {
            Request::Run { task_name } => {
                let Some(spec) = self.tasks.get(&task_name).cloned() else {
                    tracing::warn!(task = %task_name, "Run requested for unknown task");
                    reply.send(Response::error(&RequestError::UnknownTask { name: task_name }));
                    return;
                };
                let run = self.runs.register(Arc::clone(&spec));
                reply.send(Response::accepted(run));
                self.execute_run(run, spec);
            }
            Request::Status { run } => {
                let response = match self.runs.get(run) {
                    Some(record) => {
                        Response::status(record.completed(), self.links.link_for(&record.spec.title))
                    }
                    None => Response::error(&RequestError::UnknownRun { run }),
                };
                reply.send(response);
            }
        }
    }

    /// Runs the pipeline, classifies tests, publishes and records the outcome
    pub fn execute_run(&self, run: RunId, spec: Arc<BuildSpec>) -> RunOutcome {
        let span = tracing::info_span!("run", run_id = %run, task = %spec.title);
        let _enter = span.enter();

        tracing::info!("Starting run");
        let runner = PipelineRunner::new(spec, Arc::clone(&self.executor), &self.workspace_root);
        let outcome = runner.run_all();

        let tests = classify_tests(self.parser.as_ref(), &outcome.test);
        let total = tests.total();
        tracing::info!(
            passed = outcome.passed(),
            tests_run = total.tests_run,
            tests_failed = total.tests_failed,
            "Run finished"
        );

        match &self.publisher {
            Some(publisher) => {
                if let Err(err) = publisher.publish(&outcome, &tests) {
                    tracing::error!(error = %err, "Failed to publish results");
                }
            }
            None => tracing::debug!("Result publishing disabled"),
        }

        self.runs.complete(run, RunSummary::of(&outcome, &tests));
        tracing::info!("Run completed");
        outcome
    }
}
