//! `cci run` - Run a pipeline once in the foreground

use anyhow::{Context, Result};
use cci::executor::CommandExecutor;
use cci::infrastructure::{Config, init_logging};
use cci::pipeline::{BuildSpec, PipelineRunner};
use cci::report::{self, MarkerParser};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Runs the spec at `spec_path`, printing the stage log and test counters
///
/// Fails when any stage did not pass.
pub fn run_once(spec_path: &Path, workspace_root: Option<PathBuf>, log_level: &str) -> Result<()> {
    init_logging(log_level).context("Failed to initialize logging")?;

    let spec = BuildSpec::load(spec_path)
        .with_context(|| format!("Failed to load build spec: {}", spec_path.display()))?;
    let title = spec.title.clone();
    let root = workspace_root.unwrap_or_else(|| Config::default().workspace_root);

    let runner = PipelineRunner::new(Arc::new(spec), Arc::new(CommandExecutor::default()), root);
    let outcome = runner.run_all();
    let tests = report::classify_tests(&MarkerParser::default(), &outcome.test);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    report::write_run_log(&mut out, &outcome)?;
    report::write_test_log(&mut out, &tests)?;
    out.flush()?;

    if !outcome.passed() {
        anyhow::bail!("Pipeline '{title}' did not pass");
    }
    Ok(())
}
