//! `cci serve` - Run the build daemon

use anyhow::{Context, Result};
use cci::executor::{CommandExecutor, StepExecutor};
use cci::infrastructure::{Config, ResultLinks, ResultStore, init_logging};
use cci::pipeline::BuildSpec;
use cci::server::{Dispatcher, RequestServer, TaskTable};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Command line overrides for the daemon configuration
#[derive(Debug, Default)]
pub struct ServeOptions {
    pub config: Option<PathBuf>,
    pub listen: Option<SocketAddr>,
    pub workers: Option<usize>,
    pub spec: Option<PathBuf>,
    pub workspace_root: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl ServeOptions {
    /// Loads the configuration file, if any, and applies the overrides
    pub fn resolve(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
        if let Some(spec) = &self.spec {
            config.build_spec.clone_from(spec);
        }
        if let Some(root) = &self.workspace_root {
            config.workspace_root.clone_from(root);
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

pub fn serve(options: &ServeOptions) -> Result<()> {
    let config = options.resolve()?;
    init_logging(&config.log_level).context("Failed to initialize logging")?;

    let spec = BuildSpec::load(&config.build_spec).with_context(|| {
        format!("Failed to load build spec: {}", config.build_spec.display())
    })?;
    tracing::info!(task = %spec.title, repository = %spec.repository, "Loaded build spec");

    let executor: Arc<dyn StepExecutor> = Arc::new(CommandExecutor::default());
    let links = ResultLinks::from_config(&config.results)?;
    let mut dispatcher = Dispatcher::new(
        TaskTable::single(spec),
        Arc::clone(&executor),
        &config.workspace_root,
        links,
    );
    if config.results.remote.is_some() {
        let store = ResultStore::open(config.results.clone(), Arc::clone(&executor))
            .context("Failed to open results repository")?;
        tracing::info!(working_copy = %store.working_copy().display(), "Publishing results");
        dispatcher = dispatcher.with_publisher(Arc::new(store));
    } else {
        tracing::warn!("No results remote configured, results will not be published");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("cci-io")
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async {
        let server =
            RequestServer::start(config.listen, config.server_config(), Arc::new(dispatcher))
                .await?;
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        tracing::info!("Interrupt received");

        let report = server.stop().await;
        if !report.all_exited() {
            tracing::warn!(
                still_running = report.workers - report.exited,
                "Exiting with runs in progress"
            );
        }
        Ok::<(), anyhow::Error>(())
    })
}
