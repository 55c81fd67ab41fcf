//! Command line interface
//!
//! - `serve`: run the request server until Ctrl-C
//! - `run`: run one pipeline in the foreground
//! - `request`: send one request to a running server
//! - `completions`: generate shell completions

pub mod completions;
pub mod request;
pub mod run;
pub mod serve;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::net::SocketAddr;
use std::path::PathBuf;

/// CLI arguments for cci
#[derive(Parser, Debug)]
#[command(name = "cci")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the build daemon
    Serve {
        /// Daemon configuration file (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Address to listen on
        #[arg(short, long)]
        listen: Option<SocketAddr>,
        /// Number of worker threads
        #[arg(short, long)]
        workers: Option<usize>,
        /// Build spec file (JSON or YAML)
        #[arg(short, long)]
        spec: Option<PathBuf>,
        /// Directory run workspaces are created in
        #[arg(long)]
        workspace_root: Option<PathBuf>,
        /// Log level, overridden by RUST_LOG
        #[arg(long)]
        log_level: Option<String>,
    },

    /// Run a pipeline once and print its log
    Run {
        /// Build spec file (JSON or YAML)
        #[arg(short, long, default_value = "build.json")]
        spec: PathBuf,
        /// Directory the run workspace is created in
        #[arg(long)]
        workspace_root: Option<PathBuf>,
        /// Log level, overridden by RUST_LOG
        #[arg(long, default_value = "warn")]
        log_level: String,
    },

    /// Send a request to a running daemon
    Request {
        /// Daemon address
        #[arg(short, long, default_value = "127.0.0.1:5274")]
        addr: String,
        /// Seconds to wait for the reply
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
        #[command(subcommand)]
        action: RequestAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: Shell,
        /// Output file, or a directory to receive the shell's conventional
        /// file name (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum RequestAction {
    /// Start a run of a task
    Run {
        /// Task name (the build spec title)
        task: String,
    },
    /// Ask whether a run has completed
    Status {
        /// Build reference returned by `run`
        run: u64,
    },
}

/// Build the CLI command for completion generation
pub fn build_cli() -> clap::Command {
    Args::command()
}

/// Parse and execute CLI arguments
pub fn run() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Serve {
            config,
            listen,
            workers,
            spec,
            workspace_root,
            log_level,
        } => {
            let options = serve::ServeOptions {
                config,
                listen,
                workers,
                spec,
                workspace_root,
                log_level,
            };
            serve::serve(&options)?;
        }
        Command::Run {
            spec,
            workspace_root,
            log_level,
        } => {
            run::run_once(&spec, workspace_root, &log_level)?;
        }
        Command::Request {
            addr,
            timeout,
            action,
        } => {
            let request = match action {
                RequestAction::Run { task } => request::run_request(&task),
                RequestAction::Status { run } => request::status_request(run),
            };
            let response =
                request::send(&addr, &request, std::time::Duration::from_secs(timeout))?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if let cci::server::Response::Error { error, .. } = response {
                anyhow::bail!("Request rejected: {error}");
            }
        }
        Command::Completions { shell, output } => match output {
            Some(target) => {
                let written = completions::write_completions(shell, &target)?;
                eprintln!("Wrote {shell} completions to {}", written.display());
            }
            None => print!("{}", completions::generate_completions(shell)?),
        },
    }

    Ok(())
}
