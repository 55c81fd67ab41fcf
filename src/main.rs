//! cci - build and test daemon
//!
//! ## Commands
//!
//! - `cci serve` - Run the daemon until Ctrl-C
//! - `cci run` - Run a pipeline once in the foreground
//! - `cci request` - Send a request to a running daemon
//! - `cci completions` - Generate shell completions
//!
//! ## Quick Start
//!
//! ```bash
//! # Serve the task described by build.json on port 5274
//! cci serve --spec build.json
//!
//! # Queue a run and ask for its status
//! cci request run widgets
//! cci request status 0
//! ```

use std::process::ExitCode;

mod cli;

fn main() -> ExitCode {
    match cli::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            if std::env::var("CCI_VERBOSE").is_ok() {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}
