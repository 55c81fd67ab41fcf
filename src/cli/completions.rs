//! `cci completions` - Generate shell completions
//!
//! Scripts go to stdout, to a named file, or into a completion directory
//! under the name the shell looks for (`cci.bash`, `_cci`, `cci.fish`, ...).

use anyhow::{Context, Result};
use clap_complete::{Generator, Shell};
use std::fs;
use std::path::{Path, PathBuf};

/// Name the completions are registered for
const BIN_NAME: &str = "cci";

pub fn generate_completions(shell: Shell) -> Result<String> {
    let mut cmd = super::build_cli();
    let mut buf = Vec::new();
    clap_complete::generate(shell, &mut cmd, BIN_NAME, &mut buf);

    String::from_utf8(buf).context("Failed to generate completions")
}

/// File name `shell` loads completions for `cci` from
pub fn completion_file_name(shell: Shell) -> String {
    shell.file_name(BIN_NAME)
}

/// Writes completions to `target` and returns the file written
///
/// A directory target receives [`completion_file_name`].
pub fn write_completions(shell: Shell, target: &Path) -> Result<PathBuf> {
    if target.is_dir() {
        let mut cmd = super::build_cli();
        return clap_complete::generate_to(shell, &mut cmd, BIN_NAME, target)
            .with_context(|| format!("Failed to write completions into: {}", target.display()));
    }

    let completions = generate_completions(shell)?;
    fs::write(target, completions)
        .with_context(|| format!("Failed to write completions to: {}", target.display()))?;
    Ok(target.to_path_buf())
}
