//! Build specification: the immutable project descriptor
//!
//! A [`BuildSpec`] is loaded once at startup from JSON (or YAML, chosen by
//! file extension) and shared read-only by every run of its task.

use super::errors::{PipelineError, ValidationError};
use super::steps::{Step, millis};
use super::types::{StageName, Validate};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Project descriptor for one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    /// Task name; also the results directory name
    pub title: String,

    /// Source repository URL passed to `git clone`
    pub repository: String,

    /// Branch, tag or commit hash to check out; the remote default when absent
    ///
    /// A reference of 7 to 64 hex digits is taken as a commit hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_reference: Option<String>,

    /// Build steps, run in order until the first failure
    #[serde(default)]
    pub build_steps: Vec<Step>,

    /// Test steps, all run regardless of failures
    #[serde(default)]
    pub test_steps: Vec<Step>,

    /// Timeout applied to steps without their own
    #[serde(default, with = "millis::option", skip_serializing_if = "Option::is_none")]
    pub default_command_timeout: Option<Duration>,
}

impl BuildSpec {
    /// Creates a spec with no steps
    #[must_use]
    pub fn new(title: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            repository: repository.into(),
            commit_reference: None,
            build_steps: Vec::new(),
            test_steps: Vec::new(),
            default_command_timeout: None,
        }
    }

    /// Sets the commit reference
    #[must_use]
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.commit_reference = Some(reference.into());
        self
    }

    /// Appends a build step
    #[must_use]
    pub fn build_step(mut self, step: Step) -> Self {
        self.build_steps.push(step);
        self
    }

    /// Appends a test step
    #[must_use]
    pub fn test_step(mut self, step: Step) -> Self {
        self.test_steps.push(step);
        self
    }

    /// Sets the default command timeout
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_command_timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    /// Parses and validates a JSON document
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Parse`] or [`PipelineError::Validation`].
    pub fn from_json(content: &str) -> Result<Self, PipelineError> {
        let spec: Self = serde_json::from_str(content).map_err(|e| PipelineError::Parse {
            format: "json",
            reason: e.to_string(),
        })?;
        spec.validate()?;
        Ok(spec)
    }

    /// Parses and validates a YAML document
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Parse`] or [`PipelineError::Validation`].
    pub fn from_yaml(content: &str) -> Result<Self, PipelineError> {
        let spec: Self = serde_yaml::from_str(content).map_err(|e| PipelineError::Parse {
            format: "yaml",
            reason: e.to_string(),
        })?;
        spec.validate()?;
        Ok(spec)
    }

    /// Loads a spec file; `.yaml`/`.yml` are read as YAML, anything else as JSON
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] when the file cannot be read, otherwise
    /// the errors of [`BuildSpec::from_json`] / [`BuildSpec::from_yaml`].
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let content = fs::read_to_string(path)
            .map_err(|e| PipelineError::Io(format!("{}: {e}", path.display())))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml(&content),
            _ => Self::from_json(&content),
        }
    }

    /// Commit hash the spec is pinned to, if its reference is one
    #[must_use]
    pub fn pinned_commit(&self) -> Option<&str> {
        self.commit_reference
            .as_deref()
            .filter(|reference| is_commit_hash(reference))
    }

    /// Synthesises the shallow checkout step populating `workspace`
    ///
    /// Branches and tags are cloned directly. `git clone --branch` cannot
    /// name a commit, so a pinned commit is fetched alone into a fresh
    /// repository instead; the four git commands run as one `sh -c` step.
    #[must_use]
    pub fn checkout_step(&self, workspace: &Path) -> Step {
        let workspace = workspace.to_string_lossy();
        let command = match self.pinned_commit() {
            Some(commit) => {
                let ws = &*workspace;
                let script = [
                    shell_words::join(["git", "init", "-q", "--", ws]),
                    shell_words::join([
                        "git",
                        "-C",
                        ws,
                        "fetch",
                        "-q",
                        "--depth",
                        "1",
                        self.repository.as_str(),
                        commit,
                    ]),
                    shell_words::join(["git", "-C", ws, "checkout", "-q", "--detach", "FETCH_HEAD"]),
                    shell_words::join([
                        "git",
                        "-C",
                        ws,
                        "submodule",
                        "update",
                        "-q",
                        "--init",
                        "--recursive",
                        "--depth",
                        "1",
                    ]),
                ]
                .join(" && ");
                shell_words::join(["sh", "-c", script.as_str()])
            }
            None => {
                let mut argv = vec![
                    "git",
                    "clone",
                    "-q",
                    "--recurse-submodules",
                    "--depth",
                    "1",
                    "--single-branch",
                    "--shallow-submodules",
                ];
                if let Some(reference) = self.commit_reference.as_deref() {
                    argv.extend(["--branch", reference]);
                }
                argv.extend(["--", self.repository.as_str(), &*workspace]);
                shell_words::join(argv)
            }
        };

        Step::new(command).with_name("checkout")
    }

    fn validate_steps(stage: StageName, steps: &[Step]) -> Result<(), ValidationError> {
        for (index, step) in steps.iter().enumerate() {
            let words = shell_words::split(&step.command).map_err(|e| {
                ValidationError::InvalidCommand {
                    stage: stage.to_string(),
                    index,
                    reason: e.to_string(),
                }
            })?;
            if words.is_empty() {
                return Err(ValidationError::EmptyCommand {
                    stage: stage.to_string(),
                    index,
                });
            }
            if step
                .working_directory
                .as_deref()
                .is_some_and(Path::is_absolute)
            {
                return Err(ValidationError::AbsoluteWorkingDirectory {
                    stage: stage.to_string(),
                    index,
                });
            }
        }
        Ok(())
    }
}

fn is_commit_hash(reference: &str) -> bool {
    (7..=64).contains(&reference.len()) && reference.bytes().all(|b| b.is_ascii_hexdigit())
}

impl Validate for BuildSpec {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        if self.title == "."
            || self.title == ".."
            || self.title.contains(['/', '\\', '\0'])
        {
            return Err(ValidationError::InvalidTitle {
                title: self.title.clone(),
            });
        }
        if self.repository.trim().is_empty() {
            return Err(ValidationError::EmptyRepository);
        }
        Self::validate_steps(StageName::Build, &self.build_steps)?;
        Self::validate_steps(StageName::Test, &self.test_steps)
    }
}
