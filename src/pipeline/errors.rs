//! Error types for pipeline domain

use thiserror::Error;

/// Errors that can occur while loading a build specification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Validation failed with specified reason
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The specification document could not be decoded
    #[error("Failed to parse {format} build spec: {reason}")]
    Parse {
        /// Document format that was attempted (`json` or `yaml`).
        format: &'static str,
        /// Decoder error message.
        reason: String,
    },

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Validation errors for build specification components
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Title cannot be empty
    #[error("Title cannot be empty")]
    EmptyTitle,

    /// Title cannot be used as a single directory name
    #[error("Title '{title}' cannot be used as a directory name")]
    InvalidTitle {
        /// The rejected title.
        title: String,
    },

    /// Repository URL cannot be empty
    #[error("Repository cannot be empty")]
    EmptyRepository,

    /// A step has no command line
    #[error("Step {index} of stage '{stage}' has an empty command")]
    EmptyCommand {
        /// Stage owning the step.
        stage: String,
        /// Zero-based position of the step.
        index: usize,
    },

    /// A step's command line cannot be split into words
    #[error("Step {index} of stage '{stage}' has an invalid command: {reason}")]
    InvalidCommand {
        /// Stage owning the step.
        stage: String,
        /// Zero-based position of the step.
        index: usize,
        /// Word splitting error.
        reason: String,
    },

    /// A step's working directory escapes the workspace
    #[error("Step {index} of stage '{stage}' must use a relative working directory")]
    AbsoluteWorkingDirectory {
        /// Stage owning the step.
        stage: String,
        /// Zero-based position of the step.
        index: usize,
    },
}

/// Errors raised when a step cannot be launched at all
///
/// A process that starts and exits nonzero is not an error; it is recorded
/// in the step outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// The command line contains no words
    #[error("Command is empty")]
    EmptyCommand,

    /// The command line cannot be split into words
    #[error("Invalid command line '{command}': {reason}")]
    InvalidCommand {
        /// The rejected command line.
        command: String,
        /// Word splitting error.
        reason: String,
    },

    /// The process could not be spawned or waited on
    #[error("Failed to launch '{program}': {reason}")]
    Launch {
        /// Program that was being started.
        program: String,
        /// Operating system error message.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_converts_into_pipeline_error() {
        let err: PipelineError = ValidationError::EmptyTitle.into();
        assert_eq!(err.to_string(), "Validation failed: Title cannot be empty");
    }

    #[test]
    fn test_exec_error_display() {
        let err = ExecError::Launch {
            program: "does-not-exist".to_string(),
            reason: "No such file or directory".to_string(),
        };
        assert!(err.to_string().contains("does-not-exist"));
    }
}
