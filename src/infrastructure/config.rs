//! Configuration management
//!
//! The daemon reads an optional YAML file; every field has a default so an
//! empty (or absent) file yields a working local setup with publishing
//! disabled.

use crate::pipeline::steps::millis;
use crate::server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Errors loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read config {}: {source}", .path.display())]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The file is not valid YAML for this schema
    #[error("Failed to parse config {}: {reason}", .path.display())]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Decoder error message.
        reason: String,
    },

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the request server listens on
    pub listen: SocketAddr,
    /// Worker threads, i.e. concurrent runs
    pub max_workers: usize,
    /// Listen backlog
    pub accept_backlog: u32,
    /// Connections served at once; four per worker when unset
    pub max_connections: Option<usize>,
    /// Largest request a connection may buffer
    pub max_request_bytes: usize,
    /// How long `stop` waits for workers
    #[serde(with = "millis")]
    pub shutdown_grace: Duration,
    /// Directory holding per-run workspaces
    pub workspace_root: PathBuf,
    /// Build specification file
    pub build_spec: PathBuf,
    /// Log level used when `RUST_LOG` is unset
    pub log_level: String,
    /// Result publishing
    pub results: ResultsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5274)),
            max_workers: 5,
            accept_backlog: 128,
            max_connections: None,
            max_request_bytes: 64 * 1024,
            shutdown_grace: Duration::from_secs(3),
            workspace_root: std::env::temp_dir().join("cci-workspaces"),
            build_spec: PathBuf::from("build.json"),
            log_level: "info".to_string(),
            results: ResultsConfig::default(),
        }
    }
}

impl Config {
    /// Reads a YAML configuration file
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Parses YAML; an empty document yields the defaults
    ///
    /// # Errors
    ///
    /// Returns the YAML decoder error.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Checks value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.max_connections == Some(0) {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        if self.max_request_bytes == 0 {
            return Err(ConfigError::Invalid("max_request_bytes must be at least 1".into()));
        }
        self.results.validate()
    }

    /// Connection limit after applying the per-worker default
    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections
            .unwrap_or_else(|| self.max_workers.saturating_mul(4))
    }

    /// Settings for the request server
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            max_workers: self.max_workers,
            accept_backlog: self.accept_backlog,
            max_connections: self.max_connections(),
            max_request_bytes: self.max_request_bytes,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

/// Result store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    /// Local working copy of the results repository
    pub directory: PathBuf,
    /// Remote to clone and push; publishing is disabled when unset
    pub remote: Option<String>,
    /// Branch results are committed to
    pub branch: String,
    /// Sentinel lock file; `<directory>.lock` when unset
    pub lock_file: Option<PathBuf>,
    /// Save attempts before giving up
    pub max_attempts: u32,
    /// Pause between save attempts
    #[serde(with = "millis")]
    pub retry_delay: Duration,
    /// Timeout for clone, fetch, checkout, add and commit
    #[serde(with = "millis")]
    pub git_timeout: Duration,
    /// Timeout for push
    #[serde(with = "millis")]
    pub push_timeout: Duration,
    /// Public URL prefix for status links
    pub result_link_base: Option<String>,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("results"),
            remote: None,
            branch: "master".to_string(),
            lock_file: None,
            max_attempts: 3,
            retry_delay: Duration::from_secs(3),
            git_timeout: Duration::from_secs(10),
            push_timeout: Duration::from_secs(20),
            result_link_base: None,
        }
    }
}

impl ResultsConfig {
    /// Configured lock file, or a sibling of the working copy
    ///
    /// The sibling default keeps the lock outside the repository so it is
    /// never committed.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        if let Some(path) = &self.lock_file {
            return path.clone();
        }
        let mut name = self
            .directory
            .file_name()
            .map_or_else(|| "results".into(), ToOwned::to_owned);
        name.push(".lock");
        self.directory.with_file_name(name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("results.max_attempts must be at least 1".into()));
        }
        if self.branch.trim().is_empty() {
            return Err(ConfigError::Invalid("results.branch cannot be empty".into()));
        }
        if let Some(base) = &self.result_link_base {
            Url::parse(base).map_err(|e| {
                ConfigError::Invalid(format!("results.result_link_base '{base}': {e}"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.listen.port(), 5274);
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.max_connections(), 20);
        assert_eq!(config.results.max_attempts, 3);
        assert_eq!(config.results.retry_delay, Duration::from_secs(3));
        assert!(config.results.remote.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(Config::from_yaml("").unwrap(), Config::default());
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let yaml = "listen: 127.0.0.1:6000\nmax_workers: 2\nresults:\n  remote: git@example.com:results.git\n  retry_delay: 500\n";
        let config = Config::from_yaml(yaml).unwrap();

        assert_eq!(config.listen, "127.0.0.1:6000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.max_connections(), 8);
        assert_eq!(config.results.remote.as_deref(), Some("git@example.com:results.git"));
        assert_eq!(config.results.retry_delay, Duration::from_millis(500));
        assert_eq!(config.results.branch, "master");
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"max_workers: many\n").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/cci.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let mut config = Config {
            max_workers: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        config.max_workers = 1;
        config.results.max_attempts = 0;
        assert!(config.validate().is_err());

        config.results.max_attempts = 1;
        config.results.result_link_base = Some("not a url".into());
        assert!(config.validate().is_err());

        config.results.result_link_base = Some("https://example.com/results/".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lock_path_defaults_to_sibling() {
        let results = ResultsConfig {
            directory: PathBuf::from("/srv/cci/results"),
            ..ResultsConfig::default()
        };
        assert_eq!(results.lock_path(), PathBuf::from("/srv/cci/results.lock"));

        let results = ResultsConfig {
            lock_file: Some(PathBuf::from("/run/cci.lock")),
            ..ResultsConfig::default()
        };
        assert_eq!(results.lock_path(), PathBuf::from("/run/cci.lock"));
    }
}
