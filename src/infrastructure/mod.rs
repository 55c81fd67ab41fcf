//! Infrastructure layer
//!
//! Configuration, logging and the git-backed result store.

mod config;
mod git;
mod lock;
mod logging;
mod results;

pub use config::{Config, ConfigError, ResultsConfig};
pub use git::GitRepo;
pub use lock::SentinelLock;
pub use logging::init_logging;
pub use results::{
    BUILD_BADGE_FILE, LOG_FILE, ResultLinks, ResultPublisher, ResultStore, StoreError,
    TEST_BADGE_FILE, TESTS_FILE,
};
