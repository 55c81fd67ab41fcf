//! Logging configuration
//!
//! Initializes tracing for the daemon and the one-shot commands.

use tracing_subscriber::util::TryInitError;

/// Initializes logging with the specified level
///
/// `RUST_LOG` takes precedence over `level` when set. Worker threads are
/// named, so thread names are included alongside ids.
///
/// # Errors
///
/// Returns an error when a global subscriber is already installed.
pub fn init_logging(level: &str) -> Result<(), TryInitError> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_line_number(true)
                .with_writer(std::io::stderr),
        )
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice_reports_error() {
        // The first call may lose the race against another test's subscriber.
        let _ = init_logging("debug");
        assert!(init_logging("debug").is_err());
    }
}
