//! Logging setup shared by the CacheKit binaries and test harnesses.

use tracing_subscriber::EnvFilter;

use crate::{CacheKitError, Result};

/// Output format for the global subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Text,
    /// One event per line.
    Compact,
    /// Structured JSON, one object per line.
    Json,
}

/// How the global subscriber is built.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Filter directives such as `cachekit_engine=debug`. When unset,
    /// `RUST_LOG` applies, then `info`.
    pub filter: Option<String>,
    pub format: LogFormat,
    /// Route output through the test writer so `cargo test` captures it
    /// per test.
    pub test_writer: bool,
    /// Include the file and line of the event call site.
    pub include_location: bool,
}

impl LogConfig {
    /// Configuration for test harnesses: compact, captured, `RUST_LOG`
    /// honored.
    pub fn for_tests() -> Self {
        Self {
            format: LogFormat::Compact,
            test_writer: true,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Install the global subscriber. Fails when one is already installed;
/// callers that merely want logging available may ignore the error.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = match &config.filter {
        Some(directives) => {
            EnvFilter::try_new(directives).map_err(|e| CacheKitError::Logging(e.to_string()))?
        }
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    let installed = match (config.format, config.test_writer) {
        (LogFormat::Text, false) => builder.try_init(),
        (LogFormat::Text, true) => builder.with_test_writer().try_init(),
        (LogFormat::Compact, false) => builder.compact().try_init(),
        (LogFormat::Compact, true) => builder.compact().with_test_writer().try_init(),
        (LogFormat::Json, false) => builder.json().try_init(),
        (LogFormat::Json, true) => builder.json().with_test_writer().try_init(),
    };
    installed.map_err(|e| CacheKitError::Logging(e.to_string()))
}
