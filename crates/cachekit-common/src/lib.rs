//! # CacheKit Common
//!
//! Shared utilities for the CacheKit workspace: logging setup and the
//! retry/timeout helpers the transport layer runs its transfers through.

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Errors produced by the shared helpers.
#[derive(Error, Debug)]
pub enum CacheKitError {
    /// An operation ran past its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The global subscriber could not be installed, usually because one
    /// already is or a filter directive failed to parse.
    #[error("logging setup failed: {0}")]
    Logging(String),
}

/// Result type alias for the shared helpers.
pub type Result<T> = std::result::Result<T, CacheKitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_deadline() {
        let err = CacheKitError::Timeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30s"));
    }
}
