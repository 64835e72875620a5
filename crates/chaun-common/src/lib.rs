//! # Chaun Common
//!
//! Shared utilities for the Chaun offline cache worker.
//!
//! ## Features
//!
//! - Logging configuration and setup
//! - Retry and timeout utilities
//! - A small error type for the utilities above

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_when, retry_with_backoff, with_timeout, Backoff, RetryConfig};

/// Errors raised by the shared utilities.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Bad level, format or filter directive.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The global log subscriber could not be installed.
    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl CommonError {
    /// Timeouts may succeed on another attempt; bad input never will.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommonError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, CommonError>;
