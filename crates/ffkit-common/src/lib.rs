//! # ffkit Common
//!
//! Error types, logging configuration and timeout helpers shared by the
//! ffkit offline agent crates.
//!
//! ## Features
//!
//! - Unified error type
//! - Logging configuration and setup
//! - Timeout wrapper for async operations
//! - Option extension trait

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod timeout;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use timeout::{with_optional_timeout, with_timeout};

/// Unified error type for ffkit.
#[derive(Error, Debug)]
pub enum KitError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),
}

impl KitError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Extension trait for Option.
pub trait OptionExt<T> {
    /// Convert None to a NotFound error.
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T, KitError>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T, KitError> {
        self.ok_or_else(|| KitError::NotFound(resource.into()))
    }
}
