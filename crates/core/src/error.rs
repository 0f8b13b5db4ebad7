//! Core error types

use thiserror::Error;

/// Core error type for Nightwatch
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration could not be parsed or failed validation
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
