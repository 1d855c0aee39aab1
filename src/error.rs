//! Error types for the Probeguard service.

use thiserror::Error;

/// Main error type for Probeguard operations.
///
/// Admission rejections are not errors and never show up here; they are
/// reported through [`crate::ratelimit::Admission`] and commit results.
#[derive(Error, Debug)]
pub enum ProbeGuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Limiter parameters out of range, before they are tied to a policy
    #[error("Invalid rate limiter parameters: {0}")]
    InvalidParams(String),

    /// A rate limit policy was configured with out-of-range parameters
    #[error("Invalid rate limit policy '{policy}': {reason}")]
    InvalidPolicy { policy: String, reason: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for ProbeGuardError {
    fn from(e: ::config::ConfigError) -> Self {
        ProbeGuardError::Config(e.to_string())
    }
}

/// Result type alias for Probeguard operations.
pub type Result<T> = std::result::Result<T, ProbeGuardError>;
