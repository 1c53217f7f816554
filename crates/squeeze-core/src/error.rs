//! Error types for Squeeze

use std::time::Duration;

/// Result type alias using [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for Squeeze
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// HTTP-related errors
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// A tunable failed validation
    #[error("Invalid configuration for '{field}': {reason}")]
    InvalidConfig {
        /// Name of the offending field
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Background task did not acknowledge shutdown in time
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Middleware error
    #[error("Middleware error: {0}")]
    Middleware(String),

    /// Runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    HttpError(#[from] http::Error),

    /// Internal error (should not happen in production)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert error to HTTP status code
    pub fn to_status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Http(_) => StatusCode::BAD_REQUEST,
            Error::ShutdownTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            Error::Internal("boom".to_string()).to_status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::ShutdownTimeout(Duration::from_secs(1)).to_status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_invalid_config_names_field() {
        let err = Error::invalid_config("level", "must be between 1 and 9, got 0");
        assert!(matches!(err, Error::InvalidConfig { field: "level", .. }));
        assert!(err.to_string().contains("'level'"));
        assert!(err.to_string().contains("got 0"));
    }
}
