//! Error types for routegate
//!
//! Rate-limit and circuit-breaker rejections are ordinary return values, not
//! errors. Corrupt state files are recovered locally and never surface here.

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read config file {path}: {source}")]
    ConfigFileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ConfigParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration in {path}: {reason}")]
    ConfigValidationFailed { path: String, reason: String },

    #[error("State file I/O failed for {path}: {source}")]
    StateIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode state for {path}: {source}")]
    StateEncode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "All fallbacks exhausted after trying [{}]: last error: {last_error}",
        attempted.join(", ")
    )]
    FallbackExhausted {
        attempted: Vec<String>,
        last_error: String,
    },

    #[error("No backend available: {0}")]
    NoBackendAvailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Wrap an I/O error with the state file path it happened on
    pub fn state_io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::StateIo {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Convenience type alias for Results
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_creates() {
        let err = AppError::Config("test error".to_string());
        assert_eq!(err.to_string(), "Configuration error: test error");
    }

    #[test]
    fn test_internal_error_creates() {
        let err = AppError::Internal("unexpected state".to_string());
        assert_eq!(err.to_string(), "Internal error: unexpected state");
    }

    #[test]
    fn test_fallback_exhausted_names_attempts_and_last_error() {
        let err = AppError::FallbackExhausted {
            attempted: vec!["claude-sonnet".to_string(), "gemini-pro".to_string()],
            last_error: "HTTP 529 overloaded".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "All fallbacks exhausted after trying [claude-sonnet, gemini-pro]: \
            last error: HTTP 529 overloaded"
        );
    }

    #[test]
    fn test_state_io_error_includes_path() {
        let err = AppError::state_io(
            std::path::Path::new("/tmp/state/circuit_breakers.json"),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/state/circuit_breakers.json"));
        assert!(msg.contains("denied"));
    }
}
