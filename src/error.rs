//! Error types for the cache engine

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by caller-supplied loaders and warm-up suppliers
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur in the cache engine
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Caller-visible outcomes
    // =========================================================================
    /// The loader confirmed that the key has no value
    #[error("key not found: {key}")]
    NotFound { key: String },

    /// Every tier failed, the loader failed, or the breaker is open
    #[error("cache unavailable for key {key}: {source}")]
    Unavailable {
        key: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Causes carried inside `Unavailable`
    // =========================================================================
    /// Circuit breaker is failing fast
    #[error("circuit open for profile {profile}, retry in {retry_in:?}")]
    CircuitOpen { profile: String, retry_in: Duration },

    /// L2 / filter backend I/O failure
    #[error("backend error: {0}")]
    Backend(String),

    /// Value could not be encoded or decoded for the distributed tier
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Loader returned an error
    #[error("loader failed: {0}")]
    Loader(#[source] BoxError),

    /// Caller deadline elapsed
    #[error("operation timed out after {after:?}")]
    Timeout { after: Duration },

    // =========================================================================
    // Configuration
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Profile file could not be parsed
    #[error("Invalid profile file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Redis
    // =========================================================================
    /// Redis command error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error
    #[cfg(feature = "redis")]
    #[error("Redis pool error: {0}")]
    Pool(String),
}

impl Error {
    /// Wrap a cause as `Unavailable` for `key`
    pub fn unavailable(key: impl Into<String>, cause: Error) -> Self {
        Error::Unavailable {
            key: key.into(),
            source: Box::new(cause),
        }
    }

    /// Create a `NotFound` for `key`
    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }

    /// True when the loader confirmed absence
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for infrastructure, breaker, or loader failures
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::Unavailable { .. })
    }

    /// The underlying cause of an `Unavailable`
    pub fn cause(&self) -> Option<&Error> {
        match self {
            Error::Unavailable { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_wraps_cause() {
        let err = Error::unavailable("user:1", Error::Backend("connection reset".into()));
        assert!(err.is_unavailable());
        assert!(!err.is_not_found());
        assert!(matches!(err.cause(), Some(Error::Backend(_))));
        assert_eq!(
            err.to_string(),
            "cache unavailable for key user:1: backend error: connection reset"
        );
    }

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found("device:7");
        assert!(err.is_not_found());
        assert!(err.cause().is_none());
        assert_eq!(err.to_string(), "key not found: device:7");
    }
}
