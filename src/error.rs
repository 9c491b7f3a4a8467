//! Error types for the certificate proxy

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for the certificate proxy
pub type Result<T> = std::result::Result<T, Error>;

/// Certificate proxy errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller supplied an empty or missing control number
    #[error("Validation error: {0}")]
    Validation(String),

    /// Upstream fetch failed
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Outcome of a failed upstream fetch.
///
/// Cloneable so that a single failure can be handed to every caller
/// waiting on the same control number.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Upstream answered with an empty payload
    #[error("Certificate not found: {0}")]
    CertificateNotFound(String),

    /// Network failure, non-success status or undecodable body
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Upstream did not answer within the configured budget
    #[error("Upstream timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Admission queue is full
    #[error("Fetch queue full ({0} pending)")]
    Overloaded(usize),

    /// The fetch task ended without reporting a result
    #[error("Fetch aborted: {0}")]
    Aborted(String),
}

impl FetchError {
    /// Whether the failure originated from the upstream call itself
    #[must_use]
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            Self::CertificateNotFound(_) | Self::Upstream(_) | Self::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_converts_into_error() {
        let err: Error = FetchError::CertificateNotFound("ABC123".to_string()).into();
        assert!(matches!(
            err,
            Error::Fetch(FetchError::CertificateNotFound(ref key)) if key == "ABC123"
        ));
        assert_eq!(err.to_string(), "Certificate not found: ABC123");
    }

    #[test]
    fn test_upstream_failure_classification() {
        assert!(FetchError::Upstream("503".into()).is_upstream_failure());
        assert!(FetchError::Timeout(Duration::from_secs(5)).is_upstream_failure());
        assert!(!FetchError::Overloaded(10).is_upstream_failure());
        assert!(!FetchError::Aborted("panic".into()).is_upstream_failure());
    }

    #[test]
    fn test_timeout_message() {
        let err = FetchError::Timeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "Upstream timeout after 5000ms");
    }
}
