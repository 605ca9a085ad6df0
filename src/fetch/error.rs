//! Fetch failure taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Failure returned by a page fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("client error (status {status}): {message}")]
    Client { status: u16, message: String },

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("fetch cancelled")]
    Cancelled,
}

/// Coarse classification used for retry decisions and UI reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Worth retrying: network, timeout, 5xx.
    Transient,
    /// Retrying cannot help: 4xx, malformed request.
    Fatal,
    Cancelled,
}

impl FetchError {
    /// Classify an HTTP-style status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            // Throttling and request timeouts clear up on their own.
            408 | 429 => FetchError::Server { status, message },
            400..=499 => FetchError::Client { status, message },
            _ => FetchError::Server { status, message },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Network(_) | FetchError::Server { .. } | FetchError::Timeout(_) => {
                ErrorKind::Transient
            }
            FetchError::Client { .. } | FetchError::Malformed(_) => ErrorKind::Fatal,
            FetchError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Terminal error recorded in a feed's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// Total fetch attempts made, including the first.
    pub attempts: u32,
}

impl ErrorInfo {
    pub fn new(error: &FetchError, attempts: u32) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(FetchError::from_status(503, "unavailable").kind(), ErrorKind::Transient);
        assert_eq!(FetchError::from_status(404, "missing").kind(), ErrorKind::Fatal);
        assert_eq!(FetchError::from_status(429, "slow down").kind(), ErrorKind::Transient);
        assert!(FetchError::Network("reset".into()).is_transient());
        assert!(!FetchError::Malformed("bad sort".into()).is_transient());
        assert!(!FetchError::Cancelled.is_transient());
    }
}
