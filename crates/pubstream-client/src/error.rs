//! Error types for pubstream client operations

use thiserror::Error;

/// Result type alias for pubstream client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur while publishing or subscribing
#[derive(Error, Debug)]
pub enum ClientError {
    /// Credentials or TLS context could not be set up. Not retryable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection refused, reset or timed out
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Server refused to open a stream
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Broker answered a publish with a non-2xx status
    #[error("Publish rejected with status {status}: {body}")]
    PublishRejected { status: u16, body: String },

    /// Broker sent more than the frame limit without a delimiter
    #[error("Frame exceeds {limit} bytes without a delimiter ({size} buffered)")]
    FrameTooLarge { size: usize, limit: usize },

    /// Request could not be built from the given arguments
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Failed to serialize a request body
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Create a configuration error with the given message
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a server error from status code and message
    pub fn server_error(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    /// Whether a caller-side retry policy may reasonably try again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Server { status, .. } | Self::PublishRejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_is_not_retryable() {
        let err = ClientError::configuration("bad passphrase");
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Configuration error: bad passphrase");
    }

    #[test]
    fn test_server_errors_retry_only_on_5xx() {
        assert!(ClientError::server_error(503, "unavailable").is_retryable());
        assert!(!ClientError::server_error(404, "no such topic").is_retryable());
        assert!(!ClientError::PublishRejected {
            status: 401,
            body: String::new()
        }
        .is_retryable());
    }
}
