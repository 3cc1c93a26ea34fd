//! Error taxonomy for socket client operations

use std::time::Duration;
use thiserror::Error;

/// Main error type surfaced by socket client operations
#[derive(Error, Debug)]
pub enum SocketError {
    // === Caller mistakes ===
    /// Operation attempted on a disposed or otherwise unusable client
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Authenticated request issued while no credentials are configured
    #[error("No credentials configured for authenticated request")]
    NoCredentials,

    // === Connection failures ===
    /// The transport never opened
    #[error("Failed to connect to {url}: {reason}")]
    CantConnect { url: String, reason: String },

    /// The transport dropped while an operation was in flight
    #[error("Connection lost")]
    ConnectionLost,

    /// The caller cancelled, or a request/response exchange timed out
    #[error("Operation cancelled")]
    CancellationRequested,

    // === Server-signaled failures ===
    /// The server rejected a request or reported a fault
    #[error("Server error: {0}")]
    ServerError(String),

    /// Authentication handshake failed; the connection is closed on this
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    // === Data failures ===
    /// A frame or payload could not be deserialized into the expected shape
    #[error("Deserialization failed: {reason}")]
    Deserialize { reason: String },

    /// An outbound payload could not be serialized
    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl SocketError {
    /// Wrap a lower-level connect failure
    pub fn cant_connect(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CantConnect {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Wrap an inner error as an authentication failure with a prefixed message
    pub fn auth_failed(inner: impl std::fmt::Display) -> Self {
        Self::AuthenticationFailed(format!("handshake rejected: {inner}"))
    }

    /// Create a deserialization error
    pub fn deserialize(reason: impl Into<String>) -> Self {
        Self::Deserialize {
            reason: reason.into(),
        }
    }

    /// Returns true when retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CantConnect { .. } | Self::ConnectionLost)
    }

    /// Returns true when the owning connection must be torn down
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::AuthenticationFailed(_))
    }

    /// Suggested delay before retrying, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CantConnect { .. } => Some(Duration::from_millis(500)),
            Self::ConnectionLost => Some(Duration::from_millis(100)),
            _ => None,
        }
    }
}

/// Result alias for socket client operations
pub type SocketResult<T> = Result<T, SocketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SocketError::cant_connect("wss://x", "refused").is_retryable());
        assert!(SocketError::ConnectionLost.is_retryable());
        assert!(!SocketError::NoCredentials.is_retryable());
        assert!(!SocketError::CancellationRequested.is_retryable());
    }

    #[test]
    fn auth_failure_closes_connection() {
        let err = SocketError::auth_failed("bad signature");
        assert!(err.requires_reconnect());
        assert!(err.to_string().contains("bad signature"));
    }

    #[test]
    fn retry_hints() {
        assert!(SocketError::ConnectionLost.retry_after().is_some());
        assert!(SocketError::ServerError("down".into()).retry_after().is_none());
    }
}
