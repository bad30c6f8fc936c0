//! Error types for the sync engine.

use flagsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server answered with a non-success status.
    #[error("http status {status} from {endpoint}")]
    HttpStatus {
        /// Endpoint that was called.
        endpoint: String,
        /// Response status.
        status: u16,
    },

    /// The server answered with a body that could not be decoded.
    #[error("malformed response from {endpoint}: {message}")]
    MalformedResponse {
        /// Endpoint that was called.
        endpoint: String,
        /// Decoder error message.
        message: String,
    },

    /// Streaming wire data could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Local storage rejected an update.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The server has not caught up with a notified change number.
    #[error("flags at change number {reached}, notification announced {target}")]
    BehindNotification {
        /// Change number the notification announced.
        target: i64,
        /// Change number the fetch reached.
        reached: i64,
    },

    /// The engine was stopped.
    #[error("sync manager is stopped")]
    Stopped,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a status error for an endpoint.
    pub fn http_status(endpoint: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            endpoint: endpoint.into(),
            status,
        }
    }

    /// Creates a malformed response error for an endpoint.
    pub fn malformed(endpoint: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::MalformedResponse {
            endpoint: endpoint.into(),
            message: err.to_string(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::HttpStatus { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            SyncError::BehindNotification { .. } => true,
            _ => false,
        }
    }

    /// Returns true if the server rejected the client's credentials.
    pub fn is_credentials_error(&self) -> bool {
        matches!(
            self,
            SyncError::HttpStatus {
                status: 401 | 403,
                ..
            }
        )
    }
}
