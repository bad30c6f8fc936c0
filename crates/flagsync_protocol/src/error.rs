//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding streaming wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The access token is structurally invalid or carries unusable claims.
    #[error("invalid access token: {message}")]
    InvalidToken {
        /// Description of what was wrong with the token.
        message: String,
    },

    /// A JSON payload could not be decoded.
    #[error("malformed json in {context}: {message}")]
    MalformedJson {
        /// Which payload was being decoded.
        context: &'static str,
        /// Decoder error message.
        message: String,
    },

    /// The message block has no `data` field.
    #[error("message block has no data field")]
    MissingData,

    /// A notification type the engine does not understand.
    #[error("unknown notification type: {0}")]
    UnknownType(String),

    /// A notification arrived on a channel that cannot be routed.
    #[error("unroutable channel: {0}")]
    UnroutableChannel(String),

    /// A required field is missing from a notification.
    #[error("notification {kind} is missing field {field}")]
    MissingField {
        /// Notification kind.
        kind: &'static str,
        /// Missing field name.
        field: &'static str,
    },
}

impl ProtocolError {
    /// Creates an invalid token error.
    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::InvalidToken {
            message: message.into(),
        }
    }

    /// Creates a malformed json error.
    pub fn malformed_json(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::MalformedJson {
            context,
            message: err.to_string(),
        }
    }
}
