//! # flagsync protocol
//!
//! Streaming wire formats for the flagsync engine.
//!
//! This crate provides:
//! - An incremental event-stream (server-sent events) block parser
//! - Access token (JWT) decoding with occupancy channel rewriting
//! - Streaming message decoding into typed notifications
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod event_stream;
mod message;
mod token;

pub use error::{ProtocolError, ProtocolResult};
pub use event_stream::{
    parse_blocks, EventFields, EventStreamParser, StreamBlock, DATA_FIELD, ERROR_EVENT,
    EVENT_FIELD, ID_FIELD,
};
pub use message::{
    parse_message, parse_notification, ChannelKind, ControlKind, Notification,
    NotificationKind, StreamingError, StreamingMessage, CONTROL_CHANNEL_PREFIX,
    FLAGS_CHANNEL_SUFFIX, OCCUPANCY_EVENT_NAME, SEGMENTS_CHANNEL_SUFFIX,
};
pub use token::{
    strip_occupancy_prefix, AccessToken, OCCUPANCY_CHANNEL_PREFIX, PUBLISHERS_CHANNEL_METADATA,
};

/// Streaming protocol version sent with every connection.
pub const STREAMING_PROTOCOL_VERSION: &str = "1.1";
