//! Streaming messages and notifications.
//!
//! A message block's `data` field carries an envelope whose own `data`
//! member is a JSON document encoded as a string. Decoding happens once
//! here; everything downstream matches on [`NotificationKind`].

use crate::error::{ProtocolError, ProtocolResult};
use crate::event_stream::EventFields;
use crate::token::strip_occupancy_prefix;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// Envelope `name` used for occupancy events.
pub const OCCUPANCY_EVENT_NAME: &str = "[meta]occupancy";
/// Suffix of the global flags channel.
pub const FLAGS_CHANNEL_SUFFIX: &str = "_splits";
/// Suffix of per-key segment channels.
pub const SEGMENTS_CHANNEL_SUFFIX: &str = "_mySegments";
/// Prefix of control channels.
pub const CONTROL_CHANNEL_PREFIX: &str = "control_";

/// Which consumer a channel feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Global flag definitions.
    Flags,
    /// Per-key segment membership.
    Segments,
    /// Control and occupancy.
    Control,
}

impl ChannelKind {
    /// Classifies a channel name, ignoring the occupancy prefix.
    pub fn of(channel: &str) -> Option<Self> {
        let name = strip_occupancy_prefix(channel);
        if name.ends_with(FLAGS_CHANNEL_SUFFIX) {
            Some(ChannelKind::Flags)
        } else if name.ends_with(SEGMENTS_CHANNEL_SUFFIX) {
            Some(ChannelKind::Segments)
        } else if name.starts_with(CONTROL_CHANNEL_PREFIX) {
            Some(ChannelKind::Control)
        } else {
            None
        }
    }
}

/// Control message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Publishers stopped sending updates; fall back to polling.
    StreamingPaused,
    /// Publishers resumed sending updates.
    StreamingResumed,
    /// Streaming is turned off for this environment.
    StreamingDisabled,
}

impl ControlKind {
    fn parse(value: &str) -> ProtocolResult<Self> {
        match value {
            "STREAMING_PAUSED" => Ok(ControlKind::StreamingPaused),
            "STREAMING_RESUMED" | "STREAMING_ENABLED" => Ok(ControlKind::StreamingResumed),
            "STREAMING_DISABLED" => Ok(ControlKind::StreamingDisabled),
            other => Err(ProtocolError::UnknownType(format!("CONTROL/{other}"))),
        }
    }
}

/// Decoded notification payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    /// Flag definitions changed up to `change_number`.
    FlagsChanged {
        /// New change number.
        change_number: i64,
    },
    /// A flag was killed; evaluations should return its default treatment.
    FlagKilled {
        /// Change number of the kill.
        change_number: i64,
        /// Killed flag.
        flag_name: String,
        /// Treatment to serve while killed.
        default_treatment: String,
    },
    /// Segment membership for the channel's key changed.
    SegmentsChanged {
        /// Segment that changed, when the server names it.
        segment_name: Option<String>,
        /// Change number, when the server sends one.
        change_number: Option<i64>,
        /// Full membership list, when the payload is inlined.
        segments: Option<Vec<String>>,
    },
    /// Control message.
    Control(ControlKind),
    /// Publisher presence on a control channel.
    Occupancy {
        /// Number of active publishers.
        publishers: u32,
    },
}

impl NotificationKind {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            NotificationKind::FlagsChanged { .. } => "FLAGS_CHANGED",
            NotificationKind::FlagKilled { .. } => "FLAG_KILLED",
            NotificationKind::SegmentsChanged { .. } => "SEGMENTS_CHANGED",
            NotificationKind::Control(_) => "CONTROL",
            NotificationKind::Occupancy { .. } => "OCCUPANCY",
        }
    }

    fn expected_channel(&self) -> ChannelKind {
        match self {
            NotificationKind::FlagsChanged { .. } | NotificationKind::FlagKilled { .. } => {
                ChannelKind::Flags
            }
            NotificationKind::SegmentsChanged { .. } => ChannelKind::Segments,
            NotificationKind::Control(_) | NotificationKind::Occupancy { .. } => {
                ChannelKind::Control
            }
        }
    }
}

/// A notification together with the channel it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Channel the message was published on.
    pub channel: String,
    /// Server timestamp in milliseconds, if present.
    pub timestamp: Option<i64>,
    /// Decoded payload.
    pub kind: NotificationKind,
}

impl Notification {
    /// The consumer this notification is routed to.
    pub fn route(&self) -> ChannelKind {
        self.kind.expected_channel()
    }
}

/// An error event sent by the streaming service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingError {
    /// Service error code.
    #[serde(default)]
    pub code: u32,
    /// HTTP-like status code.
    #[serde(default)]
    pub status_code: u16,
    /// Human readable message.
    #[serde(default)]
    pub message: String,
}

impl StreamingError {
    /// Token expiry and server-side errors can be recovered by reconnecting.
    pub fn is_retryable(&self) -> bool {
        (40140..=40149).contains(&self.code) || (50000..60000).contains(&self.code)
    }
}

/// Any decoded message block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamingMessage {
    /// A routable notification.
    Notification(Notification),
    /// A streaming service error.
    Error(StreamingError),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    channel: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlagUpdatePayload {
    change_number: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlagKillPayload {
    change_number: i64,
    split_name: String,
    default_treatment: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentsPayload {
    #[serde(default)]
    change_number: Option<i64>,
    #[serde(default)]
    includes_payload: bool,
    #[serde(default)]
    segment_list: Option<Vec<String>>,
    #[serde(default)]
    segment_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControlPayload {
    control_type: String,
}

#[derive(Debug, Deserialize)]
struct OccupancyMetrics {
    publishers: u32,
}

#[derive(Debug, Deserialize)]
struct OccupancyPayload {
    metrics: OccupancyMetrics,
}

/// Decodes a message block into a [`StreamingMessage`].
pub fn parse_message(fields: &EventFields) -> ProtocolResult<StreamingMessage> {
    let data = fields.data().ok_or(ProtocolError::MissingData)?;

    if fields.is_error_event() {
        let error: StreamingError = serde_json::from_str(data)
            .map_err(|e| ProtocolError::malformed_json("error event", e))?;
        return Ok(StreamingMessage::Error(error));
    }

    parse_notification(data).map(StreamingMessage::Notification)
}

/// Decodes the envelope carried in a `data` field into a [`Notification`].
pub fn parse_notification(data: &str) -> ProtocolResult<Notification> {
    let envelope: Envelope =
        serde_json::from_str(data).map_err(|e| ProtocolError::malformed_json("envelope", e))?;

    let kind = if envelope.name.as_deref() == Some(OCCUPANCY_EVENT_NAME) {
        let payload: OccupancyPayload = serde_json::from_str(&envelope.data)
            .map_err(|e| ProtocolError::malformed_json("occupancy", e))?;
        NotificationKind::Occupancy {
            publishers: payload.metrics.publishers,
        }
    } else {
        parse_kind(&envelope.data)?
    };

    let channel_kind = ChannelKind::of(&envelope.channel)
        .ok_or_else(|| ProtocolError::UnroutableChannel(envelope.channel.clone()))?;
    if channel_kind != kind.expected_channel() {
        return Err(ProtocolError::UnroutableChannel(format!(
            "{} on {}",
            kind.name(),
            envelope.channel
        )));
    }

    Ok(Notification {
        channel: envelope.channel,
        timestamp: envelope.timestamp,
        kind,
    })
}

fn parse_kind(payload: &str) -> ProtocolResult<NotificationKind> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| ProtocolError::malformed_json("notification", e))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField {
            kind: "notification",
            field: "type",
        })?
        .to_string();

    match kind.as_str() {
        "SPLIT_UPDATE" => {
            let p: FlagUpdatePayload = decode(value, "SPLIT_UPDATE")?;
            Ok(NotificationKind::FlagsChanged {
                change_number: p.change_number,
            })
        }
        "SPLIT_KILL" => {
            let p: FlagKillPayload = decode(value, "SPLIT_KILL")?;
            Ok(NotificationKind::FlagKilled {
                change_number: p.change_number,
                flag_name: p.split_name,
                default_treatment: p.default_treatment,
            })
        }
        "MY_SEGMENTS_UPDATE" => {
            let p: SegmentsPayload = decode(value, "MY_SEGMENTS_UPDATE")?;
            let segments = if p.includes_payload {
                Some(p.segment_list.unwrap_or_default())
            } else {
                None
            };
            Ok(NotificationKind::SegmentsChanged {
                segment_name: p.segment_name,
                change_number: p.change_number,
                segments,
            })
        }
        "CONTROL" => {
            let p: ControlPayload = decode(value, "CONTROL")?;
            ControlKind::parse(&p.control_type).map(NotificationKind::Control)
        }
        _ => Err(ProtocolError::UnknownType(kind)),
    }
}

fn decode<T: DeserializeOwned>(value: Value, context: &'static str) -> ProtocolResult<T> {
    serde_json::from_value(value).map_err(|e| ProtocolError::malformed_json(context, e))
}
