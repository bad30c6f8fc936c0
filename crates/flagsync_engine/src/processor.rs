//! Notification routing.
//!
//! Decodes message blocks and hands data notifications to the update
//! queues. Control, occupancy and streaming errors are returned to the
//! caller, which owns the connection state.

use flagsync_protocol::{
    parse_message, ChannelKind, EventFields, Notification, NotificationKind, StreamingError,
    StreamingMessage,
};
use tokio::sync::mpsc;

/// Work item for the flags worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagUpdate {
    /// Fetch flags up to `change_number`.
    Changed {
        /// Target change number.
        change_number: i64,
    },
    /// Kill a flag locally, then fetch up to `change_number`.
    Killed {
        /// Change number of the kill.
        change_number: i64,
        /// Killed flag.
        flag_name: String,
        /// Treatment to serve while killed.
        default_treatment: String,
    },
}

impl FlagUpdate {
    /// Target change number.
    pub fn change_number(&self) -> i64 {
        match self {
            FlagUpdate::Changed { change_number } | FlagUpdate::Killed { change_number, .. } => {
                *change_number
            }
        }
    }
}

/// Work item for the segments worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentUpdate {
    /// Change number, when the server sent one.
    pub change_number: Option<i64>,
    /// Changed segment, when the server named it.
    pub segment_name: Option<String>,
    /// Inline membership list; fetched when absent.
    pub segments: Option<Vec<String>>,
}

/// Sender half of the flags queue.
pub type FlagsQueueSender = mpsc::UnboundedSender<FlagUpdate>;
/// Receiver half of the flags queue.
pub type FlagsQueue = mpsc::UnboundedReceiver<FlagUpdate>;
/// Sender half of the segments queue.
pub type SegmentsQueueSender = mpsc::UnboundedSender<SegmentUpdate>;
/// Receiver half of the segments queue.
pub type SegmentsQueue = mpsc::UnboundedReceiver<SegmentUpdate>;

/// Creates the flags queue.
pub fn flags_queue() -> (FlagsQueueSender, FlagsQueue) {
    mpsc::unbounded_channel()
}

/// Creates the segments queue.
pub fn segments_queue() -> (SegmentsQueueSender, SegmentsQueue) {
    mpsc::unbounded_channel()
}

/// What the processor did with a message block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Enqueued for the worker of this stream.
    Enqueued(ChannelKind),
    /// A control or occupancy notification for the connection owner.
    Control(Notification),
    /// An error event sent by the streaming service.
    StreamingError(StreamingError),
    /// Undecodable or unroutable; logged and discarded.
    Dropped,
}

/// Decodes message blocks and feeds the update queues.
#[derive(Debug, Clone)]
pub struct NotificationProcessor {
    flags: FlagsQueueSender,
    segments: SegmentsQueueSender,
}

impl NotificationProcessor {
    /// Creates a processor feeding the given queues.
    pub fn new(flags: FlagsQueueSender, segments: SegmentsQueueSender) -> Self {
        Self { flags, segments }
    }

    /// Decodes and routes one message block.
    pub fn dispatch(&self, fields: &EventFields) -> Dispatch {
        match parse_message(fields) {
            Ok(StreamingMessage::Notification(notification)) => self.process(notification),
            Ok(StreamingMessage::Error(error)) => Dispatch::StreamingError(error),
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable streaming message");
                Dispatch::Dropped
            }
        }
    }

    /// Routes a decoded notification.
    pub fn process(&self, notification: Notification) -> Dispatch {
        let route = notification.route();
        let Notification {
            channel,
            timestamp,
            kind,
        } = notification;
        let name = kind.name();

        let sent = match kind {
            NotificationKind::FlagsChanged { change_number } => self
                .flags
                .send(FlagUpdate::Changed { change_number })
                .is_ok(),
            NotificationKind::FlagKilled {
                change_number,
                flag_name,
                default_treatment,
            } => self
                .flags
                .send(FlagUpdate::Killed {
                    change_number,
                    flag_name,
                    default_treatment,
                })
                .is_ok(),
            NotificationKind::SegmentsChanged {
                segment_name,
                change_number,
                segments,
            } => self
                .segments
                .send(SegmentUpdate {
                    change_number,
                    segment_name,
                    segments,
                })
                .is_ok(),
            control @ (NotificationKind::Control(_) | NotificationKind::Occupancy { .. }) => {
                return Dispatch::Control(Notification {
                    channel,
                    timestamp,
                    kind: control,
                });
            }
        };

        if sent {
            tracing::debug!(kind = name, %channel, "notification enqueued");
            Dispatch::Enqueued(route)
        } else {
            tracing::warn!(kind = name, "update queue closed, dropping notification");
            Dispatch::Dropped
        }
    }
}
