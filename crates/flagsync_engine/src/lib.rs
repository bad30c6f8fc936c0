//! # flagsync engine
//!
//! Hybrid polling and streaming synchronization of feature-flag
//! snapshots.
//!
//! This crate provides:
//! - Flag and segment synchronizers with monotonic change numbers
//! - A periodic polling fallback
//! - A streaming connection over a line-oriented HTTP body
//! - A push notification manager with keep-alive, token refresh and
//!   occupancy tracking
//! - Ordered update workers fed by typed notification queues
//! - A sync manager choosing between polling and streaming
//!
//! ## Architecture
//!
//! The engine converges through polling and uses streaming as a latency
//! optimization:
//! 1. Load the stored snapshot and run one polling pass
//! 2. Authenticate and open the event stream
//! 3. Stop polling while the stream is healthy, route notifications to
//!    the update workers
//! 4. Fall back to polling whenever the stream fails
//!
//! ## Key Invariants
//!
//! - A change number never moves backwards
//! - A notification not newer than the local snapshot triggers no fetch
//! - Each queue is applied in arrival order
//! - Streaming failures never surface outside the feedback channel

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod backoff;
mod config;
mod error;
mod events;
mod http;
mod manager;
mod polling;
mod processor;
mod push;
mod sse;
mod state;
mod storage;
mod synchronizer;
mod timer;
mod transport;
mod workers;

pub use auth::{AuthResult, SseAuthenticator};
pub use backoff::BackoffCounter;
pub use config::{
    RetryConfig, SyncConfig, DEFAULT_AUTH_URL, DEFAULT_BACKGROUND_DISCONNECT_DELAY,
    DEFAULT_BACKOFF_CAP, DEFAULT_KEEP_ALIVE_TIMEOUT, DEFAULT_POLLING_INTERVAL,
    DEFAULT_READY_TIMEOUT, DEFAULT_RECONNECT_BACKOFF_BASE, DEFAULT_SDK_URL,
    DEFAULT_STREAMING_URL, DEFAULT_TOKEN_REFRESH_MARGIN,
};
pub use error::{SyncError, SyncResult};
pub use events::{EventsManager, InternalEvent, SdkEvent};
pub use http::{
    is_credentials_status, is_success_status, HttpClient, HttpFetchers, HttpRequest,
    HttpResponse, HttpStreamResponse, LineStream, EVENT_STREAM_CONTENT_TYPE,
};
pub use manager::{NoopFlusher, OutboundFlusher, SyncCollaborators, SyncManager};
pub use polling::PollingSynchronizer;
pub use processor::{
    flags_queue, segments_queue, Dispatch, FlagUpdate, FlagsQueue, FlagsQueueSender,
    NotificationProcessor, SegmentUpdate, SegmentsQueue, SegmentsQueueSender,
};
pub use push::{
    feedback_channel, FeedbackEvent, FeedbackReceiver, FeedbackSender, PushNotificationManager,
};
pub use sse::{
    streaming_url, SseClient, SseConnectionEvent, SseEvent, SseEventReceiver, SseEventSender,
};
pub use state::ConnectionState;
pub use storage::{
    GeneralInfo, MemoryStorage, SyncStorage, CHANGE_NUMBER_INFO, NO_CHANGE_NUMBER,
    SEGMENTS_CHANGE_NUMBER_INFO,
};
pub use synchronizer::{FlagsSynchronizer, SegmentsSynchronizer, SyncOutcome, MAX_FLAG_PAGES};
pub use timer::TimerHandle;
pub use transport::{
    AuthFetcher, AuthResponse, FlagChanges, FlagDefinition, FlagFetcher, FlagStatus, MockFetcher,
    SegmentFetcher, CONTROL_TREATMENT,
};
pub use workers::{FlagsUpdateWorker, SegmentsUpdateWorker};

pub use flagsync_protocol as protocol;
