//! Push notification manager.
//!
//! Drives authentication and the streaming connection, monitors liveness
//! and token expiry, and reports the health of the streaming pipeline to
//! its owner as [`FeedbackEvent`]s. It never retries on its own: after a
//! retryable failure it parks in [`ConnectionState::Retrying`] until the
//! owner calls [`PushNotificationManager::start`] again.
//!
//! All state lives behind one mutex. Connection events, auth results and
//! timers are tagged with a generation and ignored once superseded.

use crate::auth::{AuthResult, SseAuthenticator};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::http::HttpClient;
use crate::processor::{Dispatch, NotificationProcessor};
use crate::sse::{SseClient, SseConnectionEvent, SseEvent, SseEventReceiver};
use crate::state::ConnectionState;
use crate::timer::TimerHandle;
use crate::transport::AuthFetcher;
use flagsync_protocol::{
    strip_occupancy_prefix, AccessToken, ControlKind, Notification, NotificationKind,
    StreamingError,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Health signals sent to the owner of the push manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackEvent {
    /// Streaming delivers updates; polling can stop.
    PushSubsystemUp,
    /// Streaming is not delivering updates; poll instead.
    PushSubsystemDown,
    /// Streaming failed and may be restarted after a backoff.
    PushRetryableError,
    /// Streaming failed for the rest of the session.
    PushNonRetryableError,
}

/// Sender half of the feedback channel.
pub type FeedbackSender = mpsc::UnboundedSender<FeedbackEvent>;
/// Receiver half of the feedback channel.
pub type FeedbackReceiver = mpsc::UnboundedReceiver<FeedbackEvent>;

/// Creates the feedback channel.
pub fn feedback_channel() -> (FeedbackSender, FeedbackReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Default)]
struct PushCore {
    state: ConnectionState,
    started: bool,
    stopped: bool,
    paused: bool,
    attempt: u64,
    connection: Option<u64>,
    token: Option<AccessToken>,
    streaming_paused: bool,
    subsystem_up: bool,
    occupancy: HashMap<String, u32>,
    dispatcher: Option<JoinHandle<()>>,
    auth_task: Option<JoinHandle<()>>,
    keep_alive: Option<TimerHandle>,
    token_refresh: Option<TimerHandle>,
    refresh_at: Option<Instant>,
    background_disconnect: Option<TimerHandle>,
}

struct PushInner {
    keep_alive_timeout: Duration,
    token_refresh_margin: Duration,
    background_disconnect_delay: Duration,
    authenticator: SseAuthenticator,
    sse: SseClient,
    processor: NotificationProcessor,
    feedback: FeedbackSender,
    sse_events: Mutex<Option<SseEventReceiver>>,
    core: Mutex<PushCore>,
}

/// Owns the streaming pipeline.
pub struct PushNotificationManager {
    inner: Arc<PushInner>,
}

impl PushNotificationManager {
    /// Creates a stopped manager.
    pub fn new(
        config: &SyncConfig,
        auth: Arc<dyn AuthFetcher>,
        http: Arc<dyn HttpClient>,
        processor: NotificationProcessor,
        feedback: FeedbackSender,
    ) -> SyncResult<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sse = SseClient::new(&config.streaming_url, http, events_tx)?;
        Ok(Self {
            inner: Arc::new(PushInner {
                keep_alive_timeout: config.keep_alive_timeout,
                token_refresh_margin: config.token_refresh_margin,
                background_disconnect_delay: config.background_disconnect_delay,
                authenticator: SseAuthenticator::new(auth, config.user_key.clone()),
                sse,
                processor,
                feedback,
                sse_events: Mutex::new(Some(events_rx)),
                core: Mutex::new(PushCore::default()),
            }),
        })
    }

    /// Starts authentication unless already active, stopped or disabled.
    pub fn start(&self) {
        self.inner.start();
    }

    /// Schedules a delayed disconnect; streaming resumes on `resume()`.
    pub fn pause(&self) {
        self.inner.pause();
    }

    /// Cancels a pending background disconnect and reconnects if needed.
    pub fn resume(&self) {
        self.inner.resume();
    }

    /// Tears everything down. Idempotent; the manager cannot be restarted.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.core.lock().state
    }

    /// Returns true once `stop()` was called.
    pub fn is_stopped(&self) -> bool {
        self.inner.core.lock().stopped
    }
}

impl Drop for PushNotificationManager {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl PushInner {
    fn transition(&self, core: &mut PushCore, next: ConnectionState) -> bool {
        match core.state.transition_to(next) {
            Ok(next) => {
                tracing::debug!(from = ?core.state, to = ?next, "push state transition");
                core.state = next;
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "ignoring push state transition");
                false
            }
        }
    }

    fn emit(&self, event: FeedbackEvent) {
        tracing::debug!(?event, "push feedback");
        let _ = self.feedback.send(event);
    }

    fn start(self: &Arc<Self>) {
        let mut core = self.core.lock();
        if core.stopped {
            tracing::debug!("push manager stopped, start ignored");
            return;
        }
        core.started = true;
        self.ensure_dispatcher(&mut core);
        if core.paused {
            tracing::debug!("push manager paused, auth deferred to resume");
            return;
        }
        if !core.state.can_start() {
            tracing::debug!(state = ?core.state, "push manager busy, start ignored");
            return;
        }
        self.begin_auth(&mut core);
    }

    fn ensure_dispatcher(self: &Arc<Self>, core: &mut PushCore) {
        if core.dispatcher.is_some() {
            return;
        }
        let Some(mut events) = self.sse_events.lock().take() else {
            return;
        };
        let inner = self.clone();
        core.dispatcher = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                inner.on_sse_event(event);
            }
        }));
    }

    fn begin_auth(self: &Arc<Self>, core: &mut PushCore) {
        if !self.transition(core, ConnectionState::Authenticating) {
            return;
        }
        core.attempt += 1;
        let attempt = core.attempt;
        let inner = self.clone();
        let task = tokio::spawn(async move {
            let result = inner.authenticator.authenticate().await;
            inner.on_auth_result(attempt, result);
        });
        if let Some(previous) = core.auth_task.replace(task) {
            previous.abort();
        }
    }

    fn on_auth_result(self: &Arc<Self>, attempt: u64, result: AuthResult) {
        let mut core = self.core.lock();
        if attempt != core.attempt || core.state != ConnectionState::Authenticating {
            tracing::debug!(attempt, "discarding stale auth result");
            return;
        }

        match result {
            AuthResult::Success(token) => {
                if core.paused {
                    tracing::debug!("paused while authenticating, not connecting");
                    self.transition(&mut core, ConnectionState::Disconnected);
                    return;
                }
                if self.transition(&mut core, ConnectionState::Connecting) {
                    core.connection = Some(self.sse.connect(token.raw(), token.channels()));
                    core.token = Some(token);
                }
            }
            AuthResult::Disabled => {
                if self.transition(&mut core, ConnectionState::Disabled) {
                    self.emit(FeedbackEvent::PushSubsystemDown);
                }
            }
            AuthResult::NonRecoverableFailure => {
                if self.transition(&mut core, ConnectionState::Disabled) {
                    self.emit(FeedbackEvent::PushNonRetryableError);
                }
            }
            AuthResult::RecoverableFailure if core.paused => {
                tracing::debug!("auth failed while paused, retrying on resume");
                self.transition(&mut core, ConnectionState::Disconnected);
            }
            AuthResult::RecoverableFailure => {
                if self.transition(&mut core, ConnectionState::Retrying) {
                    self.emit(FeedbackEvent::PushRetryableError);
                }
            }
        }
    }

    fn on_sse_event(self: &Arc<Self>, event: SseConnectionEvent) {
        let mut core = self.core.lock();
        if core.connection != Some(event.generation) {
            tracing::trace!(generation = event.generation, "ignoring event from stale connection");
            return;
        }

        match event.event {
            SseEvent::Open => self.on_open(&mut core),
            SseEvent::KeepAlive => self.arm_keep_alive(&mut core),
            SseEvent::Message(fields) => {
                self.arm_keep_alive(&mut core);
                match self.processor.dispatch(&fields) {
                    Dispatch::Control(notification) => self.on_control(&mut core, notification),
                    Dispatch::StreamingError(error) => self.on_streaming_error(&mut core, error),
                    Dispatch::Enqueued(_) | Dispatch::Dropped => {}
                }
            }
            SseEvent::Error { recoverable } => self.fail(&mut core, recoverable),
            SseEvent::Disconnected => {
                tracing::debug!(generation = event.generation, "stream closed locally");
            }
        }
    }

    fn on_open(self: &Arc<Self>, core: &mut PushCore) {
        if !self.transition(core, ConnectionState::Connected) {
            return;
        }
        core.occupancy.clear();
        core.streaming_paused = false;
        core.refresh_at = core
            .token
            .as_ref()
            .map(|token| Instant::now() + token.refresh_delay(self.token_refresh_margin));
        if core.paused {
            tracing::debug!("stream opened while paused, holding timers until resume");
            core.subsystem_up = false;
            return;
        }
        self.arm_keep_alive(core);
        self.arm_token_refresh(core);

        core.subsystem_up = true;
        self.emit(FeedbackEvent::PushSubsystemUp);
    }

    fn arm_token_refresh(self: &Arc<Self>, core: &mut PushCore) {
        let (Some(refresh_at), Some(generation)) = (core.refresh_at, core.connection) else {
            return;
        };
        let delay = refresh_at.saturating_duration_since(Instant::now());
        tracing::debug!(?delay, "token refresh scheduled");
        let inner = self.clone();
        core.token_refresh = Some(TimerHandle::schedule(delay, async move {
            inner.on_token_refresh(generation);
        }));
    }

    fn arm_keep_alive(self: &Arc<Self>, core: &mut PushCore) {
        if core.paused || core.state != ConnectionState::Connected {
            return;
        }
        let Some(generation) = core.connection else {
            return;
        };
        let inner = self.clone();
        core.keep_alive = Some(TimerHandle::schedule(self.keep_alive_timeout, async move {
            inner.on_keep_alive_timeout(generation);
        }));
    }

    fn on_keep_alive_timeout(&self, generation: u64) {
        let mut core = self.core.lock();
        if core.paused
            || core.connection != Some(generation)
            || core.state != ConnectionState::Connected
        {
            return;
        }
        tracing::warn!(timeout = ?self.keep_alive_timeout, "no streaming traffic, reconnecting");
        self.fail(&mut core, true);
    }

    fn on_token_refresh(self: &Arc<Self>, generation: u64) {
        let mut core = self.core.lock();
        if core.paused
            || core.connection != Some(generation)
            || core.state != ConnectionState::Connected
        {
            return;
        }
        tracing::info!("refreshing streaming token");
        self.close_connection(&mut core);
        self.begin_auth(&mut core);
    }

    fn on_control(&self, core: &mut PushCore, notification: Notification) {
        match notification.kind {
            NotificationKind::Control(ControlKind::StreamingPaused) => {
                tracing::info!("streaming paused by server");
                core.streaming_paused = true;
                self.update_availability(core);
            }
            NotificationKind::Control(ControlKind::StreamingResumed) => {
                tracing::info!("streaming resumed by server");
                core.streaming_paused = false;
                self.update_availability(core);
            }
            NotificationKind::Control(ControlKind::StreamingDisabled) => {
                tracing::warn!("streaming disabled by server");
                self.close_connection(core);
                if self.transition(core, ConnectionState::Disabled) {
                    self.emit(FeedbackEvent::PushSubsystemDown);
                }
            }
            NotificationKind::Occupancy { publishers } => {
                let channel = strip_occupancy_prefix(&notification.channel).to_string();
                tracing::debug!(%channel, publishers, "occupancy");
                core.occupancy.insert(channel, publishers);
                self.update_availability(core);
            }
            other => {
                tracing::warn!(kind = other.name(), "unexpected notification on control path");
            }
        }
    }

    fn update_availability(&self, core: &mut PushCore) {
        if core.paused || core.state != ConnectionState::Connected {
            return;
        }
        let publishers_present =
            core.occupancy.is_empty() || core.occupancy.values().any(|p| *p > 0);
        let available = publishers_present && !core.streaming_paused;
        if available != core.subsystem_up {
            core.subsystem_up = available;
            self.emit(if available {
                FeedbackEvent::PushSubsystemUp
            } else {
                FeedbackEvent::PushSubsystemDown
            });
        }
    }

    fn on_streaming_error(&self, core: &mut PushCore, error: StreamingError) {
        tracing::warn!(
            code = error.code,
            status = error.status_code,
            message = %error.message,
            "streaming error event"
        );
        self.fail(core, error.is_retryable());
    }

    fn fail(&self, core: &mut PushCore, recoverable: bool) {
        self.close_connection(core);
        if core.paused {
            tracing::debug!(recoverable, "stream lost while paused");
            if core.state != ConnectionState::Disabled {
                self.transition(core, ConnectionState::Disconnected);
            }
            return;
        }
        let (next, event) = if recoverable {
            (ConnectionState::Retrying, FeedbackEvent::PushRetryableError)
        } else {
            (ConnectionState::Disabled, FeedbackEvent::PushNonRetryableError)
        };
        if self.transition(core, next) {
            self.emit(event);
        }
    }

    fn close_connection(&self, core: &mut PushCore) {
        core.keep_alive = None;
        core.token_refresh = None;
        core.refresh_at = None;
        core.subsystem_up = false;
        if core.connection.take().is_some() {
            self.sse.disconnect();
        }
    }

    fn pause(self: &Arc<Self>) {
        let mut core = self.core.lock();
        if core.stopped || core.paused {
            return;
        }
        core.paused = true;
        core.keep_alive = None;
        core.token_refresh = None;
        if self.background_disconnect_delay.is_zero() {
            self.background_disconnect(&mut core);
            return;
        }
        let inner = self.clone();
        core.background_disconnect = Some(TimerHandle::schedule(
            self.background_disconnect_delay,
            async move {
                inner.on_background_disconnect();
            },
        ));
    }

    fn on_background_disconnect(&self) {
        let mut core = self.core.lock();
        if core.paused && !core.stopped {
            self.background_disconnect(&mut core);
        }
    }

    fn background_disconnect(&self, core: &mut PushCore) {
        tracing::info!("disconnecting stream while paused");
        core.background_disconnect = None;
        core.attempt += 1;
        if let Some(task) = core.auth_task.take() {
            task.abort();
        }
        self.close_connection(core);
        if !matches!(
            core.state,
            ConnectionState::Disabled | ConnectionState::Disconnected
        ) {
            self.transition(core, ConnectionState::Disconnected);
        }
    }

    fn resume(self: &Arc<Self>) {
        let mut core = self.core.lock();
        if !core.paused {
            return;
        }
        core.paused = false;
        core.background_disconnect = None;
        if core.stopped || !core.started {
            return;
        }
        if core.state == ConnectionState::Connected {
            self.arm_keep_alive(&mut core);
            self.arm_token_refresh(&mut core);
            self.update_availability(&mut core);
        } else if core.state.can_start() {
            self.begin_auth(&mut core);
        }
    }

    fn stop(&self) {
        let mut core = self.core.lock();
        if core.stopped {
            return;
        }
        core.stopped = true;
        core.attempt += 1;
        core.background_disconnect = None;
        if let Some(task) = core.auth_task.take() {
            task.abort();
        }
        self.close_connection(&mut core);
        if !matches!(
            core.state,
            ConnectionState::Disabled | ConnectionState::Disconnected
        ) {
            self.transition(&mut core, ConnectionState::Disconnected);
        }
        if let Some(dispatcher) = core.dispatcher.take() {
            dispatcher.abort();
        }
        tracing::info!("push manager stopped");
    }
}
