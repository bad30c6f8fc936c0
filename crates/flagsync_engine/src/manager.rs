//! Sync manager.
//!
//! Decides between polling and streaming. Polling runs until the push
//! manager reports the streaming pipeline up, and resumes whenever it
//! reports it down or failed. Reconnection after a retryable failure is
//! paced by one [`BackoffCounter`] owned here and reset on success.

use crate::backoff::BackoffCounter;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventsManager, InternalEvent};
use crate::http::{HttpClient, HttpFetchers};
use crate::polling::PollingSynchronizer;
use crate::processor::{flags_queue, segments_queue, FlagsQueue, NotificationProcessor, SegmentsQueue};
use crate::push::{feedback_channel, FeedbackEvent, FeedbackReceiver, PushNotificationManager};
use crate::state::ConnectionState;
use crate::storage::{SyncStorage, NO_CHANGE_NUMBER};
use crate::synchronizer::{FlagsSynchronizer, SegmentsSynchronizer};
use crate::timer::TimerHandle;
use crate::transport::{AuthFetcher, FlagFetcher, SegmentFetcher};
use crate::workers::{FlagsUpdateWorker, SegmentsUpdateWorker};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Flushes buffered outbound data such as impressions or telemetry.
#[async_trait]
pub trait OutboundFlusher: Send + Sync {
    /// Sends everything buffered so far.
    async fn flush(&self) -> SyncResult<()>;
}

/// A flusher with nothing to send.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFlusher;

#[async_trait]
impl OutboundFlusher for NoopFlusher {
    async fn flush(&self) -> SyncResult<()> {
        Ok(())
    }
}

/// Everything the manager talks to.
pub struct SyncCollaborators {
    /// Flags endpoint.
    pub flags: Arc<dyn FlagFetcher>,
    /// Segments endpoint.
    pub segments: Arc<dyn SegmentFetcher>,
    /// Streaming auth endpoint.
    pub auth: Arc<dyn AuthFetcher>,
    /// Client used to open the event stream.
    pub http: Arc<dyn HttpClient>,
    /// Local snapshot store.
    pub storage: Arc<dyn SyncStorage>,
    /// Outbound flusher.
    pub flusher: Arc<dyn OutboundFlusher>,
}

impl SyncCollaborators {
    /// Uses `http` for every endpoint and no outbound flusher.
    pub fn from_http(
        config: &SyncConfig,
        http: Arc<dyn HttpClient>,
        storage: Arc<dyn SyncStorage>,
    ) -> SyncResult<Self> {
        let fetchers = Arc::new(HttpFetchers::from_config(config, http.clone())?);
        Ok(Self {
            flags: fetchers.clone(),
            segments: fetchers.clone(),
            auth: fetchers,
            http,
            storage,
            flusher: Arc::new(NoopFlusher),
        })
    }

    /// Replaces the outbound flusher.
    pub fn with_flusher(mut self, flusher: Arc<dyn OutboundFlusher>) -> Self {
        self.flusher = flusher;
        self
    }
}

struct ManagerCore {
    started: bool,
    stopped: bool,
    paused: bool,
    polling_wanted: bool,
    backoff: BackoffCounter,
    reconnect: Option<TimerHandle>,
    ready_timeout: Option<TimerHandle>,
    queues: Option<(FlagsQueue, SegmentsQueue)>,
    feedback: Option<FeedbackReceiver>,
    tasks: Vec<JoinHandle<()>>,
}

struct ManagerInner {
    config: SyncConfig,
    storage: Arc<dyn SyncStorage>,
    events: Arc<EventsManager>,
    flags: Arc<FlagsSynchronizer>,
    segments: Arc<SegmentsSynchronizer>,
    polling: PollingSynchronizer,
    push: Option<PushNotificationManager>,
    flusher: Arc<dyn OutboundFlusher>,
    core: Mutex<ManagerCore>,
}

/// Keeps the local snapshot in sync through polling and streaming.
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

impl SyncManager {
    /// Creates a stopped manager.
    pub fn new(config: SyncConfig, collaborators: SyncCollaborators) -> SyncResult<Self> {
        let SyncCollaborators {
            flags,
            segments,
            auth,
            http,
            storage,
            flusher,
        } = collaborators;

        let events = Arc::new(EventsManager::new());
        let flags = Arc::new(FlagsSynchronizer::new(flags, storage.clone(), events.clone()));
        let segments = Arc::new(SegmentsSynchronizer::new(
            segments,
            storage.clone(),
            events.clone(),
            config.user_key.clone(),
        ));
        let polling = PollingSynchronizer::new(flags.clone(), segments.clone());

        let (flags_tx, flags_rx) = flags_queue();
        let (segments_tx, segments_rx) = segments_queue();
        let (feedback_tx, feedback_rx) = feedback_channel();
        let push = if config.streaming_enabled {
            Some(PushNotificationManager::new(
                &config,
                auth,
                http,
                NotificationProcessor::new(flags_tx, segments_tx),
                feedback_tx,
            )?)
        } else {
            None
        };

        let core = ManagerCore {
            started: false,
            stopped: false,
            paused: false,
            polling_wanted: true,
            backoff: config.reconnect_backoff(),
            reconnect: None,
            ready_timeout: None,
            queues: Some((flags_rx, segments_rx)),
            feedback: Some(feedback_rx),
            tasks: Vec::new(),
        };

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                storage,
                events,
                flags,
                segments,
                polling,
                push,
                flusher,
                core: Mutex::new(core),
            }),
        })
    }

    /// Creates a manager that reaches every endpoint through `http`.
    pub fn with_http(
        config: SyncConfig,
        http: Arc<dyn HttpClient>,
        storage: Arc<dyn SyncStorage>,
    ) -> SyncResult<Self> {
        let collaborators = SyncCollaborators::from_http(&config, http, storage)?;
        Self::new(config, collaborators)
    }

    /// Loads the stored snapshot, starts streaming and polling, and waits
    /// for the initial sync for at most the configured ready timeout.
    ///
    /// Returns whether the SDK is ready. Calling it again is a no-op.
    pub async fn start(&self) -> SyncResult<bool> {
        {
            let mut core = self.inner.core.lock();
            if core.stopped {
                return Err(SyncError::Stopped);
            }
            if core.started {
                return Ok(self.inner.events.is_ready());
            }
            core.started = true;
        }

        self.inner.load_from_storage()?;
        self.inner.start_background();

        let inner = self.inner.clone();
        let mut initial = tokio::spawn(async move {
            if let Err(e) = inner.polling.sync_now().await {
                tracing::warn!(error = %e, "initial sync failed, polling will retry");
            }
        });
        match tokio::time::timeout(self.inner.config.ready_timeout, &mut initial).await {
            Ok(_) => tracing::debug!("initial sync finished"),
            Err(_) => {
                tracing::warn!(timeout = ?self.inner.config.ready_timeout, "initial sync timed out");
                self.inner.core.lock().tasks.push(initial);
            }
        }

        Ok(self.inner.events.is_ready())
    }

    /// Suspends periodic work for a backgrounded host.
    pub fn pause(&self) {
        self.inner.pause();
    }

    /// Resumes after [`SyncManager::pause`].
    pub fn resume(&self) {
        self.inner.resume();
    }

    /// Stops polling, streaming and the update workers. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Flushes outbound data through the configured flusher.
    pub async fn flush(&self) -> SyncResult<()> {
        self.inner.flusher.flush().await
    }

    /// Runs one flags and segments sync now.
    pub async fn sync_now(&self) -> SyncResult<()> {
        self.inner.polling.sync_now().await
    }

    /// Readiness and update events.
    pub fn events(&self) -> Arc<EventsManager> {
        self.inner.events.clone()
    }

    /// The local snapshot store.
    pub fn storage(&self) -> Arc<dyn SyncStorage> {
        self.inner.storage.clone()
    }

    /// Current flags change number.
    pub fn flags_change_number(&self) -> SyncResult<i64> {
        self.inner.flags.change_number()
    }

    /// Current segments change number for the configured key.
    pub fn segments_change_number(&self) -> SyncResult<i64> {
        self.inner.segments.change_number()
    }

    /// State of the streaming connection, if streaming is enabled.
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.inner.push.as_ref().map(|push| push.state())
    }

    /// Returns true while periodic polling runs.
    pub fn is_polling(&self) -> bool {
        self.inner.polling.is_running()
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl ManagerInner {
    fn load_from_storage(&self) -> SyncResult<()> {
        let change_number = self.storage.flags_change_number()?;
        if change_number > NO_CHANGE_NUMBER {
            tracing::info!(change_number, "flags loaded from storage");
            self.events
                .notify_internal_event(InternalEvent::FlagsLoadedFromStorage);
        }
        self.events
            .notify_internal_event(InternalEvent::SegmentsLoadedFromStorage);
        Ok(())
    }

    fn start_background(self: &Arc<Self>) {
        let mut core = self.core.lock();

        let inner = self.clone();
        core.ready_timeout = Some(TimerHandle::schedule(self.config.ready_timeout, async move {
            inner
                .events
                .notify_internal_event(InternalEvent::ReadyTimeoutReached);
        }));

        if let Some(push) = &self.push {
            if let Some((flags_rx, segments_rx)) = core.queues.take() {
                let retry = self.config.retry.clone();
                let flags = FlagsUpdateWorker::new(self.flags.clone(), retry.clone());
                let segments = SegmentsUpdateWorker::new(self.segments.clone(), retry);
                core.tasks.push(flags.spawn(flags_rx));
                core.tasks.push(segments.spawn(segments_rx));
            }
            if let Some(feedback) = core.feedback.take() {
                core.tasks.push(tokio::spawn(self.clone().run_feedback(feedback)));
            }
            push.start();
        }

        self.set_polling(&mut core, true);
    }

    async fn run_feedback(self: Arc<Self>, mut feedback: FeedbackReceiver) {
        while let Some(event) = feedback.recv().await {
            self.on_feedback(event);
        }
    }

    fn on_feedback(self: &Arc<Self>, event: FeedbackEvent) {
        let mut core = self.core.lock();
        if core.stopped {
            return;
        }
        tracing::debug!(?event, "handling push feedback");

        match event {
            FeedbackEvent::PushSubsystemUp => {
                core.backoff.reset();
                core.reconnect = None;
                self.set_polling(&mut core, false);
                tracing::info!("streaming up, catching up once");
                let inner = self.clone();
                core.tasks.retain(|task| !task.is_finished());
                core.tasks.push(tokio::spawn(async move {
                    if let Err(e) = inner.polling.sync_now().await {
                        tracing::warn!(error = %e, "catch-up sync failed");
                    }
                }));
            }
            FeedbackEvent::PushSubsystemDown => {
                self.set_polling(&mut core, true);
            }
            FeedbackEvent::PushRetryableError => {
                self.set_polling(&mut core, true);
                if core.paused {
                    return;
                }
                let delay = core.backoff.next_interval();
                tracing::info!(?delay, attempt = core.backoff.attempt(), "streaming reconnect scheduled");
                let inner = self.clone();
                core.reconnect = Some(TimerHandle::schedule(delay, async move {
                    inner.reconnect();
                }));
            }
            FeedbackEvent::PushNonRetryableError => {
                tracing::warn!("streaming disabled for this session, polling only");
                core.reconnect = None;
                self.set_polling(&mut core, true);
                if let Some(push) = &self.push {
                    push.stop();
                }
            }
        }
    }

    fn reconnect(&self) {
        let core = self.core.lock();
        if core.stopped || core.paused {
            return;
        }
        if let Some(push) = &self.push {
            push.start();
        }
    }

    fn set_polling(&self, core: &mut ManagerCore, wanted: bool) {
        core.polling_wanted = wanted;
        if wanted && !core.paused && !core.stopped {
            self.polling.start(self.config.polling_interval);
        } else if !wanted {
            self.polling.stop();
        }
    }

    fn pause(&self) {
        let mut core = self.core.lock();
        if core.stopped || core.paused {
            return;
        }
        core.paused = true;
        core.reconnect = None;
        self.polling.stop();
        if let Some(push) = &self.push {
            push.pause();
        }
        tracing::info!("sync paused");
    }

    fn resume(&self) {
        let mut core = self.core.lock();
        if core.stopped || !core.paused {
            return;
        }
        core.paused = false;
        if core.started {
            let wanted = core.polling_wanted;
            self.set_polling(&mut core, wanted);
        }
        if let Some(push) = &self.push {
            push.resume();
        }
        tracing::info!("sync resumed");
    }

    fn stop(&self) {
        let mut core = self.core.lock();
        if core.stopped {
            return;
        }
        core.stopped = true;
        core.reconnect = None;
        core.ready_timeout = None;
        self.polling.stop();
        if let Some(push) = &self.push {
            push.stop();
        }
        for task in core.tasks.drain(..) {
            task.abort();
        }
        tracing::info!("sync manager stopped");
    }
}
