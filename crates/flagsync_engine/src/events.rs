//! Readiness tracking and public SDK events.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events raised by the synchronizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalEvent {
    /// A non-empty flag snapshot was read from storage.
    FlagsLoadedFromStorage,
    /// Segment membership was read from storage.
    SegmentsLoadedFromStorage,
    /// Flags were fetched and nothing changed.
    FlagsFetched,
    /// Flags were fetched and the snapshot changed.
    FlagsUpdated,
    /// A flag was killed locally.
    FlagKilled,
    /// Segments were fetched and nothing changed.
    SegmentsFetched,
    /// Segment membership changed.
    SegmentsUpdated,
    /// The initial sync did not finish within the ready timeout.
    ReadyTimeoutReached,
}

/// Events delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkEvent {
    /// A cached snapshot can be served.
    SdkReadyFromCache,
    /// Both flags and segments were synchronized once.
    SdkReady,
    /// The snapshot changed after the SDK became ready.
    SdkUpdate,
    /// The initial sync timed out.
    SdkReadyTimedOut,
}

#[derive(Debug, Default)]
struct Readiness {
    flags_loaded: bool,
    segments_loaded: bool,
    flags_synced: bool,
    segments_synced: bool,
    ready_from_cache: bool,
    ready: bool,
    timed_out: bool,
}

impl Readiness {
    fn on_event(&mut self, event: InternalEvent) -> Option<SdkEvent> {
        match event {
            InternalEvent::FlagsLoadedFromStorage => self.flags_loaded = true,
            InternalEvent::SegmentsLoadedFromStorage => self.segments_loaded = true,
            InternalEvent::FlagsFetched | InternalEvent::FlagsUpdated => self.flags_synced = true,
            InternalEvent::SegmentsFetched | InternalEvent::SegmentsUpdated => {
                self.segments_synced = true
            }
            InternalEvent::FlagKilled => {}
            InternalEvent::ReadyTimeoutReached => {
                if self.ready || self.timed_out {
                    return None;
                }
                self.timed_out = true;
                return Some(SdkEvent::SdkReadyTimedOut);
            }
        }

        if !self.ready {
            if self.flags_synced && self.segments_synced {
                self.ready = true;
                return Some(SdkEvent::SdkReady);
            }
            if self.flags_loaded && self.segments_loaded && !self.ready_from_cache {
                self.ready_from_cache = true;
                return Some(SdkEvent::SdkReadyFromCache);
            }
            return None;
        }

        match event {
            InternalEvent::FlagsUpdated
            | InternalEvent::SegmentsUpdated
            | InternalEvent::FlagKilled => Some(SdkEvent::SdkUpdate),
            _ => None,
        }
    }
}

/// Folds internal events into public SDK events.
#[derive(Debug)]
pub struct EventsManager {
    readiness: Mutex<Readiness>,
    events: broadcast::Sender<SdkEvent>,
    ready: watch::Sender<bool>,
}

impl EventsManager {
    /// Creates a manager with no subscribers.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (ready, _) = watch::channel(false);
        Self {
            readiness: Mutex::new(Readiness::default()),
            events,
            ready,
        }
    }

    /// Records an internal event and returns the public event it raised.
    pub fn notify_internal_event(&self, event: InternalEvent) -> Option<SdkEvent> {
        let mut readiness = self.readiness.lock();
        let raised = readiness.on_event(event)?;
        tracing::debug!(?event, ?raised, "sdk event");
        if raised == SdkEvent::SdkReady {
            self.ready.send_replace(true);
        }
        // Sending fails only when nobody subscribed.
        let _ = self.events.send(raised);
        Some(raised)
    }

    /// Subscribes to public events raised from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SdkEvent> {
        self.events.subscribe()
    }

    /// Returns true once [`SdkEvent::SdkReady`] was raised.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Waits until ready or until `timeout` elapses. Returns readiness.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut ready = self.ready.subscribe();
        let outcome = tokio::time::timeout(timeout, ready.wait_for(|ready| *ready)).await;
        matches!(outcome, Ok(Ok(_)))
    }
}

impl Default for EventsManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_requires_flags_and_segments() {
        let events = EventsManager::new();
        assert_eq!(events.notify_internal_event(InternalEvent::FlagsFetched), None);
        assert!(!events.is_ready());
        assert_eq!(
            events.notify_internal_event(InternalEvent::SegmentsUpdated),
            Some(SdkEvent::SdkReady)
        );
        assert!(events.is_ready());
    }

    #[test]
    fn ready_fires_once_then_updates() {
        let events = EventsManager::new();
        events.notify_internal_event(InternalEvent::FlagsFetched);
        events.notify_internal_event(InternalEvent::SegmentsFetched);

        assert_eq!(events.notify_internal_event(InternalEvent::FlagsFetched), None);
        assert_eq!(
            events.notify_internal_event(InternalEvent::FlagsUpdated),
            Some(SdkEvent::SdkUpdate)
        );
        assert_eq!(
            events.notify_internal_event(InternalEvent::FlagKilled),
            Some(SdkEvent::SdkUpdate)
        );
    }

    #[test]
    fn ready_from_cache_fires_once_before_ready() {
        let events = EventsManager::new();
        events.notify_internal_event(InternalEvent::FlagsLoadedFromStorage);
        assert_eq!(
            events.notify_internal_event(InternalEvent::SegmentsLoadedFromStorage),
            Some(SdkEvent::SdkReadyFromCache)
        );
        assert_eq!(
            events.notify_internal_event(InternalEvent::SegmentsLoadedFromStorage),
            None
        );
    }

    #[test]
    fn timeout_fires_once_and_never_after_ready() {
        let events = EventsManager::new();
        assert_eq!(
            events.notify_internal_event(InternalEvent::ReadyTimeoutReached),
            Some(SdkEvent::SdkReadyTimedOut)
        );
        assert_eq!(events.notify_internal_event(InternalEvent::ReadyTimeoutReached), None);

        let events = EventsManager::new();
        events.notify_internal_event(InternalEvent::FlagsFetched);
        events.notify_internal_event(InternalEvent::SegmentsFetched);
        assert_eq!(events.notify_internal_event(InternalEvent::ReadyTimeoutReached), None);
    }

    #[test]
    fn kill_before_ready_raises_nothing() {
        let events = EventsManager::new();
        assert_eq!(events.notify_internal_event(InternalEvent::FlagKilled), None);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let events = EventsManager::new();
        let mut rx = events.subscribe();
        events.notify_internal_event(InternalEvent::FlagsFetched);
        events.notify_internal_event(InternalEvent::SegmentsFetched);
        assert_eq!(rx.recv().await.unwrap(), SdkEvent::SdkReady);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_times_out_then_sees_ready() {
        let events = EventsManager::new();
        assert!(!events.wait_ready(Duration::from_secs(1)).await);

        events.notify_internal_event(InternalEvent::FlagsFetched);
        events.notify_internal_event(InternalEvent::SegmentsFetched);
        assert!(events.wait_ready(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_wakes_when_ready_arrives() {
        let events = std::sync::Arc::new(EventsManager::new());
        let waiter = {
            let events = events.clone();
            tokio::spawn(async move { events.wait_ready(Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        events.notify_internal_event(InternalEvent::FlagsFetched);
        events.notify_internal_event(InternalEvent::SegmentsFetched);
        assert!(waiter.await.unwrap());
    }
}
