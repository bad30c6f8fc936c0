//! Periodic polling fallback.

use crate::error::SyncResult;
use crate::synchronizer::{FlagsSynchronizer, SegmentsSynchronizer};
use crate::timer::TimerHandle;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// Periodically fetches flags and segments.
pub struct PollingSynchronizer {
    flags: Arc<FlagsSynchronizer>,
    segments: Arc<SegmentsSynchronizer>,
    task: Mutex<Option<TimerHandle>>,
}

impl PollingSynchronizer {
    /// Creates a stopped poller.
    pub fn new(flags: Arc<FlagsSynchronizer>, segments: Arc<SegmentsSynchronizer>) -> Self {
        Self {
            flags,
            segments,
            task: Mutex::new(None),
        }
    }

    /// Starts polling every `interval`, first tick one interval from now.
    ///
    /// Has no effect while already running.
    pub fn start(&self, interval: Duration) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let flags = self.flags.clone();
        let segments = self.segments.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = sync_both(&flags, &segments).await {
                    tracing::warn!(error = %e, "polling sync failed, retrying next tick");
                }
            }
        });
        *task = Some(TimerHandle::from_task(handle));
        tracing::info!(?interval, "polling started");
    }

    /// Stops polling. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.cancel();
            tracing::info!("polling stopped");
        }
    }

    /// Returns true while the periodic task is running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Runs one flags and segments sync immediately.
    pub async fn sync_now(&self) -> SyncResult<()> {
        sync_both(&self.flags, &self.segments).await
    }
}

async fn sync_both(flags: &FlagsSynchronizer, segments: &SegmentsSynchronizer) -> SyncResult<()> {
    let (flags, segments) = tokio::join!(flags.sync(), segments.sync());
    if let Err(e) = &flags {
        tracing::warn!(error = %e, "flags fetch failed");
    }
    if let Err(e) = &segments {
        tracing::warn!(error = %e, "segments fetch failed");
    }
    flags?;
    segments?;
    Ok(())
}

impl Drop for PollingSynchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventsManager;
    use crate::storage::MemoryStorage;
    use crate::transport::MockFetcher;

    fn poller() -> (Arc<MockFetcher>, PollingSynchronizer) {
        let fetcher = Arc::new(MockFetcher::new());
        let storage = Arc::new(MemoryStorage::new());
        let events = Arc::new(EventsManager::new());
        let flags = Arc::new(FlagsSynchronizer::new(
            fetcher.clone(),
            storage.clone(),
            events.clone(),
        ));
        let segments = Arc::new(SegmentsSynchronizer::new(
            fetcher.clone(),
            storage,
            events,
            "user-1",
        ));
        (fetcher, PollingSynchronizer::new(flags, segments))
    }

    #[tokio::test]
    async fn sync_now_fetches_both() {
        let (fetcher, poller) = poller();
        poller.sync_now().await.unwrap();
        assert_eq!(fetcher.flag_requests().len(), 1);
        assert_eq!(fetcher.segment_requests(), 1);
    }

    #[tokio::test]
    async fn sync_now_reports_failures() {
        let (fetcher, poller) = poller();
        fetcher.fail_segments(true);
        assert!(poller.sync_now().await.is_err());
        assert_eq!(fetcher.flag_requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_every_interval_until_stopped() {
        let (fetcher, poller) = poller();
        poller.start(Duration::from_secs(10));
        poller.start(Duration::from_secs(1));
        assert!(poller.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fetcher.segment_requests(), 0);

        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(fetcher.segment_requests(), 3);

        poller.stop();
        poller.stop();
        assert!(!poller.is_running());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fetcher.segment_requests(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tick_does_not_stop_polling() {
        let (fetcher, poller) = poller();
        fetcher.fail_flags(true);
        fetcher.push_flags(crate::transport::FlagChanges::unchanged(-1));
        poller.start(Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(fetcher.flag_requests().len(), 2);
        assert!(poller.is_running());
    }
}
