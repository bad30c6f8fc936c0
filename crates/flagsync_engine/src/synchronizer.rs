//! Fetch-and-apply for the flags and segments streams.
//!
//! Each synchronizer serializes its own fetch-and-apply with an async
//! mutex, so polling and the update workers never interleave writes to
//! the same stream.

use crate::error::{SyncError, SyncResult};
use crate::events::{EventsManager, InternalEvent};
use crate::storage::SyncStorage;
use crate::transport::{FlagDefinition, FlagFetcher, SegmentFetcher};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Upper bound of pages fetched by one flags sync.
pub const MAX_FLAG_PAGES: usize = 100;

/// Result of a completed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The local snapshot changed.
    Updated,
    /// The fetch succeeded and nothing changed.
    Unchanged,
}

/// Fetches and applies flag definitions.
pub struct FlagsSynchronizer {
    fetcher: Arc<dyn FlagFetcher>,
    storage: Arc<dyn SyncStorage>,
    events: Arc<EventsManager>,
    lock: Mutex<()>,
}

impl FlagsSynchronizer {
    /// Creates a flags synchronizer.
    pub fn new(
        fetcher: Arc<dyn FlagFetcher>,
        storage: Arc<dyn SyncStorage>,
        events: Arc<EventsManager>,
    ) -> Self {
        Self {
            fetcher,
            storage,
            events,
            lock: Mutex::new(()),
        }
    }

    /// Change number of the local snapshot.
    pub fn change_number(&self) -> SyncResult<i64> {
        self.storage.flags_change_number()
    }

    /// Fetches until the server reports no further changes.
    pub async fn sync(&self) -> SyncResult<SyncOutcome> {
        let _guard = self.lock.lock().await;
        self.fetch_until(None, false).await
    }

    /// Fetches until the snapshot reaches `target`.
    ///
    /// Returns `None` without fetching when the snapshot is already at or
    /// past `target`, and [`SyncError::BehindNotification`] when the server
    /// stops short of it.
    pub async fn sync_to(&self, target: i64) -> SyncResult<Option<SyncOutcome>> {
        self.sync_to_announced(target, false).await
    }

    /// Like [`FlagsSynchronizer::sync_to`]. With `announced` set, a local
    /// kill already raised the update and fetched changes raise no second one.
    pub(crate) async fn sync_to_announced(
        &self,
        target: i64,
        announced: bool,
    ) -> SyncResult<Option<SyncOutcome>> {
        let _guard = self.lock.lock().await;
        let current = self.storage.flags_change_number()?;
        if target <= current {
            tracing::debug!(target, current, "flags already up to date");
            return Ok(None);
        }
        let outcome = self.fetch_until(Some(target), announced).await?;
        let reached = self.storage.flags_change_number()?;
        if reached < target {
            tracing::warn!(target, reached, "flags fetch stopped short of notified change number");
            return Err(SyncError::BehindNotification { target, reached });
        }
        Ok(Some(outcome))
    }

    /// Marks a flag killed locally. Returns true if the snapshot changed.
    pub fn kill(
        &self,
        flag_name: &str,
        default_treatment: &str,
        change_number: i64,
    ) -> SyncResult<bool> {
        let killed = self
            .storage
            .kill_flag(flag_name, default_treatment, change_number)?;
        if killed {
            tracing::info!(flag = flag_name, change_number, "flag killed");
            self.events.notify_internal_event(InternalEvent::FlagKilled);
        }
        Ok(killed)
    }

    async fn fetch_until(&self, target: Option<i64>, announced: bool) -> SyncResult<SyncOutcome> {
        let mut since = self.storage.flags_change_number()?;
        let mut updated = false;

        for _ in 0..MAX_FLAG_PAGES {
            let changes = self.fetcher.fetch_flags_since(since).await?;
            let current = self.storage.flags_change_number()?;

            if changes.till > current {
                let (upserts, archived): (Vec<FlagDefinition>, Vec<FlagDefinition>) =
                    changes.flags.into_iter().partition(FlagDefinition::is_active);
                updated |= !upserts.is_empty() || !archived.is_empty();
                tracing::debug!(
                    since,
                    till = changes.till,
                    upserts = upserts.len(),
                    removals = archived.len(),
                    "applying flag changes"
                );
                let removals = archived.into_iter().map(|flag| flag.name).collect();
                self.storage.update_flags(upserts, removals, changes.till)?;
            }

            if changes.till <= since || target.is_some_and(|target| changes.till >= target) {
                break;
            }
            since = changes.till;
        }

        let (outcome, event) = match (updated, announced) {
            (true, false) => (SyncOutcome::Updated, InternalEvent::FlagsUpdated),
            (true, true) => (SyncOutcome::Updated, InternalEvent::FlagsFetched),
            (false, _) => (SyncOutcome::Unchanged, InternalEvent::FlagsFetched),
        };
        self.events.notify_internal_event(event);
        Ok(outcome)
    }
}

/// Fetches and applies segment membership for one key.
pub struct SegmentsSynchronizer {
    fetcher: Arc<dyn SegmentFetcher>,
    storage: Arc<dyn SyncStorage>,
    events: Arc<EventsManager>,
    key: String,
    lock: Mutex<()>,
}

impl SegmentsSynchronizer {
    /// Creates a segments synchronizer for `key`.
    pub fn new(
        fetcher: Arc<dyn SegmentFetcher>,
        storage: Arc<dyn SyncStorage>,
        events: Arc<EventsManager>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            storage,
            events,
            key: key.into(),
            lock: Mutex::new(()),
        }
    }

    /// Matching key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Change number of the last applied notification.
    pub fn change_number(&self) -> SyncResult<i64> {
        self.storage.segments_change_number(&self.key)
    }

    /// Fetches and applies the membership.
    pub async fn sync(&self) -> SyncResult<SyncOutcome> {
        let _guard = self.lock.lock().await;
        let segments = self.fetcher.fetch_segments_for(&self.key).await?;
        self.apply(segments)
    }

    /// Fetches and applies the membership unless `change_number` is stale.
    pub async fn sync_to(&self, change_number: Option<i64>) -> SyncResult<Option<SyncOutcome>> {
        let _guard = self.lock.lock().await;
        if self.is_stale(change_number)? {
            return Ok(None);
        }
        let segments = self.fetcher.fetch_segments_for(&self.key).await?;
        let outcome = self.apply(segments)?;
        self.record(change_number)?;
        Ok(Some(outcome))
    }

    /// Applies an inline membership list unless `change_number` is stale.
    pub async fn apply_payload(
        &self,
        change_number: Option<i64>,
        segments: Vec<String>,
    ) -> SyncResult<Option<SyncOutcome>> {
        let _guard = self.lock.lock().await;
        if self.is_stale(change_number)? {
            return Ok(None);
        }
        let outcome = self.apply(segments)?;
        self.record(change_number)?;
        Ok(Some(outcome))
    }

    fn is_stale(&self, change_number: Option<i64>) -> SyncResult<bool> {
        let Some(change_number) = change_number else {
            return Ok(false);
        };
        let current = self.storage.segments_change_number(&self.key)?;
        if change_number <= current {
            tracing::debug!(change_number, current, "segments already up to date");
            return Ok(true);
        }
        Ok(false)
    }

    fn record(&self, change_number: Option<i64>) -> SyncResult<()> {
        match change_number {
            Some(change_number) => self
                .storage
                .set_segments_change_number(&self.key, change_number),
            None => Ok(()),
        }
    }

    fn apply(&self, mut segments: Vec<String>) -> SyncResult<SyncOutcome> {
        segments.sort();
        segments.dedup();
        let mut current = self.storage.segments_for(&self.key)?;
        current.sort();
        current.dedup();

        if current == segments {
            self.events
                .notify_internal_event(InternalEvent::SegmentsFetched);
            return Ok(SyncOutcome::Unchanged);
        }

        tracing::debug!(count = segments.len(), "segment membership changed");
        self.storage.set_segments_for(&self.key, segments)?;
        self.events
            .notify_internal_event(InternalEvent::SegmentsUpdated);
        Ok(SyncOutcome::Updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::transport::{FlagChanges, MockFetcher};

    fn flags_setup(storage: MemoryStorage) -> (Arc<MockFetcher>, Arc<MemoryStorage>, FlagsSynchronizer) {
        let fetcher = Arc::new(MockFetcher::new());
        let storage = Arc::new(storage);
        let sync = FlagsSynchronizer::new(
            fetcher.clone(),
            storage.clone(),
            Arc::new(EventsManager::new()),
        );
        (fetcher, storage, sync)
    }

    fn page(since: i64, till: i64, flags: Vec<FlagDefinition>) -> FlagChanges {
        FlagChanges { since, till, flags }
    }

    #[tokio::test]
    async fn sync_pages_until_caught_up() {
        let (fetcher, storage, sync) = flags_setup(MemoryStorage::new());
        fetcher.push_flags(page(-1, 10, vec![FlagDefinition::new("a", 10)]));
        fetcher.push_flags(page(10, 20, vec![FlagDefinition::new("b", 20)]));
        fetcher.push_flags(FlagChanges::unchanged(20));

        assert_eq!(sync.sync().await.unwrap(), SyncOutcome::Updated);
        assert_eq!(fetcher.flag_requests(), vec![-1, 10, 20]);
        assert_eq!(storage.flags_change_number().unwrap(), 20);
        assert_eq!(storage.flag_names().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn sync_to_fetches_once_for_newer_target() {
        let (fetcher, storage, sync) = flags_setup(MemoryStorage::with_flags(vec![], 999));
        fetcher.push_flags(page(999, 1000, vec![FlagDefinition::new("a", 1000)]));

        assert_eq!(sync.sync_to(1000).await.unwrap(), Some(SyncOutcome::Updated));
        assert_eq!(fetcher.flag_requests(), vec![999]);
        assert_eq!(storage.flags_change_number().unwrap(), 1000);

        assert_eq!(sync.sync_to(1000).await.unwrap(), None);
        assert_eq!(fetcher.flag_requests().len(), 1);
    }

    #[tokio::test]
    async fn archived_flags_are_removed() {
        let (fetcher, storage, sync) =
            flags_setup(MemoryStorage::with_flags(vec![FlagDefinition::new("old", 1)], 1));
        fetcher.push_flags(page(1, 2, vec![FlagDefinition::new("old", 2).archived()]));
        fetcher.push_flags(FlagChanges::unchanged(2));

        sync.sync().await.unwrap();
        assert!(storage.flag("old").unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_pages_are_not_applied() {
        let (fetcher, storage, sync) = flags_setup(MemoryStorage::with_flags(vec![], 50));
        fetcher.push_flags(page(50, 40, vec![FlagDefinition::new("stale", 40)]));

        assert_eq!(sync.sync().await.unwrap(), SyncOutcome::Unchanged);
        assert_eq!(storage.flags_change_number().unwrap(), 50);
        assert!(storage.flag("stale").unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_failure_leaves_snapshot_untouched() {
        let (fetcher, storage, sync) = flags_setup(MemoryStorage::with_flags(vec![], 5));
        fetcher.fail_flags(true);

        assert!(sync.sync_to(6).await.unwrap_err().is_retryable());
        assert_eq!(storage.flags_change_number().unwrap(), 5);
    }

    #[tokio::test]
    async fn stale_server_response_is_behind_notification() {
        let (fetcher, storage, sync) = flags_setup(MemoryStorage::with_flags(vec![], 5));
        fetcher.push_flags(FlagChanges::unchanged(5));

        let err = sync.sync_to(8).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::BehindNotification {
                target: 8,
                reached: 5
            }
        ));
        assert!(err.is_retryable());
        assert_eq!(storage.flags_change_number().unwrap(), 5);

        fetcher.push_flags(page(5, 8, vec![]));
        assert_eq!(sync.sync_to(8).await.unwrap(), Some(SyncOutcome::Unchanged));
        assert_eq!(fetcher.flag_requests(), vec![5, 5]);
    }

    #[tokio::test]
    async fn kill_marks_flag() {
        let (_fetcher, storage, sync) =
            flags_setup(MemoryStorage::with_flags(vec![FlagDefinition::new("a", 1)], 1));
        assert!(sync.kill("a", "off", 2).unwrap());
        assert!(storage.flag("a").unwrap().unwrap().killed);
        assert!(!sync.kill("a", "off", 2).unwrap());
    }

    fn segments_setup() -> (Arc<MockFetcher>, Arc<MemoryStorage>, SegmentsSynchronizer) {
        let fetcher = Arc::new(MockFetcher::new());
        let storage = Arc::new(MemoryStorage::new());
        let sync = SegmentsSynchronizer::new(
            fetcher.clone(),
            storage.clone(),
            Arc::new(EventsManager::new()),
            "user-1",
        );
        (fetcher, storage, sync)
    }

    #[tokio::test]
    async fn segments_detect_changes_ignoring_order() {
        let (fetcher, storage, sync) = segments_setup();
        fetcher.push_segments(&["b", "a"]);
        fetcher.push_segments(&["a", "b"]);

        assert_eq!(sync.sync().await.unwrap(), SyncOutcome::Updated);
        assert_eq!(sync.sync().await.unwrap(), SyncOutcome::Unchanged);
        assert_eq!(
            storage.segments_for("user-1").unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn segments_skip_stale_change_numbers() {
        let (fetcher, storage, sync) = segments_setup();
        fetcher.push_segments(&["a"]);

        assert!(sync.sync_to(Some(10)).await.unwrap().is_some());
        assert_eq!(storage.segments_change_number("user-1").unwrap(), 10);
        assert!(sync.sync_to(Some(10)).await.unwrap().is_none());
        assert!(sync.sync_to(Some(9)).await.unwrap().is_none());
        assert_eq!(fetcher.segment_requests(), 1);

        assert!(sync.sync_to(None).await.unwrap().is_some());
        assert_eq!(fetcher.segment_requests(), 2);
    }

    #[tokio::test]
    async fn payload_is_applied_without_fetch() {
        let (fetcher, storage, sync) = segments_setup();
        let outcome = sync
            .apply_payload(Some(3), vec!["beta".to_string()])
            .await
            .unwrap();

        assert_eq!(outcome, Some(SyncOutcome::Updated));
        assert_eq!(fetcher.segment_requests(), 0);
        assert_eq!(storage.segments_for("user-1").unwrap(), vec!["beta".to_string()]);
    }
}
