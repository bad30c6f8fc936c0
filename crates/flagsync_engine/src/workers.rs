//! Update workers.
//!
//! One worker per queue consumes notifications strictly in arrival order.
//! A notification whose change number is not newer than the local
//! watermark is skipped without fetching.

use crate::config::RetryConfig;
use crate::error::SyncResult;
use crate::processor::{FlagUpdate, FlagsQueue, SegmentUpdate, SegmentsQueue};
use crate::synchronizer::{FlagsSynchronizer, SegmentsSynchronizer, SyncOutcome};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Runs `attempt` until it succeeds, fails permanently or runs out of
/// attempts. Returns the last result.
async fn with_retry<F, Fut>(
    retry: &RetryConfig,
    what: &'static str,
    mut attempt: F,
) -> SyncResult<Option<SyncOutcome>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<Option<SyncOutcome>>>,
{
    let mut backoff = retry.backoff();
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt().await {
            Err(e) if e.is_retryable() && tries < retry.max_attempts => {
                let delay = backoff.next_interval();
                tracing::warn!(error = %e, tries, ?delay, "{what} fetch failed, retrying");
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}

/// Consumes the flags queue.
pub struct FlagsUpdateWorker {
    synchronizer: Arc<FlagsSynchronizer>,
    retry: RetryConfig,
}

impl FlagsUpdateWorker {
    /// Creates a worker.
    pub fn new(synchronizer: Arc<FlagsSynchronizer>, retry: RetryConfig) -> Self {
        Self {
            synchronizer,
            retry,
        }
    }

    /// Spawns the worker; it ends when the queue closes or the task is aborted.
    pub fn spawn(self, queue: FlagsQueue) -> JoinHandle<()> {
        tokio::spawn(self.run(queue))
    }

    async fn run(self, mut queue: FlagsQueue) {
        while let Some(update) = queue.recv().await {
            self.handle(update).await;
        }
        tracing::debug!("flags queue closed");
    }

    /// Applies one update.
    pub async fn handle(&self, update: FlagUpdate) {
        let change_number = update.change_number();
        let mut announced = false;
        if let FlagUpdate::Killed {
            flag_name,
            default_treatment,
            ..
        } = &update
        {
            match self
                .synchronizer
                .kill(flag_name, default_treatment, change_number)
            {
                Ok(killed) => announced = killed,
                Err(e) => {
                    tracing::error!(error = %e, flag = %flag_name, "failed to apply flag kill")
                }
            }
        }

        match self.synchronizer.change_number() {
            Ok(current) if change_number <= current => {
                tracing::debug!(change_number, current, "skipping stale flags notification");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "failed to read flags change number");
                return;
            }
        }

        let result = with_retry(&self.retry, "flags", move || {
            self.synchronizer.sync_to_announced(change_number, announced)
        })
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, change_number, "dropping flags notification");
        }
    }
}

/// Consumes the segments queue.
pub struct SegmentsUpdateWorker {
    synchronizer: Arc<SegmentsSynchronizer>,
    retry: RetryConfig,
}

impl SegmentsUpdateWorker {
    /// Creates a worker.
    pub fn new(synchronizer: Arc<SegmentsSynchronizer>, retry: RetryConfig) -> Self {
        Self {
            synchronizer,
            retry,
        }
    }

    /// Spawns the worker; it ends when the queue closes or the task is aborted.
    pub fn spawn(self, queue: SegmentsQueue) -> JoinHandle<()> {
        tokio::spawn(self.run(queue))
    }

    async fn run(self, mut queue: SegmentsQueue) {
        while let Some(update) = queue.recv().await {
            self.handle(update).await;
        }
        tracing::debug!("segments queue closed");
    }

    /// Applies one update.
    pub async fn handle(&self, update: SegmentUpdate) {
        let SegmentUpdate {
            change_number,
            segment_name,
            segments,
        } = update;

        let result = match segments {
            Some(segments) => {
                self.synchronizer
                    .apply_payload(change_number, segments)
                    .await
            }
            None => {
                with_retry(&self.retry, "segments", move || {
                    self.synchronizer.sync_to(change_number)
                })
                .await
            }
        };

        match result {
            Ok(None) => {
                tracing::debug!(?change_number, "skipping stale segments notification")
            }
            Ok(Some(outcome)) => {
                tracing::debug!(?change_number, ?segment_name, ?outcome, "segments notification applied")
            }
            Err(e) => {
                tracing::warn!(error = %e, ?change_number, "dropping segments notification")
            }
        }
    }
}
