//! One-shot cancellable timers.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A scheduled task that is aborted when cancelled or dropped.
///
/// The task body should not await after it has replaced the slot holding
/// its own handle, since dropping the handle aborts the task at its next
/// suspension point.
#[derive(Debug)]
pub struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    /// Runs `task` after `delay` on the current runtime.
    pub fn schedule<F>(delay: Duration, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        Self { handle }
    }

    /// Wraps an already spawned task.
    pub fn from_task(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    /// Cancels the timer. Has no effect once the task has completed.
    pub fn cancel(self) {
        self.handle.abort();
    }

    /// Returns true once the task has completed or been aborted.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
