//! Completion barrier for outstanding asynchronous work.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Counts outstanding units of work and lets callers wait for the count to reach zero.
///
/// All reads and writes of the count go through one mutex. Blocking callers wait on a
/// condition variable; async callers wait on a [`Notify`]. The count may go back above
/// zero after reaching it.
#[derive(Debug, Default)]
pub struct Waiter {
    pending: Mutex<i64>,
    condvar: Condvar,
    notify: Notify,
}

impl Waiter {
    /// Create a waiter with nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the counter half-updated, so keep going.
    fn lock(&self) -> MutexGuard<'_, i64> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adjust the pending count by `delta`, waking every waiter when it reaches zero.
    pub fn increment_pending_count(&self, delta: i64) {
        let mut pending = self.lock();
        *pending += delta;
        if *pending == 0 {
            self.condvar.notify_all();
            self.notify.notify_waiters();
        }
    }

    /// Current pending count.
    pub fn pending_count(&self) -> i64 {
        *self.lock()
    }

    /// Block the current thread until nothing is pending.
    ///
    /// Spurious wakeups are absorbed; the wait only ends once the count is zero.
    pub fn wait_complete(&self) {
        let mut pending = self.lock();
        while *pending > 0 {
            pending = self
                .condvar
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout` until nothing is pending.
    ///
    /// Returns whether the count reached zero. The remaining budget is recomputed after
    /// every wakeup; with no budget left this returns `false` without waiting.
    pub fn try_wait(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut pending = self.lock();
        while *pending > 0 {
            let remaining = match timeout.checked_sub(start.elapsed()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return false,
            };
            pending = self
                .condvar
                .wait_timeout(pending, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Wait asynchronously until nothing is pending.
    pub async fn wait_complete_async(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending_count() <= 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait asynchronously for at most `timeout`. Returns whether the count reached zero.
    pub async fn try_wait_async(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_complete_async())
            .await
            .is_ok()
    }
}
