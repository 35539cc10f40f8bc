/*!
 * Countdown Latch
 *
 * One-shot barrier: waiters block until the counter reaches zero.
 * Typical uses:
 * - A starter thread waits for N workers to finish initializing
 * - N workers wait for a single "go" from a coordinator (count of 1)
 *
 * The counter lives inside the latch's own mutex and only moves down. Once it
 * hits zero the latch stays released for good.
 */

use super::condition::ConditionVariable;
use super::mutex::MutexLock;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Blocks waiters until `count_down` has been called `count` times
pub struct CountDownLatch {
    // Lock order: mutex, then condition
    mutex: Arc<MutexLock<usize>>,
    condition: ConditionVariable<usize>,
}

impl CountDownLatch {
    /// Create a latch that releases after `count` calls to `count_down`
    ///
    /// A count of zero starts released.
    pub fn new(count: usize) -> Self {
        let mutex = Arc::new(MutexLock::new(count));
        let condition = ConditionVariable::new(mutex.clone());
        Self { mutex, condition }
    }

    /// Decrement the counter, releasing all waiters when it reaches zero
    ///
    /// Calls after release are no-ops.
    pub fn count_down(&self) {
        let mut count = self.mutex.lock();
        if *count == 0 {
            return;
        }

        *count -= 1;
        if *count == 0 {
            trace!("countdown latch released");
            // Every waiter must observe zero on its own.
            self.condition.notify_all();
        }
    }

    /// Block until the counter reaches zero
    pub fn wait(&self) {
        let mut count = self.mutex.lock();
        while *count > 0 {
            self.condition.wait(&mut count);
        }
    }

    /// Block until the counter reaches zero or `timeout` elapses
    ///
    /// Returns `true` if the latch was released, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut count = self.mutex.lock();

        while *count > 0 {
            let Some(deadline) = deadline else {
                self.condition.wait(&mut count);
                continue;
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.condition.wait_timeout(&mut count, remaining);
        }

        true
    }

    /// Snapshot of the counter; may be stale once returned
    pub fn count(&self) -> usize {
        *self.mutex.lock()
    }

    /// Whether the counter has reached zero
    pub fn is_released(&self) -> bool {
        self.count() == 0
    }
}

impl fmt::Debug for CountDownLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountDownLatch")
            .field("count", &self.count())
            .finish()
    }
}
