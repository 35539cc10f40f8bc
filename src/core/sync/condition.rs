/*!
 * Condition Variable
 *
 * `parking_lot::Condvar` bound 1:1 to a [`MutexLock`]. Waiting requires the
 * caller's guard, so the "lock must be held" precondition is checked by the
 * type system; the guard must belong to the bound mutex.
 *
 * No predicate is checked here. Spurious wakeups and competing waiters are
 * possible, so callers loop on their own condition.
 */

use super::mutex::{MutexLock, MutexLockGuard};
use crate::core::errors::{fatal, SyncFault};
use parking_lot::Condvar;
use std::fmt;
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Condition variable bound to one shared [`MutexLock`]
pub struct ConditionVariable<T = ()> {
    mutex: Arc<MutexLock<T>>,
    cond: Condvar,
}

impl<T> ConditionVariable<T> {
    /// Bind a new condition variable to `mutex`
    pub fn new(mutex: Arc<MutexLock<T>>) -> Self {
        Self {
            mutex,
            cond: Condvar::new(),
        }
    }

    /// The bound mutex; lock it before waiting
    #[inline]
    pub fn mutex(&self) -> &Arc<MutexLock<T>> {
        &self.mutex
    }

    /// Release the lock, sleep until woken, then reacquire it
    ///
    /// Returns on notify, broadcast or spurious wakeup alike.
    pub fn wait(&self, guard: &mut MutexLockGuard<'_, T>) {
        self.check_bound(guard);
        let _unassigned = self.mutex.unassign();
        self.cond.wait(guard.native_mut());
    }

    /// Timed [`wait`](Self::wait) with the deadline `now + seconds`
    ///
    /// Returns `true` if the deadline elapsed, `false` if woken first. A
    /// `false` result says nothing about the caller's predicate. Zero,
    /// negative and NaN values mean an already-expired deadline.
    pub fn wait_for_seconds(&self, guard: &mut MutexLockGuard<'_, T>, seconds: f64) -> bool {
        let timeout = if seconds > 0.0 {
            Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        };
        self.wait_timeout(guard, timeout)
    }

    /// Timed [`wait`](Self::wait) taking a `Duration`
    ///
    /// Same result convention as [`wait_for_seconds`](Self::wait_for_seconds).
    /// A timeout too far out to express as an `Instant` waits without a deadline.
    pub fn wait_timeout(&self, guard: &mut MutexLockGuard<'_, T>, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait(guard);
            return false;
        };

        self.check_bound(guard);
        let _unassigned = self.mutex.unassign();
        self.cond.wait_until(guard.native_mut(), deadline).timed_out()
    }

    /// Wake at most one waiter
    ///
    /// Only correct when every waiter resumes on the same condition.
    #[inline]
    pub fn notify(&self) {
        self.cond.notify_one();
    }

    /// Wake every waiter
    #[inline]
    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    #[inline]
    #[track_caller]
    fn check_bound(&self, guard: &MutexLockGuard<'_, T>) {
        if !ptr::eq(guard.mutex(), Arc::as_ptr(&self.mutex)) {
            fatal(SyncFault::ForeignMutex);
        }
    }
}

impl<T> fmt::Debug for ConditionVariable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("mutex", &Arc::as_ptr(&self.mutex))
            .finish()
    }
}
