/*!
 * Mutex With Owner Bookkeeping
 *
 * Thin layer over `parking_lot::Mutex` that records which thread holds the
 * lock. The record exists for assertions only: condition waits clear it for
 * the duration of the wait through [`UnassignGuard`] and restore it on wakeup.
 */

use super::thread_id::{self, NONE};
use crate::core::errors::{fatal, SyncFault};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

/// Ownership checks run in debug builds, or everywhere with `strict-ownership`
#[inline(always)]
const fn ownership_checks() -> bool {
    cfg!(any(debug_assertions, feature = "strict-ownership"))
}

/// Exclusive lock guarding a `T`, aware of its holder thread
pub struct MutexLock<T = ()> {
    holder: AtomicU64,
    inner: Mutex<T>,
}

impl<T> MutexLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            holder: AtomicU64::new(NONE),
            inner: Mutex::new(value),
        }
    }

    /// Block until the lock is acquired
    pub fn lock(&self) -> MutexLockGuard<'_, T> {
        let inner = self.inner.lock();
        self.assign_holder();
        MutexLockGuard { lock: self, inner }
    }

    /// Acquire the lock only if it is free right now
    pub fn try_lock(&self) -> Option<MutexLockGuard<'_, T>> {
        let inner = self.inner.try_lock()?;
        self.assign_holder();
        Some(MutexLockGuard { lock: self, inner })
    }

    /// Whether the calling thread is the recorded holder
    #[inline]
    pub fn is_locked_by_current_thread(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == thread_id::current()
    }

    /// Fault unless the calling thread holds the lock
    ///
    /// No-op in release builds without `strict-ownership`.
    #[track_caller]
    pub fn assert_locked(&self) {
        if ownership_checks() && !self.is_locked_by_current_thread() {
            fatal(SyncFault::NotOwner {
                caller: thread_id::current(),
                holder: self.holder.load(Ordering::Relaxed),
            });
        }
    }

    /// Consume the lock, returning the guarded value
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    #[inline]
    fn assign_holder(&self) {
        self.holder.store(thread_id::current(), Ordering::Relaxed);
    }

    #[inline]
    fn unassign_holder(&self) {
        // A second fault while unwinding would abort with a less useful message.
        if !std::thread::panicking() {
            self.assert_locked();
        }
        self.holder.store(NONE, Ordering::Relaxed);
    }

    /// Suspend holder bookkeeping until the returned guard drops
    pub(crate) fn unassign(&self) -> UnassignGuard<'_, T> {
        self.unassign_holder();
        UnassignGuard { lock: self }
    }
}

impl<T: Default> Default for MutexLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for MutexLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("MutexLock");
        d.field("holder", &self.holder.load(Ordering::Relaxed));
        match self.inner.try_lock() {
            Some(value) => d.field("data", &&*value),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish()
    }
}

/// RAII guard for [`MutexLock`]; clears the holder before unlocking
pub struct MutexLockGuard<'a, T> {
    lock: &'a MutexLock<T>,
    inner: MutexGuard<'a, T>,
}

impl<'a, T> MutexLockGuard<'a, T> {
    /// The lock this guard belongs to
    #[inline]
    pub fn mutex(&self) -> &'a MutexLock<T> {
        self.lock
    }

    /// Native guard a condition variable suspends on
    #[inline]
    pub(crate) fn native_mut(&mut self) -> &mut MutexGuard<'a, T> {
        &mut self.inner
    }
}

impl<T> Deref for MutexLockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for MutexLockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for MutexLockGuard<'_, T> {
    fn drop(&mut self) {
        // Runs before `inner` is dropped, so the holder is cleared while still locked.
        self.lock.unassign_holder();
    }
}

/// Scoped "not owned" window around a condition wait
///
/// Created while the lock is held; the wait releases and reacquires the
/// native mutex, and dropping this guard records the caller as holder again.
pub(crate) struct UnassignGuard<'a, T> {
    lock: &'a MutexLock<T>,
}

impl<T> Drop for UnassignGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.assign_holder();
    }
}
