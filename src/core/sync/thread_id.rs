/*!
 * Thread Identity
 *
 * Small non-zero numeric ids for lock ownership bookkeeping.
 * `std::thread::ThreadId` has no stable integer form, so ids are handed out
 * from a process-wide counter the first time a thread asks.
 */

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reserved for "no thread"
pub const NONE: u64 = 0;

/// Shared by threads whose thread-locals are already destroyed (exit handlers)
pub const EXITING: u64 = u64::MAX;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: Cell<u64> = const { Cell::new(NONE) };
}

/// Id of the calling thread (never [`NONE`])
#[inline]
pub fn current() -> u64 {
    CURRENT
        .try_with(|id| {
            let cached = id.get();
            if cached != NONE {
                return cached;
            }
            let fresh = NEXT_ID.fetch_add(1, Ordering::Relaxed);
            id.set(fresh);
            fresh
        })
        .unwrap_or(EXITING)
}
