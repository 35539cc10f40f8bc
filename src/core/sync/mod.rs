/*!
 * Synchronization Primitives
 *
 * Blocking building blocks for thread startup and shared registries:
 * - `ConditionVariable`: condvar bound to one `MutexLock`, with timed wait
 * - `CountDownLatch`: one-shot barrier released when a counter hits zero
 * - `LazySingleton`: process-wide lazily built instance with exit teardown
 *
 * # Locking
 *
 * Every component owns one private, non-reentrant lock and never holds it
 * while calling into another component, so none of them can deadlock on its
 * own. Misuse (foreign guards, recursive singleton construction, use after
 * teardown) is raised as a [`SyncFault`](crate::core::errors::SyncFault).
 */

mod condition;
mod latch;
mod mutex;
mod singleton;
pub mod thread_id;

pub use condition::ConditionVariable;
pub use latch::CountDownLatch;
pub use mutex::{MutexLock, MutexLockGuard};
pub use singleton::{teardown_singletons, LazySingleton, Singleton};
