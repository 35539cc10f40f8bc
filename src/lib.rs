/*!
 * netbase-sync
 * Thread synchronization toolkit: condition variables, countdown latches
 * and lazily constructed process-wide singletons
 */

pub mod core;

// Re-exports
pub use crate::core::errors::{fatal, SyncFault};
pub use crate::core::sync::{
    teardown_singletons, ConditionVariable, CountDownLatch, LazySingleton, MutexLock,
    MutexLockGuard, Singleton,
};
