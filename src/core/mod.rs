/*!
 * Core Module
 * Synchronization primitives and fault handling
 */

pub mod errors;
pub mod sync;

// Re-export for convenience
pub use errors::*;
pub use sync::*;
