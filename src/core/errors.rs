/*!
 * Error Types
 * Unrecoverable synchronization faults, with thiserror and miette support
 */

use miette::Diagnostic;
use thiserror::Error;

/// Faults that leave shared state unverifiable
///
/// None of these is returned as an `Err`. They are raised through [`fatal`],
/// which aborts under `panic = "abort"` and otherwise unwinds with the fault
/// as the panic payload.
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum SyncFault {
    #[error("Condition variable waited on with a guard of a different mutex")]
    #[diagnostic(
        code(sync::foreign_mutex),
        help("A condition variable is bound to exactly one mutex. Lock `condition.mutex()` before waiting.")
    )]
    ForeignMutex,

    #[error("Mutex released by thread {caller} while owned by thread {holder}")]
    #[diagnostic(
        code(sync::not_owner),
        help("Lock ownership bookkeeping is out of sync. A guard crossed threads or a wait was not unassigned.")
    )]
    NotOwner { caller: u64, holder: u64 },

    #[error("Recursive construction of singleton `{type_name}`")]
    #[diagnostic(
        code(sync::recursive_init),
        help("The type's Default impl requested its own singleton instance.")
    )]
    RecursiveInit { type_name: &'static str },

    #[error("Singleton `{type_name}` accessed after teardown")]
    #[diagnostic(
        code(sync::singleton_destroyed),
        help("The instance was destroyed at exit. Set `NO_DESTROY = true` for types used by threads that outlive teardown.")
    )]
    SingletonDestroyed { type_name: &'static str },

    #[error("Failed to register process exit hook")]
    #[diagnostic(
        code(sync::exit_hook),
        help("atexit(3) refused the handler. The process may have exhausted its exit handler slots.")
    )]
    ExitHookRegistration,
}

/// Raise an unrecoverable fault
///
/// Logs the fault and panics with it as the payload, so tests can tell it
/// apart from ordinary panics via `downcast_ref::<SyncFault>()`.
#[cold]
#[track_caller]
pub fn fatal(fault: SyncFault) -> ! {
    tracing::error!(fault = %fault, "fatal synchronization fault");
    std::panic::panic_any(fault)
}
