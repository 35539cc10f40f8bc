/*!
 * Lazy Process-Wide Singletons
 *
 * `LazySingleton::<T>::instance()` hands out the one `T` of the process,
 * built with `T::default()` on first access.
 *
 * # Slot Lifecycle
 *
 * ```text
 * Uninitialized -> Constructing -> Ready -> Destroyed
 *       ^               |             \--> Leaked      (NO_DESTROY)
 *       \---- panic ----/
 * ```
 *
 * The first caller to win the `Uninitialized -> Constructing` CAS runs the
 * constructor outside of any lock. Callers arriving meanwhile park on the
 * slot's condition variable until the state moves on. A panicking
 * constructor rolls the slot back so a later caller retries.
 *
 * # Teardown
 *
 * Ready instances are queued for teardown, which runs from an `atexit(3)`
 * hook in reverse order of construction. Instances first built while
 * teardown runs (from another singleton's `Drop`) are torn down by the same
 * pass. Types with `NO_DESTROY = true` are marked leaked and never dropped;
 * use that for anything touched by detached threads that can outlive
 * teardown, since references handed out earlier dangle once an instance is
 * destroyed.
 */

use super::condition::ConditionVariable;
use super::mutex::MutexLock;
use super::thread_id::{self, NONE};
use crate::core::errors::{fatal, SyncFault};
use ahash::RandomState;
use dashmap::DashMap;
use parking_lot::{const_mutex, Mutex, Once};
use std::any::{type_name, Any, TypeId};
use std::cell::UnsafeCell;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace, warn};

const UNINITIALIZED: u8 = 0;
const CONSTRUCTING: u8 = 1;
const READY: u8 = 2;
const LEAKED: u8 = 3;
const DESTROYED: u8 = 4;

/// Types that may live in a [`LazySingleton`]
///
/// `T` must be `Sized`, so incomplete types never reach teardown:
///
/// ```compile_fail
/// use netbase_sync::LazySingleton;
///
/// let _ = LazySingleton::<str>::instance();
/// ```
pub trait Singleton: Default + Send + Sync + 'static {
    /// Never drop the instance at process exit
    ///
    /// Not inherited: a type wrapping a `NO_DESTROY` type states its own policy.
    const NO_DESTROY: bool = false;
}

/// Handle for the process-wide instance of `T`
///
/// Cannot be constructed; [`instance`](Self::instance) is its only operation.
///
/// ```
/// use netbase_sync::{LazySingleton, Singleton};
///
/// #[derive(Default)]
/// struct Registry {
///     name: String,
/// }
///
/// impl Singleton for Registry {}
///
/// let a = LazySingleton::<Registry>::instance();
/// let b = LazySingleton::<Registry>::instance();
/// assert!(std::ptr::eq(a, b));
/// assert!(a.name.is_empty());
/// ```
pub struct LazySingleton<T> {
    _never: Infallible,
    _type: PhantomData<fn() -> T>,
}

impl<T: Singleton> LazySingleton<T> {
    /// The single `T` of this process, constructed on first call
    ///
    /// Concurrent first callers block until construction completes; exactly
    /// one of them runs `T::default()`.
    pub fn instance() -> &'static T {
        slot::<T>().get_or_init()
    }
}

/// Per-type storage behind a [`LazySingleton`]
struct Slot<T> {
    state: AtomicU8,
    constructor: AtomicU64,
    parked: ConditionVariable<()>,
    value: UnsafeCell<MaybeUninit<T>>,
}

// The value is written once while Constructing, then only read until teardown.
unsafe impl<T: Send + Sync> Sync for Slot<T> {}

impl<T: Singleton> Slot<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINITIALIZED),
            constructor: AtomicU64::new(NONE),
            parked: ConditionVariable::new(Arc::new(MutexLock::new(()))),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    fn get_or_init(&'static self) -> &'static T {
        self.get_or_init_with(register_teardown)
    }

    /// `get_or_init`, handing the freshly built slot to `on_ready`
    fn get_or_init_with(&'static self, on_ready: fn(&'static dyn Teardown)) -> &'static T {
        loop {
            match self.state.load(Ordering::Acquire) {
                // SAFETY: Ready and Leaked are only reached after the value is written.
                READY | LEAKED => return unsafe { self.get_unchecked() },
                UNINITIALIZED => {
                    if self
                        .state
                        .compare_exchange(
                            UNINITIALIZED,
                            CONSTRUCTING,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        return self.construct(on_ready);
                    }
                }
                CONSTRUCTING => self.park(),
                _ => fatal(SyncFault::SingletonDestroyed {
                    type_name: type_name::<T>(),
                }),
            }
        }
    }

    /// Run the constructor; the caller won the Constructing CAS
    fn construct(&'static self, on_ready: fn(&'static dyn Teardown)) -> &'static T {
        self.constructor
            .store(thread_id::current(), Ordering::Relaxed);

        let rollback = Rollback { slot: self };
        let value = T::default();
        mem::forget(rollback);

        // SAFETY: only the Constructing thread touches the cell, and readers
        // wait for the Release store in `transition`.
        unsafe { (*self.value.get()).write(value) };
        self.transition(READY);
        trace!(singleton = type_name::<T>(), "singleton constructed");

        on_ready(self);
        // SAFETY: written above.
        unsafe { self.get_unchecked() }
    }

    /// Sleep until the constructing thread finishes or rolls back
    fn park(&self) {
        if self.constructor.load(Ordering::Relaxed) == thread_id::current() {
            fatal(SyncFault::RecursiveInit {
                type_name: type_name::<T>(),
            });
        }

        let mut guard = self.parked.mutex().lock();
        while self.state.load(Ordering::Acquire) == CONSTRUCTING {
            self.parked.wait(&mut guard);
        }
    }

    /// Publish a new state to parked threads
    fn transition(&self, to: u8) {
        let _guard = self.parked.mutex().lock();
        self.state.store(to, Ordering::Release);
        self.parked.notify_all();
    }

    /// # Safety
    /// The value must have been written (state Ready or Leaked).
    #[inline]
    unsafe fn get_unchecked(&self) -> &T {
        (*self.value.get()).assume_init_ref()
    }
}

/// Resets a slot whose constructor unwound
struct Rollback<T: Singleton> {
    slot: &'static Slot<T>,
}

impl<T: Singleton> Drop for Rollback<T> {
    fn drop(&mut self) {
        warn!(
            singleton = type_name::<T>(),
            "singleton constructor panicked, slot reset"
        );
        self.slot.constructor.store(NONE, Ordering::Relaxed);
        self.slot.transition(UNINITIALIZED);
    }
}

/// Exit-time teardown of one registered instance
trait Teardown: Send + Sync {
    fn teardown(&self);
}

impl<T: Singleton> Teardown for Slot<T> {
    fn teardown(&self) {
        if T::NO_DESTROY {
            if self
                .state
                .compare_exchange(READY, LEAKED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!(singleton = type_name::<T>(), "singleton leaked at teardown");
            }
            return;
        }

        if self
            .state
            .compare_exchange(READY, DESTROYED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // SAFETY: the CAS out of Ready happens once, so the value is dropped once.
            unsafe { (*self.value.get()).assume_init_drop() };
            debug!(singleton = type_name::<T>(), "singleton destroyed");
        }
    }
}

type SlotRef = &'static (dyn Any + Send + Sync);

static SLOTS: OnceLock<DashMap<TypeId, SlotRef, RandomState>> = OnceLock::new();
static TEARDOWN: Mutex<Vec<&'static dyn Teardown>> = const_mutex(Vec::new());
static EXIT_HOOK: Once = Once::new();

/// Slot for `T`, allocated (never freed) on first lookup
///
/// The shard lock is released before the slot is used, so constructors may
/// request other singletons.
fn slot<T: Singleton>() -> &'static Slot<T> {
    let slots = SLOTS.get_or_init(|| DashMap::with_hasher(RandomState::new()));
    let key = TypeId::of::<T>();

    let found: SlotRef = match slots.get(&key) {
        Some(entry) => *entry,
        None => *slots.entry(key).or_insert_with(|| {
            let slot: &'static Slot<T> = Box::leak(Box::new(Slot::new()));
            slot as SlotRef
        }),
    };

    match found.downcast_ref::<Slot<T>>() {
        Some(slot) => slot,
        None => unreachable!("singleton slot registered under a foreign TypeId"),
    }
}

fn register_teardown(slot: &'static dyn Teardown) {
    EXIT_HOOK.call_once(install_exit_hook);
    TEARDOWN.lock().push(slot);
}

fn install_exit_hook() {
    // SAFETY: `teardown_at_exit` is a plain extern "C" fn with no captured state.
    if unsafe { libc::atexit(teardown_at_exit) } != 0 {
        fatal(SyncFault::ExitHookRegistration);
    }
}

extern "C" fn teardown_at_exit() {
    run_teardown();
}

/// Tear down every constructed singleton, newest first
///
/// Repeats until no registrations are left, so singletons constructed by a
/// `Drop` during the pass are handled too. Each instance is handled at most once.
pub(crate) fn run_teardown() {
    loop {
        let pending = mem::take(&mut *TEARDOWN.lock());
        if pending.is_empty() {
            break;
        }
        debug!(count = pending.len(), "tearing down singletons");
        for slot in pending.into_iter().rev() {
            slot.teardown();
        }
    }
}

/// Run the exit-time singleton teardown now
///
/// Exists for tests that check teardown without exiting the process.
///
/// ```compile_fail
/// netbase_sync::teardown_singletons();
/// ```
///
/// # Safety
///
/// Every destroyed instance is dropped in place. No `&'static T` obtained
/// from [`LazySingleton::instance`] for a type without `NO_DESTROY` may be
/// used after this call, and no other thread may be using one during it.
#[doc(hidden)]
pub unsafe fn teardown_singletons() {
    run_teardown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    static SLOW_BUILDS: AtomicUsize = AtomicUsize::new(0);

    struct SlowToBuild {
        id: usize,
    }

    impl Default for SlowToBuild {
        fn default() -> Self {
            thread::sleep(Duration::from_millis(20));
            Self {
                id: SLOW_BUILDS.fetch_add(1, Ordering::SeqCst),
            }
        }
    }

    impl Singleton for SlowToBuild {}

    #[test]
    fn test_concurrent_first_access_constructs_once() {
        const THREADS: usize = 8;
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    LazySingleton::<SlowToBuild>::instance() as *const SlowToBuild as usize
                })
            })
            .collect();

        let addresses: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addresses.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(SLOW_BUILDS.load(Ordering::SeqCst), 1);
        assert_eq!(LazySingleton::<SlowToBuild>::instance().id, 0);
    }

    #[derive(Default)]
    struct First(u8);
    impl Singleton for First {}

    #[derive(Default)]
    struct Second(u8);
    impl Singleton for Second {}

    #[test]
    fn test_types_get_distinct_instances() {
        let first = LazySingleton::<First>::instance() as *const First as usize;
        let second = LazySingleton::<Second>::instance() as *const Second as usize;
        assert_ne!(first, second);
    }

    static FLAKY_ATTEMPTS: AtomicUsize = AtomicUsize::new(0);

    struct Flaky {
        attempt: usize,
    }

    impl Default for Flaky {
        fn default() -> Self {
            let attempt = FLAKY_ATTEMPTS.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt == 1 {
                panic!("first construction fails");
            }
            Self { attempt }
        }
    }

    impl Singleton for Flaky {}

    #[test]
    fn test_panicking_constructor_rolls_back() {
        let first = panic::catch_unwind(|| {
            LazySingleton::<Flaky>::instance();
        });
        assert!(first.is_err());

        assert_eq!(LazySingleton::<Flaky>::instance().attempt, 2);
        assert_eq!(FLAKY_ATTEMPTS.load(Ordering::SeqCst), 2);
    }

    struct Ouroboros;

    impl Default for Ouroboros {
        fn default() -> Self {
            LazySingleton::<Ouroboros>::instance();
            Ouroboros
        }
    }

    impl Singleton for Ouroboros {}

    #[test]
    fn test_recursive_construction_is_fatal() {
        let result = panic::catch_unwind(|| {
            LazySingleton::<Ouroboros>::instance();
        });
        let payload = result.unwrap_err();
        assert!(matches!(
            payload.downcast_ref::<SyncFault>(),
            Some(SyncFault::RecursiveInit { .. })
        ));
    }

    #[derive(Default)]
    struct Inner(u32);
    impl Singleton for Inner {}

    struct Outer(u32);

    impl Default for Outer {
        fn default() -> Self {
            Outer(LazySingleton::<Inner>::instance().0 + 1)
        }
    }

    impl Singleton for Outer {}

    #[test]
    fn test_constructor_may_use_other_singletons() {
        assert_eq!(LazySingleton::<Outer>::instance().0, 1);
    }

    static COUNTED_DROPS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default)]
    struct Counted;

    impl Drop for Counted {
        fn drop(&mut self) {
            COUNTED_DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Singleton for Counted {}

    static PINNED_DROPS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default)]
    struct Pinned;

    impl Drop for Pinned {
        fn drop(&mut self) {
            PINNED_DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Singleton for Pinned {
        const NO_DESTROY: bool = true;
    }

    /// Skips exit-time registration for slots owned by a single test
    fn unregistered(_: &'static dyn Teardown) {}

    #[test]
    fn test_slot_teardown_destroys_once() {
        let slot: &'static Slot<Counted> = Box::leak(Box::new(Slot::new()));
        slot.get_or_init_with(unregistered);

        slot.teardown();
        slot.teardown();
        assert_eq!(COUNTED_DROPS.load(Ordering::SeqCst), 1);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            slot.get_or_init_with(unregistered);
        }));
        assert!(matches!(
            result.unwrap_err().downcast_ref::<SyncFault>(),
            Some(SyncFault::SingletonDestroyed { .. })
        ));
    }

    #[test]
    fn test_slot_teardown_leaks_no_destroy() {
        let slot: &'static Slot<Pinned> = Box::leak(Box::new(Slot::new()));
        let before = slot.get_or_init_with(unregistered) as *const Pinned;

        slot.teardown();
        assert_eq!(PINNED_DROPS.load(Ordering::SeqCst), 0);
        assert_eq!(slot.state.load(Ordering::Acquire), LEAKED);
        assert_eq!(slot.get_or_init_with(unregistered) as *const Pinned, before);

        let registered = TEARDOWN
            .lock()
            .iter()
            .any(|entry| std::ptr::addr_eq(*entry as *const dyn Teardown, slot));
        assert!(!registered);
    }
}
