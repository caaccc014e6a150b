//! Thread-safety strategies, chosen per allocator instance at construction.
//!
//! The allocator data structures themselves are plain single-owner state. A
//! [`PolicyCell`] pairs that state with a [`LockPolicy`] and only hands out
//! `&mut` access inside one critical section.

use crate::sync::cell::{Cell, UnsafeCell};
use crate::sync::{Mutex, MutexGuard, PoisonError};

/// A mutual-exclusion strategy.
///
/// # Safety
/// While a guard returned by `acquire` is alive, no other guard from the same
/// policy value may exist on any thread that can reach it. `PolicyCell` hands
/// out `&mut T` on the strength of this.
pub unsafe trait LockPolicy: Default {
    type Guard<'a>
    where
        Self: 'a;

    fn acquire(&self) -> Self::Guard<'_>;
}

/// No locking. The cell is `!Sync`, so it can only be reached from one thread.
///
/// Re-entrant use (e.g. a callback allocating from the allocator it was called
/// from) is caught and panics instead of aliasing the state.
#[derive(Debug)]
pub struct SingleThreaded {
    busy: Cell<bool>,
}

impl Default for SingleThreaded {
    fn default() -> Self {
        Self {
            busy: Cell::new(false),
        }
    }
}

pub struct SingleThreadedGuard<'a> {
    busy: &'a Cell<bool>,
}

impl Drop for SingleThreadedGuard<'_> {
    fn drop(&mut self) {
        self.busy.set(false);
    }
}

// Safety: `SingleThreaded` is `!Sync` (it holds a `Cell`), so guards can only be
// taken on one thread, and the busy flag rejects a second guard on that thread.
unsafe impl LockPolicy for SingleThreaded {
    type Guard<'a> = SingleThreadedGuard<'a>;

    fn acquire(&self) -> Self::Guard<'_> {
        assert!(
            !self.busy.replace(true),
            "allocator re-entered while already inside a call"
        );
        SingleThreadedGuard { busy: &self.busy }
    }
}

/// One mutex around the whole call.
#[derive(Debug)]
pub struct MultiThreaded {
    lock: Mutex<()>,
}

impl Default for MultiThreaded {
    fn default() -> Self {
        Self {
            lock: Mutex::new(()),
        }
    }
}

// Safety: a held `MutexGuard` excludes every other guard of the same mutex.
unsafe impl LockPolicy for MultiThreaded {
    type Guard<'a> = MutexGuard<'a, ()>;

    fn acquire(&self) -> Self::Guard<'_> {
        // The protected data lives outside the mutex; a panic mid-call leaves
        // it in whatever state the allocator reached, so poisoning adds nothing.
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State guarded by a [`LockPolicy`].
pub struct PolicyCell<T, L: LockPolicy> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: all shared access to `value` goes through `with`, which holds the
// policy guard for the duration. A `Sync` policy serialises callers across
// threads; `T: Send` because the state may be touched from any of them.
unsafe impl<T: Send, L: LockPolicy + Sync> Sync for PolicyCell<T, L> {}

impl<T, L: LockPolicy> PolicyCell<T, L> {
    pub fn new(value: T) -> Self {
        Self {
            lock: L::default(),
            value: UnsafeCell::new(value),
        }
    }

    /// Run `f` with exclusive access to the state, inside one critical section.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _guard = self.lock.acquire();
        // Safety: the guard grants exclusive access per `LockPolicy`'s contract.
        let value = crate::sync::unsafe_cell_get_mut!(self.value);
        f(value)
    }

    /// Exclusive access without locking; `&mut self` already proves it.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        // Safety: `&mut self` rules out any other access.
        crate::sync::unsafe_cell_get_mut!(self.value)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::{Arc, thread};

    #[test]
    fn test_single_threaded_releases_on_drop() {
        let cell: PolicyCell<u32, SingleThreaded> = PolicyCell::new(1);
        cell.with(|v| *v += 1);
        cell.with(|v| *v += 1);
        assert_eq!(cell.with(|v| *v), 3);
    }

    #[test]
    #[should_panic(expected = "re-entered")]
    fn test_single_threaded_detects_reentry() {
        let cell: PolicyCell<u32, SingleThreaded> = PolicyCell::new(0);
        cell.with(|_| cell.with(|v| *v += 1));
    }

    #[test]
    fn test_single_threaded_recovers_after_panic() {
        let cell: PolicyCell<u32, SingleThreaded> = PolicyCell::new(0);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cell.with(|_| panic!("boom"));
        }));
        assert!(result.is_err());
        cell.with(|v| *v = 5);
        assert_eq!(cell.with(|v| *v), 5);
    }

    #[test]
    fn test_multi_threaded_serialises_updates() {
        let cell: Arc<PolicyCell<usize, MultiThreaded>> = Arc::new(PolicyCell::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        cell.with(|v| *v += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cell.with(|v| *v), 4000);
    }

    #[test]
    fn test_get_mut_bypasses_lock() {
        let mut cell: PolicyCell<Vec<u8>, MultiThreaded> = PolicyCell::new(Vec::new());
        cell.get_mut().push(3);
        assert_eq!(cell.with(|v| v.len()), 1);
    }
}
