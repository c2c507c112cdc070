//! Spinlock guarding the consumer list of a streaming task.
//!
//! Critical sections are a handful of instructions, and under `loom` the lock
//! is built on the model's atomics so its exclusion is checked as well.

use crate::sync::{AtomicBool, Ordering, UnsafeCell, spin_hint};
#[cfg(not(feature = "loom"))]
use crate::sync::LoomUnsafeCellCompat;
use core::fmt;

/// Test-and-test-and-set lock for very short critical sections.
///
/// Used where the lock is almost never contended and a kernel-assisted mutex
/// would cost more than the protected work.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reachable through `with`, which holds the lock.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Runs `f` with exclusive access to the protected value.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _guard = self.acquire();
        // SAFETY: the lock is held until `_guard` drops, after `f` returned.
        self.data.with_mut(|ptr| unsafe { f(&mut *ptr) })
    }

    fn acquire(&self) -> SpinGuard<'_> {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinGuard { locked: &self.locked };
            }
            while self.locked.load(Ordering::Relaxed) {
                spin_hint();
            }
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

struct SpinGuard<'a> {
    locked: &'a AtomicBool,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.locked.store(false, Ordering::Release);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn increments_are_not_lost() {
        let lock = SpinLock::new(0usize);
        let threads = 8;
        let per_thread = 2_000;
        thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    for _ in 0..per_thread {
                        lock.with(|value| *value += 1);
                    }
                });
            }
        });
        assert_eq!(lock.with(|value| *value), threads * per_thread);
    }
}
