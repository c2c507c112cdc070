#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::{
        cell::UnsafeCell,
        sync::{
            Mutex, MutexGuard,
            atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        },
        thread,
    };

    /// Busy-wait hint. Under `loom` every spin must yield, otherwise the model
    /// checker explores an unbounded number of identical iterations.
    #[inline]
    pub(crate) fn spin_hint() {
        thread::yield_now();
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use core::{
        cell::UnsafeCell,
        sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    };
    pub(crate) use std::{
        sync::{Mutex, MutexGuard},
        thread,
    };

    #[inline]
    pub(crate) fn spin_hint() {
        core::hint::spin_loop();
    }

    /// Gives `core::cell::UnsafeCell` the closure-based accessor of
    /// `loom::cell::UnsafeCell`, so callers are written once for both.
    pub(crate) trait LoomUnsafeCellCompat<T> {
        fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R;
        fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R;
    }

    impl<T> LoomUnsafeCellCompat<T> for UnsafeCell<T> {
        #[inline]
        fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
            f(self.get())
        }

        #[inline]
        fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
            f(self.get())
        }
    }
}

pub(crate) use imp::*;

/// Locks a mutex, ignoring poisoning.
///
/// Every critical section in this crate is a push/pop on a plain collection that
/// cannot leave it half-updated, so a poisoned lock still holds consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
