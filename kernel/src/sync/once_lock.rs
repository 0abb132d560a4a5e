//! Safe one-time global initialization.
//!
//! Provides a `no_std`-compatible alternative to `std::sync::OnceLock` for the
//! handful of process-wide singletons the memory core owns (the `Page` table,
//! the memory-map copy, the kernel address-space context). Backed by
//! `AtomicPtr` plus a leaked heap allocation rather than `static mut`.

use core::sync::atomic::{AtomicPtr, Ordering};

use alloc::boxed::Box;

/// A cell that can be written to at most once.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Returns the value if initialized.
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: a non-null pointer was stored by `set()` via `Box::into_raw`
            // and is never freed while the OnceLock is alive (see Drop). The
            // Acquire load synchronizes-with the Release store in `set()`, so the
            // pointee is fully initialized here.
            Some(unsafe { &*ptr })
        }
    }

    /// Initializes the cell. Returns `Err(value)` if already initialized.
    pub fn set(&self, value: T) -> Result<(), T> {
        let ptr = Box::into_raw(Box::new(value));
        match self
            .inner
            .compare_exchange(core::ptr::null_mut(), ptr, Ordering::Release, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: `ptr` was just produced by `Box::into_raw` above and the
                // compare_exchange failure means no one else observed or took it.
                let boxed = unsafe { Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }

    /// Empties the cell and returns its previous value, if any. Meant for
    /// test teardown between cases that each need a fresh singleton; nothing
    /// in the running kernel ever calls this.
    pub fn take(&self) -> Option<T> {
        let ptr = self.inner.swap(core::ptr::null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: `ptr` was produced by `Box::into_raw` in `set()`, and the
            // swap means no other call can observe or take the same pointer.
            Some(*unsafe { Box::from_raw(ptr) })
        }
    }

    /// Returns the value, initializing it with `f` if this is the first call.
    pub fn get_or_init<F>(&self, f: F) -> &'static T
    where
        F: FnOnce() -> T,
    {
        if let Some(val) = self.get() {
            return val;
        }
        let value = f();
        let _ = self.set(value);
        self.get()
            .expect("OnceLock::get_or_init: get() failed after set()")
    }
}

// SAFETY: the inner value is heap-allocated and reached only through the
// AtomicPtr with Acquire/Release ordering, so transferring/sharing is safe
// whenever T itself permits it.
unsafe impl<T: Send> Send for OnceLock<T> {}
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        let ptr = self.inner.load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: we have exclusive access in `drop`, and `ptr` was produced
            // by `Box::into_raw` in `set()`.
            unsafe {
                drop(Box::from_raw(ptr));
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn set_then_get() {
        let lock: OnceLock<u32> = OnceLock::new();
        assert!(lock.get().is_none());
        assert!(lock.set(42).is_ok());
        assert_eq!(*lock.get().unwrap(), 42);
        assert_eq!(lock.set(100), Err(100));
    }

    #[test]
    fn get_or_init_runs_once() {
        let lock: OnceLock<u32> = OnceLock::new();
        assert_eq!(*lock.get_or_init(|| 7), 7);
        assert_eq!(*lock.get_or_init(|| 9), 7);
    }
}
