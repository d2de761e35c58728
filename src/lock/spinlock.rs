//! Spin locks.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Mutual exclusion lock that busy waits (spins).
///
/// On the single CPU this kernel targets, a spin lock stands in for the
/// interrupts-off critical sections that protect scheduler- and VM-visible
/// state; critical sections must stay short and must not suspend.
pub struct SpinLock<T> {
    /// Name of lock, for debugging.
    name: &'static str,

    locked: AtomicBool,

    data: UnsafeCell<T>,
}

// SAFETY: the lock provides mutual exclusion over `data`.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

/// Guards of `SpinLock<T>`.
pub struct SpinLockGuard<'s, T> {
    lock: &'s SpinLock<T>,
}

impl<T> SpinLock<T> {
    /// Returns a new `SpinLock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock and returns the lock guard.
    ///
    /// To ensure that all stores done in one critical section are visible in
    /// the next critical section's loads, acquisition uses an atomic exchange
    /// with `Acquire` ordering, paired with a `Release` store on release.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
        SpinLockGuard { lock: self }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns a mutable reference to the inner data without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_round_trip() {
        let lock = SpinLock::new("test", 7);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 8);
        assert_eq!(lock.name(), "test");
    }
}
