//! Sleeping mutual-exclusion lock with priority donation.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::kernel::Kernel;
use crate::thread::Tid;

use super::Semaphore;

/// Identifies a `Lock` in the scheduler's donation bookkeeping.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct LockId(u32);

static NEXT_LOCK_ID: AtomicU32 = AtomicU32::new(0);

/// A mutex built on a binary semaphore, with an owner and donation
/// bookkeeping.
///
/// When a thread tries to acquire a lock held by a lower-priority thread,
/// the acquirer's effective priority transfers to the holder, recursively
/// along the holder's own wait-for chain. Releasing withdraws the donations
/// that arrived through this lock. Recursive acquisition is disallowed.
pub struct Lock {
    id: LockId,
    sema: Semaphore,
}

impl Lock {
    pub fn new() -> Self {
        Self {
            id: LockId(NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed)),
            sema: Semaphore::new(1),
        }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    /// Acquires the lock, sleeping until it becomes available and donating
    /// priority to the holder chain while waiting.
    pub fn acquire(&self, kernel: &Kernel) {
        let cur = {
            let mut sched = kernel.sched().lock();
            let cur = sched.current;
            let holder = sched.holder(self.id);
            assert_ne!(holder, Some(cur), "recursive lock acquisition");
            if !sched.mlfqs {
                if holder.is_some() {
                    sched.donate(cur, self.id);
                }
            }
            cur
        };
        self.sema.down(kernel);
        kernel.sched().lock().lock_acquired(cur, self.id);
    }

    /// Acquires the lock only if it is free. No donation happens on failure.
    pub fn try_acquire(&self, kernel: &Kernel) -> bool {
        if !self.sema.try_down() {
            return false;
        }
        let mut sched = kernel.sched().lock();
        let cur = sched.current;
        sched.lock_acquired(cur, self.id);
        true
    }

    /// Releases the lock, withdrawing the donations contributed through it.
    pub fn release(&self, kernel: &Kernel) {
        {
            let mut sched = kernel.sched().lock();
            let cur = sched.current;
            assert_eq!(sched.holder(self.id), Some(cur), "release by non-holder");
            sched.lock_released(cur, self.id);
        }
        self.sema.up(kernel);
    }

    pub fn held_by(&self, kernel: &Kernel) -> Option<Tid> {
        kernel.sched().lock().holder(self.id)
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::test_kernel;

    #[test]
    fn acquire_release_tracks_owner() {
        let kernel = test_kernel();
        let lock = Lock::new();
        assert_eq!(lock.held_by(&kernel), None);
        lock.acquire(&kernel);
        assert_eq!(lock.held_by(&kernel), Some(kernel.current_tid()));
        lock.release(&kernel);
        assert_eq!(lock.held_by(&kernel), None);
    }

    #[test]
    fn try_acquire_fails_on_held_lock() {
        let kernel = test_kernel();
        let lock = Lock::new();
        assert!(lock.try_acquire(&kernel));
        assert!(!lock.try_acquire(&kernel));
        lock.release(&kernel);
        assert!(lock.try_acquire(&kernel));
        lock.release(&kernel);
    }

    /// The donation-chain scenario: L (10) holds A; M (20) holds B and
    /// requests A; H (30) requests B. L's effective priority becomes 30
    /// until it releases A, then reverts to 10.
    #[test]
    fn priority_donation_chains_transitively() {
        let kernel = test_kernel();
        let lock_a = Lock::new();
        let lock_b = Lock::new();
        let (l, m, h) = {
            let mut sched = kernel.sched().lock();
            let l = sched.spawn("L", 10);
            let m = sched.spawn("M", 20);
            let h = sched.spawn("H", 30);
            (l, m, h)
        };
        {
            let mut sched = kernel.sched().lock();
            sched.lock_acquired(l, lock_a.id());
            sched.lock_acquired(m, lock_b.id());
        }
        // M blocks on A: L inherits 20.
        kernel.sched().lock().donate(m, lock_a.id());
        assert_eq!(kernel.sched().lock().threads[&l].priority, 20);
        // H blocks on B: M inherits 30, and so does L through the chain.
        kernel.sched().lock().donate(h, lock_b.id());
        {
            let sched = kernel.sched().lock();
            assert_eq!(sched.threads[&m].priority, 30);
            assert_eq!(sched.threads[&l].priority, 30);
        }
        // L releases A: its donations through A disappear.
        kernel.sched().lock().lock_released(l, lock_a.id());
        {
            let sched = kernel.sched().lock();
            assert_eq!(sched.threads[&l].priority, 10);
            assert_eq!(sched.threads[&m].priority, 30);
        }
        // M releases B and drops back to its base priority.
        kernel.sched().lock().lock_released(m, lock_b.id());
        assert_eq!(kernel.sched().lock().threads[&m].priority, 20);
    }

    #[test]
    fn set_priority_respects_live_donations() {
        let kernel = test_kernel();
        let lock = Lock::new();
        lock.acquire(&kernel);
        let donor = {
            let mut sched = kernel.sched().lock();
            let donor = sched.spawn("donor", 60);
            donor
        };
        kernel.sched().lock().donate(donor, lock.id());
        assert_eq!(kernel.thread_get_priority(), 60);
        // Lowering the base priority keeps the donated effective priority.
        kernel.thread_set_priority(5);
        assert_eq!(kernel.thread_get_priority(), 60);
        lock.release(&kernel);
        assert_eq!(kernel.thread_get_priority(), 5);
    }
}
