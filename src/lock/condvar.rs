//! Condition variables.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::kernel::Kernel;
use crate::thread::Tid;

use super::{Lock, Semaphore, SpinLock};

/// A condition variable: a queue of one-shot semaphores, one per waiter.
///
/// All operations require the associated lock to be held by the caller.
pub struct Condvar {
    waiters: SpinLock<Vec<Waiter>>,
}

struct Waiter {
    tid: Tid,
    sema: Arc<Semaphore>,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new("condvar", Vec::new()),
        }
    }

    /// Atomically releases `lock` and waits for a signal, reacquiring the
    /// lock before returning.
    pub fn wait(&self, lock: &Lock, kernel: &Kernel) {
        let cur = kernel.current_tid();
        assert_eq!(lock.held_by(kernel), Some(cur), "wait without the lock");
        let sema = Arc::new(Semaphore::new(0));
        self.waiters.lock().push(Waiter {
            tid: cur,
            sema: Arc::clone(&sema),
        });
        lock.release(kernel);
        sema.down(kernel);
        lock.acquire(kernel);
    }

    /// Wakes the highest-priority waiter, if any.
    pub fn signal(&self, lock: &Lock, kernel: &Kernel) {
        assert_eq!(
            lock.held_by(kernel),
            Some(kernel.current_tid()),
            "signal without the lock"
        );
        let woken = {
            let mut waiters = self.waiters.lock();
            if waiters.is_empty() {
                None
            } else {
                let sched = kernel.sched().lock();
                let top = (0..waiters.len())
                    .max_by_key(|&i| sched.threads[&waiters[i].tid].priority)
                    .unwrap();
                drop(sched);
                Some(waiters.remove(top).sema)
            }
        };
        if let Some(sema) = woken {
            sema.up(kernel);
        }
    }

    /// Wakes every waiter.
    pub fn broadcast(&self, lock: &Lock, kernel: &Kernel) {
        while !self.waiters.lock().is_empty() {
            self.signal(lock, kernel);
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::test_kernel;

    #[test]
    fn signal_picks_highest_priority_waiter() {
        let kernel = test_kernel();
        let lock = Lock::new();
        let cond = Condvar::new();
        let (lo, hi) = {
            let mut sched = kernel.sched().lock();
            (sched.spawn("lo", 5), sched.spawn("hi", 25))
        };
        let lo_sema = Arc::new(Semaphore::new(0));
        let hi_sema = Arc::new(Semaphore::new(0));
        {
            let mut waiters = cond.waiters.lock();
            waiters.push(Waiter {
                tid: lo,
                sema: Arc::clone(&lo_sema),
            });
            waiters.push(Waiter {
                tid: hi,
                sema: Arc::clone(&hi_sema),
            });
        }
        lock.acquire(&kernel);
        cond.signal(&lock, &kernel);
        assert_eq!(hi_sema.value(), 1);
        assert_eq!(lo_sema.value(), 0);
        cond.broadcast(&lock, &kernel);
        assert_eq!(lo_sema.value(), 1);
        lock.release(&kernel);
    }
}
