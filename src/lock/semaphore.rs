//! Counting semaphores.

use alloc::vec::Vec;

use crate::kernel::Kernel;
use crate::thread::{ThreadState, Tid};

use super::SpinLock;

/// A counting semaphore: a non-negative counter plus a waiter list.
///
/// Waiters are woken in priority order, so the highest-priority waiter runs
/// next upon `up`.
pub struct Semaphore {
    inner: SpinLock<SemaInner>,
}

struct SemaInner {
    value: i64,
    waiters: Vec<Tid>,
}

impl Semaphore {
    pub const fn new(value: i64) -> Self {
        Self {
            inner: SpinLock::new("sema", SemaInner {
                value,
                waiters: Vec::new(),
            }),
        }
    }

    /// Down or "P": waits for the value to become positive, then decrements
    /// it. Blocks the calling thread; must not be invoked from an interrupt
    /// context.
    pub fn down(&self, kernel: &Kernel) {
        loop {
            let mut inner = self.inner.lock();
            if inner.value > 0 {
                inner.value -= 1;
                return;
            }
            // Register and suspend atomically with respect to `up`: the
            // waiter list entry and the state transition happen before the
            // semaphore is unlocked.
            let mut sched = kernel.sched().lock();
            let cur = sched.current;
            inner.waiters.push(cur);
            drop(inner);
            sched.block_current();
        }
    }

    /// Down without waiting. Returns true if the semaphore was decremented.
    pub fn try_down(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.value > 0 {
            inner.value -= 1;
            true
        } else {
            false
        }
    }

    /// Up or "V": increments the value and wakes the highest-priority
    /// waiter, yielding to it when it outranks the running thread.
    pub fn up(&self, kernel: &Kernel) {
        let mut preempt = false;
        {
            let mut inner = self.inner.lock();
            inner.value += 1;
            if !inner.waiters.is_empty() {
                let mut sched = kernel.sched().lock();
                let top = (0..inner.waiters.len())
                    .max_by_key(|&i| sched.threads[&inner.waiters[i]].priority)
                    .unwrap();
                let tid = inner.waiters.remove(top);
                sched.unblock(tid);
                // A dying thread's final `up` must not requeue it.
                preempt = sched.preempt_needed()
                    && sched.threads[&sched.current].state == ThreadState::Running;
            }
        }
        if preempt {
            kernel.thread_yield();
        }
    }

    pub fn value(&self) -> i64 {
        self.inner.lock().value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::test_kernel;

    #[test]
    fn down_and_up_adjust_value() {
        let kernel = test_kernel();
        let sema = Semaphore::new(2);
        sema.down(&kernel);
        sema.down(&kernel);
        assert_eq!(sema.value(), 0);
        assert!(!sema.try_down());
        sema.up(&kernel);
        assert_eq!(sema.value(), 1);
        assert!(sema.try_down());
    }

    #[test]
    fn up_wakes_highest_priority_waiter() {
        let kernel = test_kernel();
        let sema = Semaphore::new(0);
        let (lo, hi) = {
            let mut sched = kernel.sched().lock();
            let lo = sched.spawn("lo", 10);
            let hi = sched.spawn("hi", 50);
            (lo, hi)
        };
        // Both threads are parked on the waiter list.
        {
            let mut inner = sema.inner.lock();
            inner.waiters.push(lo);
            inner.waiters.push(hi);
        }
        sema.up(&kernel);
        {
            // hi outranks the running thread, so the wakeup preempted to it.
            let sched = kernel.sched().lock();
            assert_eq!(sched.current, hi);
            assert_eq!(sched.threads[&lo].state, ThreadState::Blocked);
        }
        sema.up(&kernel);
        let sched = kernel.sched().lock();
        assert_eq!(sched.threads[&lo].state, ThreadState::Ready);
    }
}
