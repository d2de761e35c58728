//! The lock module.
//!
//! Contains the synchronization primitives of the kernel: busy-waiting spin
//! locks for short critical sections over scheduler- and VM-visible state,
//! and the sleeping primitives (semaphore, lock with priority donation,
//! condition variable) that suspend the calling thread through the scheduler.

mod condvar;
mod semaphore;
mod sleeplock;
mod spinlock;

pub use condvar::Condvar;
pub use semaphore::Semaphore;
pub use sleeplock::{Lock, LockId};
pub use spinlock::{SpinLock, SpinLockGuard};
