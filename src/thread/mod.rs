//! Threads and the scheduler.
//!
//! A `Thread` is the unit of scheduling; a user process is a thread with an
//! address space, a file-descriptor table and a working directory attached.
//! All thread control blocks live inside the scheduler's spin lock, which
//! plays the role the interrupts-off discipline plays on real hardware.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use array_macro::array;
use arrayvec::ArrayString;

use crate::error::{KernelError, Result};
use crate::file::File;
use crate::fixedpoint::Fixed;
use crate::fs::Inode;
use crate::kernel::Kernel;
use crate::lock::{LockId, Semaphore};
use crate::param::{MAXTHREADNAME, NOFILE, PRI_MAX, PRI_MIN};
use crate::syscall::TrapFrame;
use crate::vm::AsId;

mod scheduler;

pub use scheduler::Sched;

pub type Tid = i32;

pub const TID_ERROR: Tid = -1;

/// States in a thread's life cycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadState {
    /// Running thread. Exactly one per CPU.
    Running,
    /// Not running but ready to run; on the ready queue.
    Ready,
    /// Waiting for an event to trigger; on a wait list or the sleep queue.
    Blocked,
    /// Exited; holds its status until the parent reaps it.
    Dying,
}

pub type FdTable = [Option<Arc<File>>; NOFILE];

/// A kernel thread or user process.
pub struct Thread {
    pub tid: Tid,
    pub name: ArrayString<MAXTHREADNAME>,
    pub state: ThreadState,

    /// Effective priority: `max(base_priority, donors)`.
    pub priority: i32,
    pub base_priority: i32,
    /// Threads currently boosting this one, with the lock each donation
    /// arrived through.
    pub donors: Vec<(Tid, LockId)>,
    /// The lock this thread is blocked acquiring, if any.
    pub waiting_lock: Option<LockId>,

    pub nice: i32,
    pub recent_cpu: Fixed,

    /// Absolute tick at which a sleeping thread becomes due.
    pub wake_tick: i64,

    pub exit_status: i32,
    pub parent: Option<Tid>,
    pub children: Vec<Tid>,
    /// Upped on exit; the parent's `wait` downs it.
    pub wait_sema: Arc<Semaphore>,

    pub fds: Box<FdTable>,
    pub wdir: Option<Arc<Inode>>,
    pub as_id: Option<AsId>,
    /// The executable backing this process; writes to it stay denied while
    /// the process runs.
    pub exec_file: Option<Arc<File>>,

    /// User stack pointer stashed on every syscall entry, consulted when a
    /// page fault arrives from kernel mode.
    pub user_rsp: u64,

    /// Saved user context, snapshotted for fork.
    pub tf: TrapFrame,
}

impl Thread {
    fn new(tid: Tid, name: &str, priority: i32) -> Self {
        let mut fds: Box<FdTable> = Box::new(array![_ => None; NOFILE]);
        fds[0] = Some(File::stdin());
        fds[1] = Some(File::stdout());
        Self {
            tid,
            name: truncate_name(name),
            state: ThreadState::Blocked,
            priority,
            base_priority: priority,
            donors: Vec::new(),
            waiting_lock: None,
            nice: 0,
            recent_cpu: Fixed::ZERO,
            wake_tick: 0,
            exit_status: 0,
            parent: None,
            children: Vec::new(),
            wait_sema: Arc::new(Semaphore::new(0)),
            fds,
            wdir: None,
            as_id: None,
            exec_file: None,
            user_rsp: 0,
            tf: TrapFrame::default(),
        }
    }

    /// Allocates the lowest free file descriptor.
    pub fn fd_alloc(&mut self, file: Arc<File>) -> Result<usize> {
        for (fd, slot) in self.fds.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(fd);
            }
        }
        Err(KernelError::TooManyOpenFiles)
    }

    pub fn fd_get(&self, fd: usize) -> Result<Arc<File>> {
        self.fds
            .get(fd)
            .and_then(|slot| slot.clone())
            .ok_or(KernelError::BadFd)
    }

    pub fn fd_take(&mut self, fd: usize) -> Result<Arc<File>> {
        self.fds
            .get_mut(fd)
            .and_then(|slot| slot.take())
            .ok_or(KernelError::BadFd)
    }
}

pub fn truncate_name(name: &str) -> ArrayString<MAXTHREADNAME> {
    let mut out = ArrayString::new();
    for ch in name.chars() {
        if out.try_push(ch).is_err() {
            break;
        }
    }
    out
}

impl Kernel {
    pub fn current_tid(&self) -> Tid {
        self.sched().lock().current
    }

    pub(crate) fn with_current<R>(&self, f: impl FnOnce(&mut Thread) -> R) -> R {
        let mut sched = self.sched().lock();
        let tid = sched.current;
        f(sched.thread_mut(tid))
    }

    /// Creates a new kernel thread and adds it to the ready queue, yielding
    /// if it outranks the caller.
    pub fn thread_spawn(&self, name: &str, priority: i32) -> Tid {
        assert!((PRI_MIN..=PRI_MAX).contains(&priority));
        let preempt = {
            let mut sched = self.sched().lock();
            let tid = sched.spawn(name, priority);
            sched.unblock(tid);
            (tid, sched.preempt_needed())
        };
        if preempt.1 {
            self.thread_yield();
        }
        preempt.0
    }

    /// Yields the CPU. The current thread may be scheduled again immediately
    /// at the scheduler's whim.
    pub fn thread_yield(&self) {
        self.sched().lock().yield_current();
    }

    /// Puts the current thread to sleep until the given absolute tick.
    pub fn thread_sleep_until(&self, wake_tick: i64) {
        self.sched().lock().sleep_current(wake_tick);
    }

    /// Sets the current thread's base priority, recomputing the effective
    /// priority against any remaining donors. No-op under MLFQS.
    pub fn thread_set_priority(&self, new_priority: i32) {
        assert!((PRI_MIN..=PRI_MAX).contains(&new_priority));
        {
            let mut sched = self.sched().lock();
            if sched.mlfqs {
                return;
            }
            let tid = sched.current;
            sched.thread_mut(tid).base_priority = new_priority;
            sched.recompute_priority(tid);
        }
        self.thread_yield();
    }

    pub fn thread_get_priority(&self) -> i32 {
        let sched = self.sched().lock();
        sched.threads[&sched.current].priority
    }

    pub fn thread_set_nice(&self, nice: i32) {
        {
            let mut sched = self.sched().lock();
            let tid = sched.current;
            sched.set_nice(tid, nice);
        }
        self.thread_yield();
    }

    pub fn thread_get_nice(&self) -> i32 {
        let sched = self.sched().lock();
        sched.threads[&sched.current].nice
    }

    /// Returns 100 times the system load average, rounded.
    pub fn thread_get_load_avg(&self) -> i32 {
        self.sched().lock().load_avg.mul_int(100).round()
    }

    /// Returns 100 times the current thread's `recent_cpu`, rounded.
    pub fn thread_get_recent_cpu(&self) -> i32 {
        let sched = self.sched().lock();
        sched.threads[&sched.current].recent_cpu.mul_int(100).round()
    }

    pub fn thread_name(&self) -> String {
        self.with_current(|t| String::from(t.name.as_str()))
    }
}
