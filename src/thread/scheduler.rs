//! The scheduler proper: ready queue, sleep queue, priority donation
//! bookkeeping and the MLFQS accounting.
//!
//! Two interchangeable policies, selected at boot: strict priority with
//! donation (default), or the multi-level feedback queue when `mlfqs` is set.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::fixedpoint::Fixed;
use crate::lock::LockId;
use crate::param::{NICE_MAX, NICE_MIN, PRI_DEFAULT, PRI_MAX, PRI_MIN, TIMER_FREQ, TIME_SLICE};

use super::{Thread, ThreadState, Tid};

pub struct Sched {
    pub threads: BTreeMap<Tid, Thread>,

    /// Ready queue, highest priority first; FIFO among equals.
    ready: Vec<Tid>,

    /// Sleeping threads ordered by wake tick.
    sleep: Vec<(i64, Tid)>,

    /// The one running thread.
    pub current: Tid,

    /// Runs when the ready queue is empty; never queued itself.
    idle: Tid,

    /// Which thread holds which donation-tracking lock.
    lock_holder: BTreeMap<LockId, Tid>,

    pub mlfqs: bool,
    pub load_avg: Fixed,

    ticks: i64,
    slice: i64,
    next_tid: Tid,
}

impl Sched {
    /// Transforms the boot context into the `main` thread and creates the
    /// idle thread.
    pub fn new(mlfqs: bool) -> Self {
        let mut sched = Self {
            threads: BTreeMap::new(),
            ready: Vec::new(),
            sleep: Vec::new(),
            current: 0,
            idle: 0,
            lock_holder: BTreeMap::new(),
            mlfqs,
            load_avg: Fixed::ZERO,
            ticks: 0,
            slice: 0,
            next_tid: 1,
        };
        let main = sched.spawn("main", PRI_DEFAULT);
        sched.thread_mut(main).state = ThreadState::Running;
        sched.current = main;
        let idle = sched.spawn("idle", PRI_MIN);
        sched.idle = idle;
        sched
    }

    pub fn ticks(&self) -> i64 {
        self.ticks
    }

    pub fn thread_mut(&mut self, tid: Tid) -> &mut Thread {
        self.threads.get_mut(&tid).expect("no such thread")
    }

    fn priority_of(&self, tid: Tid) -> i32 {
        self.threads[&tid].priority
    }

    /// Creates a blocked thread and returns its tid.
    pub fn spawn(&mut self, name: &str, priority: i32) -> Tid {
        let priority = if self.mlfqs { PRI_DEFAULT } else { priority };
        let tid = self.next_tid;
        self.next_tid += 1;
        let thread = Thread::new(tid, name, priority);
        assert!(self.threads.insert(tid, thread).is_none());
        tid
    }

    /// Inserts `tid` into the ready queue keeping it priority-ordered,
    /// after any thread of equal priority.
    fn insert_ready(&mut self, tid: Tid) {
        let priority = self.priority_of(tid);
        let pos = self
            .ready
            .iter()
            .position(|&t| self.priority_of(t) < priority)
            .unwrap_or(self.ready.len());
        self.ready.insert(pos, tid);
    }

    /// Transitions a blocked thread to ready. This does not preempt the
    /// running thread; callers check `preempt_needed` afterwards.
    pub fn unblock(&mut self, tid: Tid) {
        assert_eq!(self.threads[&tid].state, ThreadState::Blocked);
        self.thread_mut(tid).state = ThreadState::Ready;
        self.insert_ready(tid);
    }

    /// True if a strictly higher-priority thread than the running one is
    /// ready.
    pub fn preempt_needed(&self) -> bool {
        match self.ready.first() {
            Some(&head) => self.priority_of(head) > self.priority_of(self.current),
            None => false,
        }
    }

    /// Chooses and installs the next thread to run. The caller has already
    /// moved the previous thread wherever it belongs.
    fn schedule(&mut self) {
        let next = if self.ready.is_empty() {
            self.idle
        } else {
            self.ready.remove(0)
        };
        self.thread_mut(next).state = ThreadState::Running;
        self.current = next;
        self.slice = 0;
    }

    /// Blocks the running thread. The caller has put it on a wait list.
    pub fn block_current(&mut self) {
        let cur = self.current;
        self.thread_mut(cur).state = ThreadState::Blocked;
        self.schedule();
    }

    /// Yields the CPU: the running thread goes back to the ready queue.
    pub fn yield_current(&mut self) {
        let cur = self.current;
        if cur != self.idle {
            self.thread_mut(cur).state = ThreadState::Ready;
            self.insert_ready(cur);
        }
        self.schedule();
    }

    /// Marks the running thread dying and schedules another. The thread
    /// remains in the table until its parent reaps it; threads with no
    /// parent are destroyed here.
    pub fn exit_current(&mut self) {
        let cur = self.current;
        if let Some(t) = self.threads.get_mut(&cur) {
            t.state = ThreadState::Dying;
            if t.parent.is_none() {
                let _ = self.threads.remove(&cur);
            }
        }
        self.schedule();
    }

    /// Puts the running thread to sleep until the absolute tick `wake_tick`.
    pub fn sleep_current(&mut self, wake_tick: i64) {
        let cur = self.current;
        assert_ne!(cur, self.idle);
        self.thread_mut(cur).wake_tick = wake_tick;
        let pos = self
            .sleep
            .iter()
            .position(|&(w, _)| w > wake_tick)
            .unwrap_or(self.sleep.len());
        self.sleep.insert(pos, (wake_tick, cur));
        self.block_current();
    }

    /// Wakes every sleeping thread whose wake tick is due.
    fn wake_due(&mut self) {
        while let Some(&(wake, tid)) = self.sleep.first() {
            if wake > self.ticks {
                break;
            }
            let _ = self.sleep.remove(0);
            self.unblock(tid);
        }
    }

    /// Called on every timer tick. Returns true when the running thread
    /// should yield on interrupt return: its time slice is up, or a strictly
    /// higher-priority thread became ready.
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        self.slice += 1;
        self.wake_due();
        if self.mlfqs {
            self.mlfqs_tick();
        }
        self.slice >= TIME_SLICE || self.preempt_needed()
    }

    /// Moves a thread to its correct ready-queue position after a priority
    /// change.
    fn reposition(&mut self, tid: Tid) {
        if self.threads[&tid].state == ThreadState::Ready {
            if let Some(pos) = self.ready.iter().position(|&t| t == tid) {
                let _ = self.ready.remove(pos);
                self.insert_ready(tid);
            }
        }
    }

    /// Recomputes a thread's effective priority as the max of its base
    /// priority and its donors' effective priorities.
    pub fn recompute_priority(&mut self, tid: Tid) {
        let thread = &self.threads[&tid];
        let mut priority = thread.base_priority;
        for &(donor, _) in &thread.donors {
            priority = priority.max(self.priority_of(donor));
        }
        self.thread_mut(tid).priority = priority;
        self.reposition(tid);
    }

    pub fn holder(&self, lock: LockId) -> Option<Tid> {
        self.lock_holder.get(&lock).copied()
    }

    /// Records that `waiter` is about to block on `lock` and transfers its
    /// effective priority up the chain of lock holders.
    pub fn donate(&mut self, waiter: Tid, lock: LockId) {
        self.thread_mut(waiter).waiting_lock = Some(lock);
        let holder = self.lock_holder[&lock];
        self.thread_mut(holder).donors.push((waiter, lock));

        let donated = self.priority_of(waiter);
        let mut tid = holder;
        loop {
            if self.priority_of(tid) < donated {
                self.thread_mut(tid).priority = donated;
                self.reposition(tid);
            }
            match self.threads[&tid].waiting_lock {
                Some(next_lock) => tid = self.lock_holder[&next_lock],
                None => break,
            }
        }
    }

    /// Registers `tid` as the holder of `lock` once its acquisition
    /// completed.
    pub fn lock_acquired(&mut self, tid: Tid, lock: LockId) {
        self.thread_mut(tid).waiting_lock = None;
        assert!(self.lock_holder.insert(lock, tid).is_none());
    }

    /// Withdraws the donations contributed through `lock` and recomputes the
    /// releaser's effective priority.
    pub fn lock_released(&mut self, tid: Tid, lock: LockId) {
        assert_eq!(self.lock_holder.remove(&lock), Some(tid));
        self.thread_mut(tid).donors.retain(|&(_, l)| l != lock);
        self.recompute_priority(tid);
    }

    pub fn set_nice(&mut self, tid: Tid, nice: i32) {
        let nice = nice.clamp(NICE_MIN, NICE_MAX);
        self.thread_mut(tid).nice = nice;
        self.update_recent_cpu(tid);
        self.update_mlfqs_priority(tid);
    }

    /// `priority = PRI_MAX - recent_cpu/4 - 2*nice`, clamped.
    fn update_mlfqs_priority(&mut self, tid: Tid) {
        let thread = &self.threads[&tid];
        let priority = (Fixed::from_int(PRI_MAX) - thread.recent_cpu.div_int(4))
            .sub_int(2 * thread.nice)
            .trunc()
            .clamp(PRI_MIN, PRI_MAX);
        self.thread_mut(tid).priority = priority;
        self.reposition(tid);
    }

    /// `recent_cpu = (2*load_avg)/(2*load_avg + 1) * recent_cpu + nice`.
    fn update_recent_cpu(&mut self, tid: Tid) {
        let load2 = self.load_avg.mul_int(2);
        let coeff = load2.div(load2.add_int(1));
        let thread = &self.threads[&tid];
        let recent = coeff.mul(thread.recent_cpu).add_int(thread.nice);
        self.thread_mut(tid).recent_cpu = recent;
    }

    /// `load_avg = (59/60)*load_avg + (1/60)*ready_threads`.
    fn update_load_avg(&mut self) {
        let ready_threads =
            self.ready.len() as i32 + if self.current == self.idle { 0 } else { 1 };
        self.load_avg = Fixed::from_int(59).div(Fixed::from_int(60)).mul(self.load_avg)
            + Fixed::from_int(1).div(Fixed::from_int(60)).mul_int(ready_threads);
    }

    fn mlfqs_tick(&mut self) {
        let cur = self.current;
        if cur != self.idle {
            let t = self.thread_mut(cur);
            t.recent_cpu = t.recent_cpu.add_int(1);
        }
        if self.ticks % TIMER_FREQ == 0 {
            self.update_load_avg();
            let tids: Vec<Tid> = self.threads.keys().copied().collect();
            for tid in tids {
                if tid != self.idle {
                    self.update_recent_cpu(tid);
                }
            }
        }
        if self.ticks % 4 == 0 {
            let tids: Vec<Tid> = self.threads.keys().copied().collect();
            for tid in tids {
                if tid != self.idle {
                    self.update_mlfqs_priority(tid);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_creates_main_and_idle() {
        let sched = Sched::new(false);
        assert_eq!(sched.threads.len(), 2);
        assert_eq!(sched.threads[&sched.current].name.as_str(), "main");
        assert_eq!(sched.threads[&sched.current].state, ThreadState::Running);
    }

    #[test]
    fn ready_queue_is_priority_ordered_fifo_among_equals() {
        let mut sched = Sched::new(false);
        let a = sched.spawn("a", 10);
        let b = sched.spawn("b", 20);
        let c = sched.spawn("c", 20);
        sched.unblock(a);
        sched.unblock(b);
        sched.unblock(c);
        assert_eq!(sched.ready, [b, c, a]);
    }

    #[test]
    fn yield_round_robins_equal_priorities() {
        let mut sched = Sched::new(false);
        let other = sched.spawn("other", PRI_DEFAULT);
        sched.unblock(other);
        let main = sched.current;
        sched.yield_current();
        assert_eq!(sched.current, other);
        assert_eq!(sched.threads[&main].state, ThreadState::Ready);
        sched.yield_current();
        assert_eq!(sched.current, main);
    }

    #[test]
    fn idle_runs_when_ready_queue_empty() {
        let mut sched = Sched::new(false);
        let main = sched.current;
        sched.sleep_current(100);
        assert_eq!(sched.current, sched.idle);
        assert_eq!(sched.threads[&main].state, ThreadState::Blocked);
    }

    #[test]
    fn sleepers_wake_in_tick_order() {
        let mut sched = Sched::new(false);
        let a = sched.spawn("a", 40);
        let b = sched.spawn("b", 45);
        sched.unblock(a);
        sched.unblock(b);
        // Both outrank main; b runs first, then a. Put both to sleep.
        sched.yield_current();
        assert_eq!(sched.current, b);
        sched.sleep_current(8);
        assert_eq!(sched.current, a);
        sched.sleep_current(4);
        for _ in 0..3 {
            let _ = sched.tick();
        }
        assert_eq!(sched.threads[&a].state, ThreadState::Blocked);
        let _ = sched.tick();
        assert_eq!(sched.threads[&a].state, ThreadState::Ready);
        assert_eq!(sched.threads[&b].state, ThreadState::Blocked);
        for _ in 0..4 {
            let _ = sched.tick();
        }
        assert_eq!(sched.threads[&b].state, ThreadState::Ready);
    }

    #[test]
    fn tick_requests_preemption_for_higher_priority_ready() {
        let mut sched = Sched::new(false);
        let hi = sched.spawn("hi", 50);
        sched.unblock(hi);
        assert!(sched.tick());
    }

    #[test]
    fn time_slice_expiry_requests_yield() {
        let mut sched = Sched::new(false);
        let mut yielded = false;
        for _ in 0..TIME_SLICE {
            yielded = sched.tick();
        }
        assert!(yielded);
    }

    #[test]
    fn mlfqs_priority_formula() {
        let mut sched = Sched::new(true);
        let tid = sched.current;
        // recent_cpu = 8, nice = 2: PRI_MAX - 2 - 4 = 57.
        sched.thread_mut(tid).recent_cpu = Fixed::from_int(8);
        sched.thread_mut(tid).nice = 2;
        sched.update_mlfqs_priority(tid);
        assert_eq!(sched.threads[&tid].priority, 57);
    }

    #[test]
    fn mlfqs_ignores_requested_priority() {
        let mut sched = Sched::new(true);
        let tid = sched.spawn("t", 3);
        assert_eq!(sched.threads[&tid].priority, PRI_DEFAULT);
    }

    #[test]
    fn load_avg_counts_ready_and_running() {
        let mut sched = Sched::new(true);
        let a = sched.spawn("a", PRI_DEFAULT);
        sched.unblock(a);
        // main running + a ready = 2 contributing threads; after 100 seconds
        // the average has mostly converged toward 2.
        for _ in 0..100 * TIMER_FREQ {
            let _ = sched.tick();
        }
        let x100 = sched.load_avg.mul_int(100).round();
        assert!(x100 > 150 && x100 <= 200, "load_avg x100 = {}", x100);
    }
}
