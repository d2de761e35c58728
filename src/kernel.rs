//! The kernel object.
//!
//! Owns every subsystem singleton — scheduler, VM, filesystem — over the
//! HAL's devices, with an explicit lifecycle: construct, `init`, run, and
//! `halt` to flush state back to disk. There is no global; the embedder
//! keeps the `Kernel` alive and routes traps, ticks and syscalls into it.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;
use crate::fs::FileSystem;
use crate::hal::Hal;
use crate::lock::SpinLock;
use crate::thread::Sched;
use crate::vm::Vm;

pub struct KernelConfig {
    /// Size of the user frame pool.
    pub user_frames: usize,
    /// Multi-level feedback queue scheduling instead of priority donation.
    pub mlfqs: bool,
    /// Format the filesystem disk during `init`.
    pub format: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            user_frames: 256,
            mlfqs: false,
            format: false,
        }
    }
}

pub struct Kernel {
    hal: Hal,
    config: KernelConfig,
    sched: SpinLock<Sched>,
    vm: SpinLock<Vm>,
    fs: FileSystem,
    halted: AtomicBool,
}

impl Kernel {
    /// Builds the kernel over the machine's devices. The filesystem is not
    /// usable until `init` has run.
    pub fn new(hal: Hal, config: KernelConfig) -> Kernel {
        let swap_sectors = hal.swap_disk().size();
        Kernel {
            sched: SpinLock::new("sched", Sched::new(config.mlfqs)),
            vm: SpinLock::new("vm", Vm::new(config.user_frames, swap_sectors)),
            fs: FileSystem::new(),
            halted: AtomicBool::new(false),
            hal,
            config,
        }
    }

    /// Mounts the filesystem, formatting first when configured to.
    pub fn init(&self) -> Result<()> {
        self.fs.init(self, self.config.format)
    }

    pub fn hal(&self) -> &Hal {
        &self.hal
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub(crate) fn sched(&self) -> &SpinLock<Sched> {
        &self.sched
    }

    pub(crate) fn vm(&self) -> &SpinLock<Vm> {
        &self.vm
    }

    /// Timer tick, called from the timer interrupt: advances time, wakes
    /// due sleepers, runs scheduler accounting, and yields on interrupt
    /// return when the running thread's turn is over.
    pub fn tick(&self) {
        let yield_on_return = self.sched.lock().tick();
        if yield_on_return {
            self.thread_yield();
        }
    }

    pub fn ticks(&self) -> i64 {
        self.sched.lock().ticks()
    }

    /// Flushes the filesystem and powers the machine down.
    pub fn halt(&self) {
        log::info!("halting");
        if self.fs.mounted() {
            if let Err(err) = self.fs.flush(self) {
                log::warn!("flush on halt failed: {}", err);
            }
        }
        self.halted.store(true, Ordering::Release);
    }

    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::TIME_SLICE;

    #[test]
    fn ticks_advance_and_halt_flushes() {
        let kernel = testing::test_kernel();
        assert_eq!(kernel.ticks(), 0);
        for _ in 0..TIME_SLICE {
            kernel.tick();
        }
        assert_eq!(kernel.ticks(), TIME_SLICE);
        assert!(!kernel.halted());
        kernel.halt();
        assert!(kernel.halted());
    }

    #[test]
    fn mounting_an_unformatted_disk_fails() {
        use alloc::boxed::Box;
        use alloc::sync::Arc;
        use crate::hal::{Hal, MemConsole, MemDisk};

        let hal = Hal::new(
            Box::new(Arc::new(MemConsole::new())),
            Box::new(MemDisk::new(256)),
            Box::new(MemDisk::new(64)),
        );
        let kernel = Kernel::new(hal, KernelConfig::default());
        assert!(kernel.init().is_err());
    }
}
