//! Hardware abstraction layer.
//!
//! The kernel core is machine-independent; everything the machine provides is
//! reached through `Hal`. The embedder supplies a console and two block
//! devices (one for the filesystem, one for swap) when building the kernel.

use alloc::boxed::Box;

use crate::error::Result;
use crate::param::SECTOR_SIZE;

/// A disk exposing fixed-size sector transfers.
///
/// A transfer either fully succeeds or fails with `DeviceError`; there are no
/// partial sector reads or writes.
pub trait BlockDevice: Send + Sync {
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<()>;
    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) -> Result<()>;

    /// Device capacity in sectors.
    fn size(&self) -> u32;
}

/// Console output sink plus a character input source.
pub trait Console: Send + Sync {
    fn putbuf(&self, bytes: &[u8]);

    /// Blocks until a character is available.
    fn getc(&self) -> u8;
}

impl<T: BlockDevice + ?Sized> BlockDevice for alloc::sync::Arc<T> {
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        (**self).read(sector, buf)
    }

    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
        (**self).write(sector, buf)
    }

    fn size(&self) -> u32 {
        (**self).size()
    }
}

impl<T: Console + ?Sized> Console for alloc::sync::Arc<T> {
    fn putbuf(&self, bytes: &[u8]) {
        (**self).putbuf(bytes)
    }

    fn getc(&self) -> u8 {
        (**self).getc()
    }
}

pub struct Hal {
    console: Box<dyn Console>,
    fs_disk: Box<dyn BlockDevice>,
    swap_disk: Box<dyn BlockDevice>,
}

impl Hal {
    pub fn new(
        console: Box<dyn Console>,
        fs_disk: Box<dyn BlockDevice>,
        swap_disk: Box<dyn BlockDevice>,
    ) -> Self {
        Self {
            console,
            fs_disk,
            swap_disk,
        }
    }

    pub fn console(&self) -> &dyn Console {
        &*self.console
    }

    pub fn fs_disk(&self) -> &dyn BlockDevice {
        &*self.fs_disk
    }

    pub fn swap_disk(&self) -> &dyn BlockDevice {
        &*self.swap_disk
    }
}

cfg_if::cfg_if! {
    if #[cfg(test)] {
        pub use testing::{MemConsole, MemDisk};
    }
}

#[cfg(test)]
mod testing {
    use alloc::collections::VecDeque;
    use alloc::vec;
    use alloc::vec::Vec;

    use super::{BlockDevice, Console};
    use crate::error::{KernelError, Result};
    use crate::lock::SpinLock;
    use crate::param::SECTOR_SIZE;

    /// RAM-backed disk for host tests.
    pub struct MemDisk {
        sectors: u32,
        data: SpinLock<Vec<u8>>,
    }

    impl MemDisk {
        pub fn new(sectors: u32) -> Self {
            Self {
                sectors,
                data: SpinLock::new("memdisk", vec![0; sectors as usize * SECTOR_SIZE]),
            }
        }
    }

    impl BlockDevice for MemDisk {
        fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
            if sector >= self.sectors {
                return Err(KernelError::DeviceError);
            }
            let data = self.data.lock();
            let base = sector as usize * SECTOR_SIZE;
            buf.copy_from_slice(&data[base..base + SECTOR_SIZE]);
            Ok(())
        }

        fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
            if sector >= self.sectors {
                return Err(KernelError::DeviceError);
            }
            let mut data = self.data.lock();
            let base = sector as usize * SECTOR_SIZE;
            data[base..base + SECTOR_SIZE].copy_from_slice(buf);
            Ok(())
        }

        fn size(&self) -> u32 {
            self.sectors
        }
    }

    /// Console that captures output and replays scripted input.
    pub struct MemConsole {
        out: SpinLock<Vec<u8>>,
        input: SpinLock<VecDeque<u8>>,
    }

    impl MemConsole {
        pub fn new() -> Self {
            Self {
                out: SpinLock::new("console-out", Vec::new()),
                input: SpinLock::new("console-in", VecDeque::new()),
            }
        }

        pub fn feed(&self, bytes: &[u8]) {
            self.input.lock().extend(bytes.iter().copied());
        }

        pub fn take_output(&self) -> Vec<u8> {
            core::mem::take(&mut *self.out.lock())
        }
    }

    impl Console for MemConsole {
        fn putbuf(&self, bytes: &[u8]) {
            self.out.lock().extend_from_slice(bytes);
        }

        fn getc(&self) -> u8 {
            // Tests script the input up front; an empty queue is a test bug.
            self.input.lock().pop_front().expect("console input exhausted")
        }
    }
}
