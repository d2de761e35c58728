//! Open file handles.
//!
//! A `File` is what a file descriptor points at: the console, or an inode
//! with a current byte position and a deny-write flag. Handles are shared
//! between the descriptor table and the VM (mappings hold their own), so
//! the position lives behind a spin lock. Closing is explicit; dropping the
//! last `Arc` without `close` leaks the inode's open count.

use alloc::sync::Arc;

use arrayvec::ArrayVec;

use crate::error::{KernelError, Result};
use crate::fs::{directory, Inode};
use crate::kernel::Kernel;
use crate::lock::SpinLock;
use crate::param::NAME_MAX;

pub struct File {
    typ: FileType,
}

pub enum FileType {
    /// Console input.
    Stdin,
    /// Console output.
    Stdout,
    Inode {
        ip: Arc<Inode>,
        inner: SpinLock<FileInner>,
    },
}

pub struct FileInner {
    /// Current byte position.
    pos: u32,
    /// Whether this handle denied writes on the inode.
    deny: bool,
    /// Cursor for `readdir` on directory handles.
    dir_index: u32,
}

impl File {
    pub fn stdin() -> Arc<File> {
        Arc::new(File {
            typ: FileType::Stdin,
        })
    }

    pub fn stdout() -> Arc<File> {
        Arc::new(File {
            typ: FileType::Stdout,
        })
    }

    /// Wraps an opened inode. The handle owns one open count.
    pub fn from_inode(ip: Arc<Inode>) -> Arc<File> {
        Arc::new(File {
            typ: FileType::Inode {
                ip,
                inner: SpinLock::new("file", FileInner {
                    pos: 0,
                    deny: false,
                    dir_index: 0,
                }),
            },
        })
    }

    pub fn inode(&self) -> Option<&Arc<Inode>> {
        match &self.typ {
            FileType::Inode { ip, .. } => Some(ip),
            _ => None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.inode().map_or(false, |ip| ip.is_dir())
    }

    /// Reads from the handle, advancing the position. Console input blocks
    /// until the characters arrive.
    pub fn read(&self, kernel: &Kernel, buf: &mut [u8]) -> Result<usize> {
        match &self.typ {
            FileType::Stdin => {
                for byte in buf.iter_mut() {
                    *byte = kernel.hal().console().getc();
                }
                Ok(buf.len())
            }
            FileType::Stdout => Err(KernelError::BadFd),
            FileType::Inode { ip, inner } => {
                let pos = inner.lock().pos;
                let n = ip.read_at(kernel, buf, pos)?;
                inner.lock().pos = pos + n as u32;
                Ok(n)
            }
        }
    }

    /// Writes to the handle, advancing the position.
    pub fn write(&self, kernel: &Kernel, buf: &[u8]) -> Result<usize> {
        match &self.typ {
            FileType::Stdin => Err(KernelError::BadFd),
            FileType::Stdout => {
                kernel.hal().console().putbuf(buf);
                Ok(buf.len())
            }
            FileType::Inode { ip, inner } => {
                let pos = inner.lock().pos;
                let n = ip.write_at(kernel, buf, pos)?;
                inner.lock().pos = pos + n as u32;
                Ok(n)
            }
        }
    }

    /// Positionless read, used by the VM for file-backed pages.
    pub fn read_at(&self, kernel: &Kernel, buf: &mut [u8], offset: u32) -> Result<usize> {
        match &self.typ {
            FileType::Inode { ip, .. } => ip.read_at(kernel, buf, offset),
            _ => Err(KernelError::BadFd),
        }
    }

    /// Positionless write, used by the VM for write-back.
    pub fn write_at(&self, kernel: &Kernel, buf: &[u8], offset: u32) -> Result<usize> {
        match &self.typ {
            FileType::Inode { ip, .. } => ip.write_at(kernel, buf, offset),
            _ => Err(KernelError::BadFd),
        }
    }

    /// Sets the position. No clamping: seeking past end of file is legal,
    /// reads there return 0 and writes extend the file.
    pub fn seek(&self, pos: u32) -> Result<()> {
        match &self.typ {
            FileType::Inode { inner, .. } => {
                inner.lock().pos = pos;
                Ok(())
            }
            _ => Err(KernelError::BadFd),
        }
    }

    pub fn tell(&self) -> Result<u32> {
        match &self.typ {
            FileType::Inode { inner, .. } => Ok(inner.lock().pos),
            _ => Err(KernelError::BadFd),
        }
    }

    pub fn len(&self, kernel: &Kernel) -> Result<u32> {
        let _ = kernel;
        match &self.typ {
            FileType::Inode { ip, .. } => Ok(ip.len()),
            _ => Err(KernelError::BadFd),
        }
    }

    /// Blocks writes through any handle of the underlying inode. At most
    /// once per handle.
    pub fn deny_write(&self) {
        if let FileType::Inode { ip, inner } = &self.typ {
            let mut inner = inner.lock();
            if !inner.deny {
                inner.deny = true;
                ip.deny_write();
            }
        }
    }

    pub fn allow_write(&self) {
        if let FileType::Inode { ip, inner } = &self.typ {
            let mut inner = inner.lock();
            if inner.deny {
                inner.deny = false;
                ip.allow_write();
            }
        }
    }

    /// A fresh handle on the same inode, position copied, used by fork.
    pub fn duplicate(&self, kernel: &Kernel) -> Result<Arc<File>> {
        match &self.typ {
            FileType::Stdin => Ok(File::stdin()),
            FileType::Stdout => Ok(File::stdout()),
            FileType::Inode { ip, inner } => {
                let reopened = kernel.fs().inode_reopen(ip);
                let dup = File::from_inode(reopened);
                let (pos, deny) = {
                    let inner = inner.lock();
                    (inner.pos, inner.deny)
                };
                let _ = dup.seek(pos);
                if deny {
                    dup.deny_write();
                }
                Ok(dup)
            }
        }
    }

    /// Yields directory entries one at a time, skipping `.` and `..`.
    pub fn readdir(&self, kernel: &Kernel) -> Result<Option<ArrayVec<u8, NAME_MAX>>> {
        match &self.typ {
            FileType::Inode { ip, inner } => {
                if !ip.is_dir() {
                    return Err(KernelError::NotDirectory);
                }
                let mut index = inner.lock().dir_index;
                let entry = directory::read_entry_name(kernel, ip, &mut index)?;
                inner.lock().dir_index = index;
                Ok(entry)
            }
            _ => Err(KernelError::NotDirectory),
        }
    }

    /// Releases the handle's open count; an outstanding deny-write is
    /// withdrawn first.
    pub fn close(&self, kernel: &Kernel) {
        if let FileType::Inode { ip, .. } = &self.typ {
            self.allow_write();
            kernel.fs().inode_close(kernel, ip);
        }
    }
}
