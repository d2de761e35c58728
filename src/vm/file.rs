//! File-backed pages and the mmap/munmap operations.
//!
//! A mapping reopens the underlying file, so closing the user's descriptor
//! does not tear the mapping down. Every page of a mapping records the
//! mapping's base address; munmap walks the contiguous descriptors that
//! share it and closes the per-mapping handle when the last one dies.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, Result};
use crate::file::File;
use crate::kernel::Kernel;
use crate::memlayout::{is_kernel_vaddr, pg_ofs};
use crate::param::PGSIZE;

use super::{destroy_page, FileMeta, Page, PageInit, PageKind, PageState, Vm};

/// Fills a frame from the backing file: `read_bytes` from `offset`, then a
/// zeroed tail.
pub(super) fn read_file_page(
    kernel: &Kernel,
    file: &Arc<File>,
    offset: u32,
    read_bytes: usize,
    data: &mut [u8; PGSIZE],
) -> Result<()> {
    if read_bytes > 0 {
        let n = file.read_at(kernel, &mut data[..read_bytes], offset)?;
        if n != read_bytes {
            return Err(KernelError::DeviceError);
        }
    }
    data[read_bytes..].fill(0);
    Ok(())
}

/// Writes a dirty page's file-covered bytes back to its region.
pub(super) fn write_back(kernel: &Kernel, meta: &FileMeta, data: &[u8; PGSIZE]) -> Result<()> {
    if meta.read_bytes > 0 {
        // A short count here means the inode denies writes; the data is
        // dropped, matching the underlying write convention.
        let _ = meta.file.write_at(kernel, &data[..meta.read_bytes], meta.offset)?;
    }
    Ok(())
}

/// The mapping base a page belongs to, if it is part of one.
fn mapping_base(page: &Page) -> Option<(usize, &Arc<File>)> {
    match &page.state {
        PageState::File(meta) => Some((meta.mmap_base, &meta.file)),
        PageState::Uninit {
            init: PageInit::Mmap(meta),
            ..
        } => Some((meta.mmap_base, &meta.file)),
        _ => None,
    }
}

impl Kernel {
    /// Maps `length` bytes of `file` starting at `offset` to `addr`.
    ///
    /// Rejects a null or unaligned address, zero length, a misaligned or
    /// out-of-range offset, an empty file, kernel addresses, and overlap
    /// with existing descriptors. Returns the mapping base.
    pub fn mmap(
        &self,
        addr: usize,
        length: usize,
        writable: bool,
        file: &Arc<File>,
        offset: u32,
    ) -> Result<usize> {
        if addr == 0 || pg_ofs(addr) != 0 || length == 0 || pg_ofs(offset as usize) != 0 {
            return Err(KernelError::InvalidArgument);
        }
        if file.is_dir() {
            return Err(KernelError::IsDirectory);
        }
        let file_len = file.len(self)? as usize;
        if file_len == 0 || offset as usize >= file_len {
            return Err(KernelError::InvalidArgument);
        }
        // The region never extends past the mapped part of the file.
        let span = length.min(file_len - offset as usize);
        let pages = (span + PGSIZE - 1) / PGSIZE;
        let end = addr
            .checked_add(pages * PGSIZE)
            .ok_or(KernelError::InvalidArgument)?;
        if is_kernel_vaddr(addr) || is_kernel_vaddr(end - 1) {
            return Err(KernelError::InvalidArgument);
        }

        let as_id = self
            .with_current(|t| t.as_id)
            .ok_or(KernelError::InvalidArgument)?;
        // The mapping holds its own handle on the file.
        let mapped = file.duplicate(self)?;

        let result = {
            let mut vm = self.vm().lock();
            (|| -> Result<usize> {
                let space = vm.space_mut(as_id).ok_or(KernelError::InvalidArgument)?;
                for i in 0..pages {
                    if space.spt.contains_key(&(addr + i * PGSIZE)) {
                        return Err(KernelError::AlreadyExists);
                    }
                }
                let mut remaining = span;
                let mut off = offset;
                for i in 0..pages {
                    let va = addr + i * PGSIZE;
                    let read_bytes = remaining.min(PGSIZE);
                    let meta = FileMeta {
                        file: Arc::clone(&mapped),
                        offset: off,
                        read_bytes,
                        zero_bytes: PGSIZE - read_bytes,
                        mmap_base: addr,
                    };
                    let _ = space.spt.insert(
                        va,
                        Page {
                            va,
                            writable,
                            state: PageState::Uninit {
                                init: PageInit::Mmap(meta),
                                target: PageKind::File,
                            },
                            frame: None,
                        },
                    );
                    remaining -= read_bytes;
                    off += PGSIZE as u32;
                }
                Ok(addr)
            })()
        };
        if result.is_err() {
            mapped.close(self);
        }
        result
    }

    /// Unmaps the mapping whose base is `addr`: removes every contiguous
    /// descriptor belonging to it (writing dirty pages back) and closes the
    /// per-mapping file handle.
    pub fn munmap(&self, addr: usize) -> Result<()> {
        let as_id = self
            .with_current(|t| t.as_id)
            .ok_or(KernelError::InvalidArgument)?;
        let mapped = {
            let mut vm = self.vm().lock();
            let space = vm.space_mut(as_id).ok_or(KernelError::InvalidArgument)?;
            let file = {
                let page = space.spt.get(&addr).ok_or(KernelError::InvalidArgument)?;
                let (base, file) = mapping_base(page).ok_or(KernelError::InvalidArgument)?;
                if base != addr {
                    return Err(KernelError::InvalidArgument);
                }
                Arc::clone(file)
            };

            let mut vas = Vec::new();
            let mut va = addr;
            loop {
                match space.spt.get(&va) {
                    Some(page) if mapping_base(page).map(|(b, _)| b) == Some(addr) => {
                        vas.push(va);
                        va += PGSIZE;
                    }
                    _ => break,
                }
            }
            for va in vas {
                let Vm {
                    ref mut spaces,
                    ref mut frames,
                    ref mut swap,
                    ..
                } = *vm;
                let space = spaces.get_mut(&as_id).expect("space vanished in munmap");
                let mut page = space.spt.remove(&va).expect("page vanished in munmap");
                destroy_page(self, frames, swap, &mut space.pt, &mut page);
            }
            file
        };
        mapped.close(self);
        Ok(())
    }
}
