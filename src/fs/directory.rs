//! Directories.
//!
//! A directory is an inode whose data bytes are an array of fixed 20-byte
//! entries. Every directory carries `.` and `..` from creation. Mutations
//! run under the filesystem semaphore, held by the callers in `fs`.

use alloc::sync::Arc;

use arrayvec::ArrayVec;

use static_assertions::const_assert_eq;

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::param::NAME_MAX;

use super::inode::Inode;

/// On-disk entry: `{in_use: u8, name: [u8; 15], inode_sector: u32}`.
pub const DIR_ENTRY_SIZE: usize = 20;

const_assert_eq!(1 + (NAME_MAX + 1) + 4, DIR_ENTRY_SIZE);

/// Initial entry slots in a fresh directory; it grows past them on demand.
pub const DIR_INITIAL_ENTRIES: u32 = 16;

pub struct DirEntry {
    pub in_use: bool,
    name: [u8; NAME_MAX + 1],
    pub inode_sector: u32,
}

impl DirEntry {
    fn encode(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        buf[0] = self.in_use as u8;
        buf[1..1 + NAME_MAX + 1].copy_from_slice(&self.name);
        buf[16..20].copy_from_slice(&self.inode_sector.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; DIR_ENTRY_SIZE]) -> Self {
        let mut name = [0u8; NAME_MAX + 1];
        name.copy_from_slice(&buf[1..1 + NAME_MAX + 1]);
        let mut sector = [0u8; 4];
        sector.copy_from_slice(&buf[16..20]);
        Self {
            in_use: buf[0] != 0,
            name,
            inode_sector: u32::from_le_bytes(sector),
        }
    }

    /// The stored name, NUL-trimmed.
    pub fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_MAX);
        &self.name[..len]
    }
}

/// Reads the entry at `index`, or `None` past the directory's end.
pub fn entry_at(kernel: &Kernel, dir: &Arc<Inode>, index: u32) -> Result<Option<DirEntry>> {
    let mut buf = [0u8; DIR_ENTRY_SIZE];
    let n = dir.read_at(kernel, &mut buf, index * DIR_ENTRY_SIZE as u32)?;
    if n < DIR_ENTRY_SIZE {
        return Ok(None);
    }
    Ok(Some(DirEntry::decode(&buf)))
}

fn write_entry(kernel: &Kernel, dir: &Arc<Inode>, index: u32, entry: &DirEntry) -> Result<()> {
    let n = dir.write_at(kernel, &entry.encode(), index * DIR_ENTRY_SIZE as u32)?;
    if n != DIR_ENTRY_SIZE {
        return Err(KernelError::DeviceError);
    }
    Ok(())
}

fn find(kernel: &Kernel, dir: &Arc<Inode>, name: &[u8]) -> Result<Option<(u32, DirEntry)>> {
    let mut index = 0;
    while let Some(entry) = entry_at(kernel, dir, index)? {
        if entry.in_use && entry.name() == name {
            return Ok(Some((index, entry)));
        }
        index += 1;
    }
    Ok(None)
}

/// Looks `name` up in `dir` and opens the inode it refers to.
pub fn lookup(kernel: &Kernel, dir: &Arc<Inode>, name: &[u8]) -> Result<Arc<Inode>> {
    match find(kernel, dir, name)? {
        Some((_, entry)) => kernel.fs().inode_open(kernel, entry.inode_sector),
        None => Err(KernelError::NotFound),
    }
}

/// Adds an entry binding `name` to `sector`, in the first unused slot.
/// The directory grows when every slot is taken.
pub fn add(kernel: &Kernel, dir: &Arc<Inode>, name: &[u8], sector: u32) -> Result<()> {
    if name.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    if name.len() > NAME_MAX {
        return Err(KernelError::NameTooLong);
    }
    if find(kernel, dir, name)?.is_some() {
        return Err(KernelError::AlreadyExists);
    }
    let mut index = 0;
    while let Some(entry) = entry_at(kernel, dir, index)? {
        if !entry.in_use {
            break;
        }
        index += 1;
    }
    let mut stored = [0u8; NAME_MAX + 1];
    stored[..name.len()].copy_from_slice(name);
    write_entry(
        kernel,
        dir,
        index,
        &DirEntry {
            in_use: true,
            name: stored,
            inode_sector: sector,
        },
    )
}

/// True when `dir` holds no live entries besides `.` and `..`.
fn is_empty(kernel: &Kernel, dir: &Arc<Inode>) -> Result<bool> {
    let mut index = 0;
    while let Some(entry) = entry_at(kernel, dir, index)? {
        if entry.in_use && entry.name() != b"." && entry.name() != b".." {
            return Ok(false);
        }
        index += 1;
    }
    Ok(true)
}

/// Removes `name` from `dir` and marks its inode deleted.
///
/// A directory target must be empty and not in use: the root, an open
/// directory, or any thread's working directory all refuse removal (a
/// working directory holds the inode open, so the open count covers those).
pub fn remove(kernel: &Kernel, dir: &Arc<Inode>, name: &[u8]) -> Result<()> {
    let (index, mut entry) = find(kernel, dir, name)?.ok_or(KernelError::NotFound)?;
    let inode = kernel.fs().inode_open(kernel, entry.inode_sector)?;
    let verdict = (|| -> Result<()> {
        if inode.is_dir() {
            if inode.sector == kernel.fs().root_sector() {
                return Err(KernelError::InvalidArgument);
            }
            if !is_empty(kernel, &inode)? {
                return Err(KernelError::InvalidArgument);
            }
            if inode.state.lock().open_cnt > 1 {
                return Err(KernelError::InvalidArgument);
            }
        }
        Ok(())
    })();
    if let Err(err) = verdict {
        kernel.fs().inode_close(kernel, &inode);
        return Err(err);
    }
    entry.in_use = false;
    if let Err(err) = write_entry(kernel, dir, index, &entry) {
        kernel.fs().inode_close(kernel, &inode);
        return Err(err);
    }
    inode.remove();
    kernel.fs().inode_close(kernel, &inode);
    Ok(())
}

/// Yields the next in-use entry name at or after `*index`, skipping the
/// dot entries; advances `*index` past the returned slot.
pub fn read_entry_name(
    kernel: &Kernel,
    dir: &Arc<Inode>,
    index: &mut u32,
) -> Result<Option<ArrayVec<u8, NAME_MAX>>> {
    while let Some(entry) = entry_at(kernel, dir, *index)? {
        *index += 1;
        if entry.in_use && entry.name() != b"." && entry.name() != b".." {
            let mut name = ArrayVec::new();
            name.try_extend_from_slice(entry.name())
                .map_err(|_| KernelError::NameTooLong)?;
            return Ok(Some(name));
        }
    }
    Ok(None)
}
