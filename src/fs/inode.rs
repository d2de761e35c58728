//! Inodes.
//!
//! An on-disk inode is one 512-byte record: first data sector, length,
//! kind flags, an embedded symlink target, and a magic number. Each record
//! occupies a cluster of its own. In-memory inodes are cached so that
//! opening the same sector twice yields the same object; the cache is
//! mutated under the filesystem semaphore.
//!
//! Readers proceed without the write semaphore: they snapshot the length
//! once before use, and writers only grow the length after the chain
//! extension is in place.

use alloc::sync::Arc;
use alloc::vec::Vec;

use static_assertions::const_assert_eq;

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::lock::{Semaphore, SpinLock};
use crate::param::SECTOR_SIZE;

/// Identifies a valid inode record.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Capacity of the embedded symlink target, NUL included.
pub const LINK_MAX: usize = 458;

// Record layout, byte offsets within the sector.
const OFF_START: usize = 0;
const OFF_LENGTH: usize = 4;
const OFF_IS_DIR: usize = 8;
const OFF_IS_SYMLINK: usize = 9;
const OFF_LINK: usize = 10;
const OFF_MAGIC: usize = OFF_LINK + LINK_MAX;
const OFF_UNUSED: usize = OFF_MAGIC + 4;

// The record fills the sector exactly: 10 + 458 + 4 + 40 == 512.
const_assert_eq!(OFF_UNUSED + 10 * 4, SECTOR_SIZE);

/// In-memory copy of an on-disk inode record.
#[derive(Clone)]
pub struct DiskInode {
    /// First data sector, or 0 while the file has no data.
    pub start: u32,
    /// File size in bytes.
    pub length: u32,
    pub is_dir: bool,
    pub is_symlink: bool,
    /// Symlink target, NUL-terminated.
    pub link: [u8; LINK_MAX],
}

impl DiskInode {
    pub fn new(start: u32, length: u32, is_dir: bool) -> Self {
        Self {
            start,
            length,
            is_dir,
            is_symlink: false,
            link: [0; LINK_MAX],
        }
    }

    pub fn encode(&self) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        buf[OFF_START..OFF_START + 4].copy_from_slice(&self.start.to_le_bytes());
        buf[OFF_LENGTH..OFF_LENGTH + 4].copy_from_slice(&self.length.to_le_bytes());
        buf[OFF_IS_DIR] = self.is_dir as u8;
        buf[OFF_IS_SYMLINK] = self.is_symlink as u8;
        buf[OFF_LINK..OFF_LINK + LINK_MAX].copy_from_slice(&self.link);
        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&INODE_MAGIC.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; SECTOR_SIZE]) -> Result<Self> {
        let word = |off: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[off..off + 4]);
            u32::from_le_bytes(b)
        };
        if word(OFF_MAGIC) != INODE_MAGIC {
            return Err(KernelError::DeviceError);
        }
        let mut link = [0u8; LINK_MAX];
        link.copy_from_slice(&buf[OFF_LINK..OFF_LINK + LINK_MAX]);
        Ok(Self {
            start: word(OFF_START),
            length: word(OFF_LENGTH),
            is_dir: buf[OFF_IS_DIR] != 0,
            is_symlink: buf[OFF_IS_SYMLINK] != 0,
            link,
        })
    }
}

pub struct InodeState {
    pub open_cnt: i32,
    /// Set when unlinked; the last close releases the clusters.
    pub removed: bool,
    /// 0: writes ok, >0: deny writes.
    pub deny_write_cnt: i32,
    pub data: DiskInode,
}

/// In-memory inode.
pub struct Inode {
    /// Sector of the on-disk record.
    pub sector: u32,
    /// Serializes writers; extension happens under it.
    pub write_sema: Semaphore,
    pub state: SpinLock<InodeState>,
}

fn bytes_to_sectors(size: u32) -> u32 {
    (size + SECTOR_SIZE as u32 - 1) / SECTOR_SIZE as u32
}

impl Inode {
    /// Writes a fresh inode of `length` zeroed bytes at `sector`, clusters
    /// included.
    pub fn create(kernel: &Kernel, sector: u32, length: u32, is_dir: bool) -> Result<()> {
        let mut disk_inode = DiskInode::new(0, length, is_dir);
        let sectors = bytes_to_sectors(length);
        if sectors > 0 {
            let mut fat = kernel.fs().fat().lock();
            let head = fat.create_chain(0)?;
            disk_inode.start = fat.cluster_to_sector(head);
            let mut tail = head;
            for _ in 1..sectors {
                match fat.create_chain(tail) {
                    Ok(next) => tail = next,
                    Err(err) => {
                        fat.remove_chain(head, 0);
                        return Err(err);
                    }
                }
            }
        }
        kernel.hal().fs_disk().write(sector, &disk_inode.encode())?;
        if sectors > 0 {
            let fat = kernel.fs().fat().lock();
            let zeros = [0u8; SECTOR_SIZE];
            let mut clst = fat.sector_to_cluster(disk_inode.start);
            for _ in 0..sectors {
                kernel.hal().fs_disk().write(fat.cluster_to_sector(clst), &zeros)?;
                clst = fat.get(clst);
            }
        }
        Ok(())
    }

    /// Writes a symlink inode whose record embeds `target`.
    pub fn create_symlink(kernel: &Kernel, sector: u32, target: &[u8]) -> Result<()> {
        if target.is_empty() || target.len() >= LINK_MAX {
            return Err(KernelError::NameTooLong);
        }
        let mut disk_inode = DiskInode::new(0, target.len() as u32 + 1, false);
        disk_inode.is_symlink = true;
        disk_inode.link[..target.len()].copy_from_slice(target);
        let head = kernel.fs().fat().lock().create_chain(0)?;
        disk_inode.start = kernel.fs().fat().lock().cluster_to_sector(head);
        kernel.hal().fs_disk().write(sector, &disk_inode.encode())?;
        Ok(())
    }

    pub fn len(&self) -> u32 {
        self.state.lock().data.length
    }

    pub fn is_dir(&self) -> bool {
        self.state.lock().data.is_dir
    }

    pub fn is_symlink(&self) -> bool {
        self.state.lock().data.is_symlink
    }

    pub fn inumber(&self) -> u32 {
        self.sector
    }

    /// The symlink target, without the trailing NUL.
    pub fn link_target(&self) -> Vec<u8> {
        let state = self.state.lock();
        let len = state
            .data
            .link
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(LINK_MAX);
        state.data.link[..len].to_vec()
    }

    /// Marks the inode deleted; the clusters go when the last opener closes.
    pub fn remove(&self) {
        self.state.lock().removed = true;
    }

    /// Disables writes. May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut state = self.state.lock();
        state.deny_write_cnt += 1;
        assert!(state.deny_write_cnt <= state.open_cnt);
    }

    /// Re-enables writes; pairs with `deny_write`.
    pub fn allow_write(&self) {
        let mut state = self.state.lock();
        assert!(state.deny_write_cnt > 0);
        assert!(state.deny_write_cnt <= state.open_cnt);
        state.deny_write_cnt -= 1;
    }

    /// The sector holding byte `pos`, reached by walking the cluster chain.
    fn byte_to_sector(&self, kernel: &Kernel, data: &DiskInode, pos: u32) -> Option<u32> {
        if pos >= data.length || data.start == 0 {
            return None;
        }
        let fat = kernel.fs().fat().lock();
        let clst = fat.walk(
            fat.sector_to_cluster(data.start),
            (pos / SECTOR_SIZE as u32) as usize,
        );
        Some(fat.cluster_to_sector(clst))
    }

    /// Reads up to `buf.len()` bytes at `offset`. Short past end of file.
    pub fn read_at(&self, kernel: &Kernel, buf: &mut [u8], offset: u32) -> Result<usize> {
        // Snapshot once; concurrent growth only ever extends past it.
        let data = self.state.lock().data.clone();
        let disk = kernel.hal().fs_disk();
        let mut bounce = [0u8; SECTOR_SIZE];
        let mut bytes_read = 0usize;
        let mut offset = offset;
        while bytes_read < buf.len() {
            let sector = match self.byte_to_sector(kernel, &data, offset) {
                Some(sector) => sector,
                None => break,
            };
            let sector_ofs = offset as usize % SECTOR_SIZE;
            let inode_left = (data.length - offset) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (buf.len() - bytes_read).min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }
            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                let dst = &mut buf[bytes_read..bytes_read + SECTOR_SIZE];
                disk.read(sector, &mut bounce)?;
                dst.copy_from_slice(&bounce);
            } else {
                disk.read(sector, &mut bounce)?;
                buf[bytes_read..bytes_read + chunk]
                    .copy_from_slice(&bounce[sector_ofs..sector_ofs + chunk]);
            }
            offset += chunk as u32;
            bytes_read += chunk;
        }
        Ok(bytes_read)
    }

    /// Writes `buf` at `offset`, growing the file when the write lands past
    /// the current end. Returns 0 while writes are denied.
    pub fn write_at(&self, kernel: &Kernel, buf: &[u8], offset: u32) -> Result<usize> {
        if self.state.lock().deny_write_cnt > 0 {
            return Ok(0);
        }
        self.write_sema.down(kernel);
        let result = self.write_at_locked(kernel, buf, offset);
        self.write_sema.up(kernel);
        result
    }

    fn write_at_locked(&self, kernel: &Kernel, buf: &[u8], offset: u32) -> Result<usize> {
        let end = offset
            .checked_add(buf.len() as u32)
            .ok_or(KernelError::InvalidArgument)?;
        if end > self.state.lock().data.length {
            self.extend_to(kernel, end)?;
        }
        let data = self.state.lock().data.clone();
        let disk = kernel.hal().fs_disk();
        let mut bounce = [0u8; SECTOR_SIZE];
        let mut written = 0usize;
        let mut offset = offset;
        while written < buf.len() {
            let sector = match self.byte_to_sector(kernel, &data, offset) {
                Some(sector) => sector,
                None => break,
            };
            let sector_ofs = offset as usize % SECTOR_SIZE;
            let inode_left = (data.length - offset) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (buf.len() - written).min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }
            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                bounce.copy_from_slice(&buf[written..written + SECTOR_SIZE]);
                disk.write(sector, &bounce)?;
            } else {
                // Preserve the bytes around the chunk.
                if sector_ofs > 0 || chunk < sector_left {
                    disk.read(sector, &mut bounce)?;
                } else {
                    bounce.fill(0);
                }
                bounce[sector_ofs..sector_ofs + chunk]
                    .copy_from_slice(&buf[written..written + chunk]);
                disk.write(sector, &bounce)?;
            }
            offset += chunk as u32;
            written += chunk;
        }
        Ok(written)
    }

    /// Grows the chain to cover `new_length` bytes, then publishes the new
    /// length and flushes the record. Runs under the write semaphore.
    fn extend_to(&self, kernel: &Kernel, new_length: u32) -> Result<()> {
        let (old_length, start) = {
            let state = self.state.lock();
            (state.data.length, state.data.start)
        };
        let have = bytes_to_sectors(old_length);
        let need = bytes_to_sectors(new_length);
        let mut start = start;
        {
            let mut fat = kernel.fs().fat().lock();
            let zeros = [0u8; SECTOR_SIZE];
            let mut tail = if start == 0 {
                0
            } else {
                fat.sector_to_cluster(start)
            };
            for _ in have..need {
                tail = fat.create_chain(tail)?;
                if start == 0 {
                    start = fat.cluster_to_sector(tail);
                }
                // Recycled clusters may hold old data.
                kernel.hal().fs_disk().write(fat.cluster_to_sector(tail), &zeros)?;
            }
        }
        let record = {
            let mut state = self.state.lock();
            state.data.start = start;
            state.data.length = new_length;
            state.data.clone()
        };
        kernel.hal().fs_disk().write(self.sector, &record.encode())?;
        Ok(())
    }
}

/// List of open inodes, so that opening a single sector twice returns the
/// same `Inode`.
pub struct InodeCache {
    list: Vec<Arc<Inode>>,
}

impl InodeCache {
    pub const fn new() -> Self {
        Self { list: Vec::new() }
    }

    pub fn find(&self, sector: u32) -> Option<&Arc<Inode>> {
        self.list.iter().find(|ip| ip.sector == sector)
    }

    pub fn insert(&mut self, inode: Arc<Inode>) {
        self.list.push(inode);
    }

    pub fn evict(&mut self, inode: &Arc<Inode>) {
        self.list.retain(|ip| !Arc::ptr_eq(ip, inode));
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}
