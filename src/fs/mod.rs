//! The filesystem: FAT volume, inodes, directories, path resolution.
//!
//! Layers, lowest first:
//!   + FAT: cluster-chain allocation over the filesystem disk.
//!   + Inodes: on-disk records, the open-inode cache, reading, writing,
//!     growth.
//!   + Directories: named entries inside a directory inode.
//!   + Paths: slash-separated walks from the root or a working directory,
//!     following symlinks.
//!
//! Every mutating operation serializes on a single filesystem semaphore,
//! held across the whole resolve-and-mutate.

use alloc::sync::Arc;

use arrayvec::ArrayVec;
use scopeguard::defer;
use spin::Once;

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::lock::{Semaphore, SpinLock};
use crate::param::{NAME_MAX, SYMLOOP_MAX};

pub mod directory;
mod fat;
mod inode;
mod path;

pub use directory::{DirEntry, DIR_ENTRY_SIZE, DIR_INITIAL_ENTRIES};
pub use fat::{BootRecord, Fat, EOC, FAT_MAGIC, ROOT_DIR_CLUSTER};
pub use inode::{DiskInode, Inode, InodeCache, InodeState, INODE_MAGIC, LINK_MAX};
pub use path::Path;

type NameBuf = ArrayVec<u8, NAME_MAX>;

pub struct FileSystem {
    /// The single filesystem semaphore of the metadata path.
    sema: Semaphore,

    fat: Once<SpinLock<Fat>>,

    inodes: SpinLock<InodeCache>,
}

impl FileSystem {
    pub fn new() -> Self {
        Self {
            sema: Semaphore::new(1),
            fat: Once::new(),
            inodes: SpinLock::new("inodes", InodeCache::new()),
        }
    }

    /// Mounts the volume, formatting the disk first when `format` is set.
    pub fn init(&self, kernel: &Kernel, format: bool) -> Result<()> {
        if format {
            log::info!("formatting file system");
            let fat = Fat::format(kernel.hal().fs_disk())?;
            let _ = self.fat.call_once(|| SpinLock::new("fat", fat));
            let root_sector = self.root_sector();
            Inode::create(
                kernel,
                root_sector,
                DIR_INITIAL_ENTRIES * DIR_ENTRY_SIZE as u32,
                true,
            )?;
            let root = self.inode_open(kernel, root_sector)?;
            let seeded = directory::add(kernel, &root, b".", root_sector)
                .and_then(|_| directory::add(kernel, &root, b"..", root_sector));
            self.inode_close(kernel, &root);
            seeded?;
            self.flush(kernel)?;
        } else {
            let fat = Fat::load(kernel.hal().fs_disk())?;
            let _ = self.fat.call_once(|| SpinLock::new("fat", fat));
        }
        log::info!("file system ready");
        Ok(())
    }

    /// Writes the boot record and FAT back; called by `halt` and after a
    /// format.
    pub fn flush(&self, kernel: &Kernel) -> Result<()> {
        self.fat().lock().flush(kernel.hal().fs_disk())
    }

    pub(crate) fn fat(&self) -> &SpinLock<Fat> {
        self.fat.get().expect("file system not mounted")
    }

    pub fn mounted(&self) -> bool {
        self.fat.get().is_some()
    }

    pub fn root_sector(&self) -> u32 {
        let fat = self.fat().lock();
        fat.cluster_to_sector(ROOT_DIR_CLUSTER)
    }

    // Open-inode cache.

    pub fn inode_open(&self, kernel: &Kernel, sector: u32) -> Result<Arc<Inode>> {
        let mut cache = self.inodes.lock();
        if let Some(ip) = cache.find(sector) {
            ip.state.lock().open_cnt += 1;
            return Ok(Arc::clone(ip));
        }
        let mut buf = [0u8; crate::param::SECTOR_SIZE];
        kernel.hal().fs_disk().read(sector, &mut buf)?;
        let data = DiskInode::decode(&buf)?;
        let ip = Arc::new(Inode {
            sector,
            write_sema: Semaphore::new(1),
            state: SpinLock::new("inode", inode::InodeState {
                open_cnt: 1,
                removed: false,
                deny_write_cnt: 0,
                data,
            }),
        });
        cache.insert(Arc::clone(&ip));
        Ok(ip)
    }

    pub fn inode_reopen(&self, ip: &Arc<Inode>) -> Arc<Inode> {
        ip.state.lock().open_cnt += 1;
        Arc::clone(ip)
    }

    /// Drops one reference; the last close evicts the cache entry and, for
    /// a removed inode, releases the record cluster and the data chain.
    pub fn inode_close(&self, kernel: &Kernel, ip: &Arc<Inode>) {
        let _ = kernel;
        let (last, removed, start) = {
            let mut state = ip.state.lock();
            state.open_cnt -= 1;
            assert!(state.open_cnt >= 0);
            (state.open_cnt == 0, state.removed, state.data.start)
        };
        if !last {
            return;
        }
        self.inodes.lock().evict(ip);
        if removed {
            let mut fat = self.fat().lock();
            let record = fat.sector_to_cluster(ip.sector);
            fat.remove_chain(record, 0);
            if start != 0 {
                let data = fat.sector_to_cluster(start);
                fat.remove_chain(data, 0);
            }
        }
    }

    // Path resolution.

    fn start_dir(
        &self,
        kernel: &Kernel,
        path: &Path,
        wdir: Option<&Arc<Inode>>,
    ) -> Result<Arc<Inode>> {
        match wdir {
            Some(dir) if !path.is_absolute() => Ok(self.inode_reopen(dir)),
            _ => self.inode_open(kernel, self.root_sector()),
        }
    }

    /// Dereferences `inode` while it is a symlink, resolving each target
    /// relative to `base` (or the root for absolute targets).
    fn follow_symlinks(
        &self,
        kernel: &Kernel,
        inode: Arc<Inode>,
        base: &Arc<Inode>,
        depth: usize,
    ) -> Result<Arc<Inode>> {
        if !inode.is_symlink() {
            return Ok(inode);
        }
        if depth >= SYMLOOP_MAX {
            self.inode_close(kernel, &inode);
            return Err(KernelError::NotFound);
        }
        let target = inode.link_target();
        self.inode_close(kernel, &inode);
        self.resolve_depth(kernel, Path::new(&target), Some(base), depth + 1)
    }

    /// Walks all but the final component, yielding the parent directory and
    /// the final name. A trailing-slash-only or empty final position maps to
    /// `"."`, so `"/"` resolves through the root's own dot entry.
    fn resolve_parent_depth(
        &self,
        kernel: &Kernel,
        path: &Path,
        wdir: Option<&Arc<Inode>>,
        depth: usize,
    ) -> Result<(Arc<Inode>, NameBuf)> {
        if path.is_empty_string() {
            return Err(KernelError::InvalidArgument);
        }
        let mut dir = self.start_dir(kernel, path, wdir)?;
        let mut rest = path;
        loop {
            let (next, elem) = match rest.skipelem() {
                Some(parts) => parts,
                None => {
                    let mut name = NameBuf::new();
                    name.push(b'.');
                    return Ok((dir, name));
                }
            };
            if elem.len() > NAME_MAX {
                self.inode_close(kernel, &dir);
                return Err(KernelError::NameTooLong);
            }
            if next.is_empty_string() {
                let mut name = NameBuf::new();
                name.try_extend_from_slice(elem)
                    .expect("component bounded by NAME_MAX");
                return Ok((dir, name));
            }

            let step = directory::lookup(kernel, &dir, elem)
                .and_then(|found| self.follow_symlinks(kernel, found, &dir, depth));
            let next_dir = match step {
                Ok(inode) => inode,
                Err(err) => {
                    self.inode_close(kernel, &dir);
                    return Err(err);
                }
            };
            if !next_dir.is_dir() {
                self.inode_close(kernel, &next_dir);
                self.inode_close(kernel, &dir);
                return Err(KernelError::NotDirectory);
            }
            self.inode_close(kernel, &dir);
            dir = next_dir;
            rest = next;
        }
    }

    fn resolve_depth(
        &self,
        kernel: &Kernel,
        path: &Path,
        wdir: Option<&Arc<Inode>>,
        depth: usize,
    ) -> Result<Arc<Inode>> {
        let (dir, name) = self.resolve_parent_depth(kernel, path, wdir, depth)?;
        let found = directory::lookup(kernel, &dir, &name)
            .and_then(|found| self.follow_symlinks(kernel, found, &dir, depth));
        self.inode_close(kernel, &dir);
        found
    }

    /// Resolves a path to its inode, following symlinks, from `wdir` or the
    /// root.
    pub fn resolve(
        &self,
        kernel: &Kernel,
        path: &Path,
        wdir: Option<&Arc<Inode>>,
    ) -> Result<Arc<Inode>> {
        self.resolve_depth(kernel, path, wdir, 0)
    }

    /// Resolves a path to `(parent directory, final name)` for create and
    /// remove operations.
    pub fn resolve_parent(
        &self,
        kernel: &Kernel,
        path: &Path,
        wdir: Option<&Arc<Inode>>,
    ) -> Result<(Arc<Inode>, NameBuf)> {
        self.resolve_parent_depth(kernel, path, wdir, 0)
    }

    // Top-level operations. Each holds the filesystem semaphore across the
    // whole resolve-and-mutate.

    /// Allocates a cluster for a new inode record and returns its sector.
    fn alloc_record_sector(&self) -> Result<(u32, u32)> {
        let mut fat = self.fat().lock();
        let clst = fat.create_chain(0)?;
        Ok((clst, fat.cluster_to_sector(clst)))
    }

    /// Frees a failed creation: the record cluster and, when the record made
    /// it to disk, the data chain it names. The sector may hold a stale
    /// record from an earlier file, so it is only trusted when this creation
    /// wrote it.
    fn release_record(&self, kernel: &Kernel, sector: u32, clst: u32, record_written: bool) {
        let start = if record_written {
            let mut buf = [0u8; crate::param::SECTOR_SIZE];
            match kernel.hal().fs_disk().read(sector, &mut buf) {
                Ok(()) => DiskInode::decode(&buf).map(|d| d.start).unwrap_or(0),
                Err(_) => 0,
            }
        } else {
            0
        };
        let mut fat = self.fat().lock();
        fat.remove_chain(clst, 0);
        if start != 0 {
            let data = fat.sector_to_cluster(start);
            fat.remove_chain(data, 0);
        }
    }

    /// Creates a file of `initial_size` zeroed bytes at `path`.
    pub fn create(
        &self,
        kernel: &Kernel,
        path: &Path,
        wdir: Option<&Arc<Inode>>,
        initial_size: u32,
    ) -> Result<()> {
        self.sema.down(kernel);
        defer!(self.sema.up(kernel));
        let (clst, sector) = self.alloc_record_sector()?;
        let mut record_written = false;
        let result = (|| -> Result<()> {
            let (dir, name) = self.resolve_parent(kernel, path, wdir)?;
            let added = Inode::create(kernel, sector, initial_size, false)
                .map(|_| record_written = true)
                .and_then(|_| directory::add(kernel, &dir, &name, sector));
            self.inode_close(kernel, &dir);
            added
        })();
        if result.is_err() {
            self.release_record(kernel, sector, clst, record_written);
        }
        result
    }

    /// Creates a directory at `path`, seeded with `.` and `..`.
    pub fn mkdir(&self, kernel: &Kernel, path: &Path, wdir: Option<&Arc<Inode>>) -> Result<()> {
        self.sema.down(kernel);
        defer!(self.sema.up(kernel));
        let (clst, sector) = self.alloc_record_sector()?;
        let mut record_written = false;
        let result = (|| -> Result<()> {
            let (dir, name) = self.resolve_parent(kernel, path, wdir)?;
            let parent_sector = dir.sector;
            let added = Inode::create(
                kernel,
                sector,
                DIR_INITIAL_ENTRIES * DIR_ENTRY_SIZE as u32,
                true,
            )
            .map(|_| record_written = true)
            .and_then(|_| directory::add(kernel, &dir, &name, sector))
            .and_then(|_| {
                let itself = self.inode_open(kernel, sector)?;
                let seeded = directory::add(kernel, &itself, b".", sector)
                    .and_then(|_| directory::add(kernel, &itself, b"..", parent_sector));
                self.inode_close(kernel, &itself);
                seeded
            });
            self.inode_close(kernel, &dir);
            added
        })();
        if result.is_err() {
            self.release_record(kernel, sector, clst, record_written);
        }
        result
    }

    /// Creates a symlink at `linkpath` pointing at `target`.
    pub fn symlink(
        &self,
        kernel: &Kernel,
        target: &[u8],
        linkpath: &Path,
        wdir: Option<&Arc<Inode>>,
    ) -> Result<()> {
        self.sema.down(kernel);
        defer!(self.sema.up(kernel));
        let (clst, sector) = self.alloc_record_sector()?;
        let mut record_written = false;
        let result = (|| -> Result<()> {
            let (dir, name) = self.resolve_parent(kernel, linkpath, wdir)?;
            let added = Inode::create_symlink(kernel, sector, target)
                .map(|_| record_written = true)
                .and_then(|_| directory::add(kernel, &dir, &name, sector));
            self.inode_close(kernel, &dir);
            added
        })();
        if result.is_err() {
            self.release_record(kernel, sector, clst, record_written);
        }
        result
    }

    /// Opens the inode at `path`, following symlinks on the final
    /// component.
    pub fn open(
        &self,
        kernel: &Kernel,
        path: &Path,
        wdir: Option<&Arc<Inode>>,
    ) -> Result<Arc<Inode>> {
        self.sema.down(kernel);
        defer!(self.sema.up(kernel));
        self.resolve(kernel, path, wdir)
    }

    /// Deletes the file or empty directory at `path`.
    pub fn remove(&self, kernel: &Kernel, path: &Path, wdir: Option<&Arc<Inode>>) -> Result<()> {
        self.sema.down(kernel);
        defer!(self.sema.up(kernel));
        let (dir, name) = self.resolve_parent(kernel, path, wdir)?;
        let removed = directory::remove(kernel, &dir, &name);
        self.inode_close(kernel, &dir);
        removed
    }
}
