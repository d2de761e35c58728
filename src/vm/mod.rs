//! Virtual memory.
//!
//! Each user process owns an `AddressSpace`: a supplemental page table (SPT)
//! mapping page-aligned virtual addresses to page descriptors, plus the page
//! table the hardware would walk. Pages are demand-loaded: address-space
//! setup only records descriptors in the `Uninit` state, and the first fault
//! claims a frame and runs the descriptor's initializer. Eviction picks
//! victims with a second-chance clock over the global frame table and moves
//! page contents to the swap device or back to the backing file.
//!
//! All VM-visible state — address spaces, the frame table, the swap bitmap —
//! sits behind one spin lock, acquired for allocation, victim selection and
//! fault resolution alike.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::mem;

use crate::error::{KernelError, Result};
use crate::file::File;
use crate::kernel::Kernel;
use crate::memlayout::{is_kernel_vaddr, pg_round_down, STACK_LIMIT, USER_STACK};
use crate::param::PGSIZE;

mod anon;
mod file;
mod frame;
mod pagetable;
mod swap;

pub use frame::{Frame, FrameId, FrameTable};
pub use pagetable::{PageTable, Pte, PteFlags};
pub use swap::{SwapSlot, SwapTable};

pub type AsId = u32;

/// The target a not-yet-faulted page morphs into on first claim.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageKind {
    Anon,
    File,
}

/// Auxiliary record for a lazily loaded executable segment page.
#[derive(Clone)]
pub struct SegmentAux {
    pub file: Arc<File>,
    pub offset: u32,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

/// Descriptor payload of a file-backed (mmap) page.
#[derive(Clone)]
pub struct FileMeta {
    pub file: Arc<File>,
    pub offset: u32,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    /// First virtual address of the mapping this page belongs to.
    pub mmap_base: usize,
}

/// Initializer stored in an `Uninit` descriptor, run on first claim.
#[derive(Clone)]
pub enum PageInit {
    /// Zero-filled page; stack pages use this.
    Zero,
    /// Executable segment: read from the image, zero the tail, become `Anon`.
    LoadSegment(SegmentAux),
    /// Memory-mapped file region; becomes `File`.
    Mmap(FileMeta),
}

pub enum PageState {
    /// Not yet faulted in.
    Uninit { init: PageInit, target: PageKind },
    /// Zero-fill or previously swapped out.
    Anon { slot: Option<SwapSlot> },
    /// Backed by a file region; written back on eviction/unmap when dirty.
    File(FileMeta),
}

/// A page descriptor: one entry of the supplemental page table.
pub struct Page {
    pub va: usize,
    pub writable: bool,
    pub state: PageState,
    /// The frame this page currently occupies, if resident.
    pub frame: Option<FrameId>,
}

impl Page {
    pub fn kind(&self) -> PageKind {
        match &self.state {
            PageState::Uninit { target, .. } => *target,
            PageState::Anon { .. } => PageKind::Anon,
            PageState::File(_) => PageKind::File,
        }
    }
}

pub struct AddressSpace {
    pub pt: PageTable,
    pub spt: BTreeMap<usize, Page>,
    /// Lowest allocated stack page; stack growth moves it down.
    pub stack_ceiling: usize,
}

impl AddressSpace {
    fn new() -> Self {
        Self {
            pt: PageTable::new(),
            spt: BTreeMap::new(),
            stack_ceiling: USER_STACK,
        }
    }
}

pub struct Vm {
    spaces: BTreeMap<AsId, AddressSpace>,
    frames: FrameTable,
    swap: SwapTable,
    next_as: AsId,
}

impl Vm {
    pub fn new(user_frames: usize, swap_sectors: u32) -> Self {
        Self {
            spaces: BTreeMap::new(),
            frames: FrameTable::new(user_frames),
            swap: SwapTable::new(swap_sectors),
            next_as: 1,
        }
    }

    pub fn space(&self, as_id: AsId) -> Option<&AddressSpace> {
        self.spaces.get(&as_id)
    }

    pub fn space_mut(&mut self, as_id: AsId) -> Option<&mut AddressSpace> {
        self.spaces.get_mut(&as_id)
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    fn new_space(&mut self) -> AsId {
        let id = self.next_as;
        self.next_as += 1;
        assert!(self.spaces.insert(id, AddressSpace::new()).is_none());
        id
    }
}

/// Allocates a free frame, evicting if the pool is exhausted.
fn get_frame(kernel: &Kernel, vm: &mut Vm) -> Result<FrameId> {
    if let Some(fid) = vm.frames.take_free() {
        return Ok(fid);
    }

    // Second-chance clock: clear-and-rotate frames whose page was accessed,
    // select the first frame with a clear accessed bit. A full rotation
    // without a hit falls back to the head.
    let mut victim = None;
    for _ in 0..vm.frames.clock_len() {
        let fid = match vm.frames.clock_front() {
            Some(fid) => fid,
            None => break,
        };
        let (as_id, va) = vm.frames.frame(fid).page.expect("unbound frame on clock");
        let accessed = vm
            .spaces
            .get(&as_id)
            .map_or(false, |space| space.pt.is_accessed(va));
        if accessed {
            if let Some(space) = vm.spaces.get_mut(&as_id) {
                space.pt.set_accessed(va, false);
            }
            vm.frames.clock_rotate();
        } else {
            victim = vm.frames.clock_pop();
            break;
        }
    }
    let fid = match victim.or_else(|| vm.frames.clock_pop()) {
        Some(fid) => fid,
        None => return Err(KernelError::OutOfMemory),
    };

    if let Err(err) = swap_out(kernel, vm, fid) {
        // The victim stays resident; the failure propagates as a
        // frame-acquire failure.
        vm.frames.push_clock(fid);
        return Err(err);
    }
    let frame = vm.frames.frame_mut(fid);
    frame.page = None;
    frame.data.fill(0);
    Ok(fid)
}

/// Pushes the page installed in `fid` out to its backing store and clears
/// the hardware mapping. The frame keeps its contents until the caller
/// recycles it.
fn swap_out(kernel: &Kernel, vm: &mut Vm, fid: FrameId) -> Result<()> {
    let (as_id, va) = vm.frames.frame(fid).page.expect("unbound frame on clock");
    let Vm {
        ref mut spaces,
        ref mut frames,
        ref mut swap,
        ..
    } = *vm;
    let space = spaces.get_mut(&as_id).expect("frame bound to dead space");
    let dirty = space.pt.is_dirty(va);
    let data = &frames.frame(fid).data;
    let page = space.spt.get_mut(&va).expect("frame bound to missing page");
    match &mut page.state {
        PageState::Anon { slot } => {
            let s = swap.alloc()?;
            if let Err(err) = anon::write_swap(kernel, s, data) {
                swap.free(s);
                return Err(err);
            }
            *slot = Some(s);
        }
        PageState::File(meta) => {
            if dirty {
                file::write_back(kernel, meta, data)?;
            }
        }
        PageState::Uninit { .. } => panic!("uninit page resident"),
    }
    page.frame = None;
    let _ = space.pt.clear_page(va);
    Ok(())
}

/// Binds a frame to the page at `va` and populates it: `vm_do_claim`.
fn do_claim(kernel: &Kernel, vm: &mut Vm, as_id: AsId, va: usize) -> Result<()> {
    {
        let space = vm.spaces.get(&as_id).ok_or(KernelError::InvalidArgument)?;
        let page = space.spt.get(&va).ok_or(KernelError::NotFound)?;
        if page.frame.is_some() {
            return Ok(());
        }
    }
    let fid = get_frame(kernel, vm)?;

    let Vm {
        ref mut spaces,
        ref mut frames,
        ref mut swap,
        ..
    } = *vm;
    let space = spaces.get_mut(&as_id).expect("claim against dead space");
    let writable = space.spt[&va].writable;

    frames.frame_mut(fid).page = Some((as_id, va));
    frames.push_clock(fid);
    space.spt.get_mut(&va).expect("claim against missing page").frame = Some(fid);
    assert!(space.pt.set_page(va, fid, writable));

    // Populate the frame from the page's backing store.
    let filled = {
        let data = &mut frames.frame_mut(fid).data;
        match &space.spt[&va].state {
            PageState::Uninit {
                init: PageInit::Zero,
                ..
            } => {
                data.fill(0);
                Ok(())
            }
            PageState::Uninit {
                init: PageInit::LoadSegment(aux),
                ..
            } => file::read_file_page(kernel, &aux.file, aux.offset, aux.read_bytes, data),
            PageState::Uninit {
                init: PageInit::Mmap(meta),
                ..
            } => file::read_file_page(kernel, &meta.file, meta.offset, meta.read_bytes, data),
            PageState::Anon { slot: None } => Ok(()),
            PageState::Anon { slot: Some(slot) } => anon::read_swap(kernel, *slot, data),
            PageState::File(meta) => {
                file::read_file_page(kernel, &meta.file, meta.offset, meta.read_bytes, data)
            }
        }
    };
    if let Err(err) = filled {
        space.spt.get_mut(&va).expect("claim against missing page").frame = None;
        let _ = space.pt.clear_page(va);
        frames.release(fid);
        return Err(err);
    }

    // Morph `Uninit` into its target and release a consumed swap slot.
    {
        let page = space.spt.get_mut(&va).expect("claim against missing page");
        page.state = match mem::replace(&mut page.state, PageState::Anon { slot: None }) {
            PageState::Uninit {
                init: PageInit::Zero,
                ..
            }
            | PageState::Uninit {
                init: PageInit::LoadSegment(_),
                ..
            } => PageState::Anon { slot: None },
            PageState::Uninit {
                init: PageInit::Mmap(meta),
                ..
            } => PageState::File(meta),
            PageState::Anon { slot: Some(slot) } => {
                swap.free(slot);
                PageState::Anon { slot: None }
            }
            other => other,
        };
    }
    space.pt.set_accessed(va, true);
    Ok(())
}

/// Tears a page down: final write-back, frame release, swap-slot release.
/// The caller removes the descriptor from the SPT.
fn destroy_page(kernel: &Kernel, frames: &mut FrameTable, swap: &mut SwapTable,
                pt: &mut PageTable, page: &mut Page) {
    if let Some(fid) = page.frame.take() {
        if let PageState::File(meta) = &page.state {
            if pt.is_dirty(page.va) {
                // A device failure here loses the write-back; the page is
                // going away regardless.
                if file::write_back(kernel, meta, &frames.frame(fid).data).is_err() {
                    log::warn!("write-back failed during unmap of {:#x}", page.va);
                }
            }
        }
        frames.release(fid);
    }
    if let PageState::Anon { slot: Some(slot) } = page.state {
        swap.free(slot);
    }
    let _ = pt.clear_page(page.va);
}

impl Kernel {
    /// Creates an empty address space.
    pub fn vm_new_space(&self) -> AsId {
        self.vm().lock().new_space()
    }

    /// Destroys an address space: every page is torn down (file-backed pages
    /// write back when dirty) and each mapping's file handle is closed.
    pub fn vm_destroy_space(&self, as_id: AsId) {
        let mapping_files = {
            let mut vm = self.vm().lock();
            let mut space = match vm.spaces.remove(&as_id) {
                Some(space) => space,
                None => return,
            };
            let mut mappings: BTreeMap<usize, Arc<File>> = BTreeMap::new();
            let vas: Vec<usize> = space.spt.keys().copied().collect();
            for va in vas {
                let mut page = space.spt.remove(&va).expect("spt key vanished");
                match &page.state {
                    PageState::File(meta) => {
                        let _ = mappings
                            .entry(meta.mmap_base)
                            .or_insert_with(|| Arc::clone(&meta.file));
                    }
                    PageState::Uninit {
                        init: PageInit::Mmap(meta),
                        ..
                    } => {
                        let _ = mappings
                            .entry(meta.mmap_base)
                            .or_insert_with(|| Arc::clone(&meta.file));
                    }
                    _ => {}
                }
                let Vm {
                    ref mut frames,
                    ref mut swap,
                    ..
                } = *vm;
                destroy_page(self, frames, swap, &mut space.pt, &mut page);
            }
            mappings
        };
        // Close the per-mapping handles outside the VM lock.
        for (_, file) in mapping_files {
            file.close(self);
        }
    }

    /// Records a pending page: `vm_alloc_page_with_initializer`. Fails if a
    /// descriptor already covers `va`.
    pub fn vm_alloc_page(
        &self,
        as_id: AsId,
        va: usize,
        writable: bool,
        init: PageInit,
        target: PageKind,
    ) -> Result<()> {
        assert_eq!(va % PGSIZE, 0);
        if is_kernel_vaddr(va) {
            return Err(KernelError::InvalidArgument);
        }
        let mut vm = self.vm().lock();
        let space = vm.spaces.get_mut(&as_id).ok_or(KernelError::InvalidArgument)?;
        if space.spt.contains_key(&va) {
            return Err(KernelError::AlreadyExists);
        }
        let _ = space.spt.insert(
            va,
            Page {
                va,
                writable,
                state: PageState::Uninit { init, target },
                frame: None,
            },
        );
        Ok(())
    }

    /// Claims the page covering `va`: frame, mapping, population.
    pub fn vm_claim_page(&self, as_id: AsId, va: usize) -> Result<()> {
        let mut vm = self.vm().lock();
        do_claim(self, &mut vm, as_id, pg_round_down(va))
    }

    /// Classifies a page fault and dispatches lazy load, swap-in, stack
    /// growth, or rejection. Returns false when the process must die.
    ///
    /// `rsp` is the stack pointer saved in the trap frame; kernel-mode
    /// faults fall back to the value stashed at syscall entry.
    pub fn handle_page_fault(
        &self,
        addr: usize,
        present: bool,
        write: bool,
        user: bool,
        rsp: u64,
    ) -> bool {
        if user && is_kernel_vaddr(addr) {
            return false;
        }
        if present {
            // The mapping exists: the only fault left is a write to a
            // read-only page.
            return false;
        }
        let (as_id, stashed_rsp) =
            self.with_current(|t| (t.as_id, t.user_rsp));
        let as_id = match as_id {
            Some(as_id) => as_id,
            None => return false,
        };
        let rsp = if user { rsp } else { stashed_rsp } as usize;
        let page_va = pg_round_down(addr);

        let known = {
            let vm = self.vm().lock();
            match vm.spaces.get(&as_id).and_then(|s| s.spt.get(&page_va)) {
                Some(page) => {
                    if write && !page.writable {
                        return false;
                    }
                    true
                }
                None => false,
            }
        };

        if !known {
            let in_stack = addr >= rsp.saturating_sub(64)
                && addr < USER_STACK
                && addr >= USER_STACK - STACK_LIMIT;
            if !in_stack {
                return false;
            }
            if self.grow_stack(as_id, page_va).is_err() {
                return false;
            }
        }
        self.vm_claim_page(as_id, page_va).is_ok()
    }

    /// Allocates anonymous pages from the current stack ceiling down to
    /// `target` inclusive and lowers the ceiling.
    fn grow_stack(&self, as_id: AsId, target: usize) -> Result<()> {
        let mut vm = self.vm().lock();
        let space = vm.spaces.get_mut(&as_id).ok_or(KernelError::InvalidArgument)?;
        let ceiling = space.stack_ceiling;
        let mut va = target;
        while va < ceiling {
            if !space.spt.contains_key(&va) {
                let _ = space.spt.insert(
                    va,
                    Page {
                        va,
                        writable: true,
                        state: PageState::Uninit {
                            init: PageInit::Zero,
                            target: PageKind::Anon,
                        },
                        frame: None,
                    },
                );
            }
            va += PGSIZE;
        }
        space.stack_ceiling = ceiling.min(target);
        Ok(())
    }

    /// Duplicates `src` for fork. `Uninit` descriptors get a deep copy of
    /// their initializer; resident page types are claimed in the child and
    /// copied eagerly. File-backed mappings are reopened, once per mapping.
    pub fn vm_copy_space(&self, src: AsId) -> Result<AsId> {
        let mut vm = self.vm().lock();
        let dst = vm.new_space();
        let result = self.copy_space_inner(&mut vm, src, dst);
        if result.is_err() {
            drop(vm);
            self.vm_destroy_space(dst);
        }
        result.map(|_| dst)
    }

    fn copy_space_inner(&self, vm: &mut Vm, src: AsId, dst: AsId) -> Result<()> {
        let (vas, ceiling) = {
            let space = vm.spaces.get(&src).ok_or(KernelError::InvalidArgument)?;
            (space.spt.keys().copied().collect::<Vec<_>>(), space.stack_ceiling)
        };
        vm.spaces.get_mut(&dst).expect("fresh space").stack_ceiling = ceiling;

        // One reopened handle per mapping, shared by that mapping's pages.
        let mut remapped: BTreeMap<usize, Arc<File>> = BTreeMap::new();
        let mut remap = |kernel: &Kernel, base: usize, file: &Arc<File>| -> Result<Arc<File>> {
            if let Some(dup) = remapped.get(&base) {
                return Ok(Arc::clone(dup));
            }
            let dup = file.duplicate(kernel)?;
            let _ = remapped.insert(base, Arc::clone(&dup));
            Ok(dup)
        };

        for va in vas {
            enum CopyPlan {
                Pending(PageInit, PageKind, bool),
                Eager(PageState, bool),
            }
            let plan = {
                let space = vm.spaces.get(&src).expect("source space vanished");
                let page = space.spt.get(&va).expect("source page vanished");
                match &page.state {
                    PageState::Uninit { init, target } => {
                        let init = match init {
                            PageInit::Mmap(meta) => {
                                let mut meta = meta.clone();
                                meta.file = remap(self, meta.mmap_base, &meta.file)?;
                                PageInit::Mmap(meta)
                            }
                            other => other.clone(),
                        };
                        CopyPlan::Pending(init, *target, page.writable)
                    }
                    PageState::Anon { .. } => {
                        CopyPlan::Eager(PageState::Anon { slot: None }, page.writable)
                    }
                    PageState::File(meta) => {
                        let mut meta = meta.clone();
                        meta.file = remap(self, meta.mmap_base, &meta.file)?;
                        CopyPlan::Eager(PageState::File(meta), page.writable)
                    }
                }
            };

            match plan {
                CopyPlan::Pending(init, target, writable) => {
                    let space = vm.spaces.get_mut(&dst).expect("dest space vanished");
                    let _ = space.spt.insert(
                        va,
                        Page {
                            va,
                            writable,
                            state: PageState::Uninit { init, target },
                            frame: None,
                        },
                    );
                }
                CopyPlan::Eager(state, writable) => {
                    // Make the parent resident, snapshot its frame, then
                    // claim the child page and install the snapshot.
                    do_claim(self, vm, src, va)?;
                    let (snapshot, dirty) = {
                        let space = vm.spaces.get(&src).expect("source space vanished");
                        let fid = space.spt[&va].frame.expect("just claimed");
                        (*vm.frames.frame(fid).data, space.pt.is_dirty(va))
                    };
                    let space = vm.spaces.get_mut(&dst).expect("dest space vanished");
                    let _ = space.spt.insert(
                        va,
                        Page {
                            va,
                            writable,
                            state,
                            frame: None,
                        },
                    );
                    do_claim(self, vm, dst, va)?;
                    let space = vm.spaces.get_mut(&dst).expect("dest space vanished");
                    let fid = space.spt[&va].frame.expect("just claimed");
                    *vm.frames.frame_mut(fid).data = snapshot;
                    if dirty {
                        space.pt.set_dirty(va, true);
                    }
                }
            }
        }
        Ok(())
    }

    /// Kernel-side read of user memory: validates the whole range against
    /// the SPT, claims pages as needed and copies out of the frames.
    pub fn copy_in_user(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        self.user_access(addr, buf.len(), false, |frame, off, n, done| {
            buf[done..done + n].copy_from_slice(&frame[off..off + n]);
        })
    }

    /// Kernel-side write into user memory; the range must be writable.
    pub fn copy_out_user(&self, addr: usize, bytes: &[u8]) -> Result<()> {
        self.user_access(addr, bytes.len(), true, |frame, off, n, done| {
            frame[off..off + n].copy_from_slice(&bytes[done..done + n]);
        })
    }

    /// Writes a plain-bytes value into user memory.
    pub fn copy_out_obj<T: zerocopy::AsBytes>(&self, addr: usize, obj: &T) -> Result<()> {
        self.copy_out_user(addr, obj.as_bytes())
    }

    /// Checks a user range against the SPT without touching it: every page
    /// must have a descriptor, writable when `write` is set.
    pub fn validate_user_range(&self, addr: usize, len: usize, write: bool) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = addr.checked_add(len).ok_or(KernelError::InvalidArgument)?;
        if is_kernel_vaddr(addr) || is_kernel_vaddr(end - 1) {
            return Err(KernelError::InvalidArgument);
        }
        let as_id = self
            .with_current(|t| t.as_id)
            .ok_or(KernelError::InvalidArgument)?;
        let vm = self.vm().lock();
        let space = vm.spaces.get(&as_id).ok_or(KernelError::InvalidArgument)?;
        let mut va = pg_round_down(addr);
        while va < end {
            let page = space.spt.get(&va).ok_or(KernelError::InvalidArgument)?;
            if write && !page.writable {
                return Err(KernelError::InvalidArgument);
            }
            va += PGSIZE;
        }
        Ok(())
    }

    fn user_access(
        &self,
        addr: usize,
        len: usize,
        write: bool,
        mut access: impl FnMut(&mut [u8; PGSIZE], usize, usize, usize),
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = addr.checked_add(len).ok_or(KernelError::InvalidArgument)?;
        if is_kernel_vaddr(addr) || is_kernel_vaddr(end - 1) {
            return Err(KernelError::InvalidArgument);
        }
        let as_id = self
            .with_current(|t| t.as_id)
            .ok_or(KernelError::InvalidArgument)?;

        let mut vm = self.vm().lock();

        // Validate the entire range page-by-page before touching anything.
        let space = vm.spaces.get(&as_id).ok_or(KernelError::InvalidArgument)?;
        let mut va = pg_round_down(addr);
        while va < end {
            let page = space.spt.get(&va).ok_or(KernelError::InvalidArgument)?;
            if write && !page.writable {
                return Err(KernelError::InvalidArgument);
            }
            va += PGSIZE;
        }

        let mut cur = addr;
        let mut done = 0;
        while done < len {
            let va = pg_round_down(cur);
            do_claim(self, &mut vm, as_id, va)?;
            let Vm {
                ref mut spaces,
                ref mut frames,
                ..
            } = *vm;
            let space = spaces.get_mut(&as_id).expect("space vanished mid-copy");
            let fid = space.spt[&va].frame.expect("just claimed");
            let off = cur - va;
            let n = (PGSIZE - off).min(len - done);
            access(&mut frames.frame_mut(fid).data, off, n, done);
            space.pt.set_accessed(va, true);
            if write {
                space.pt.set_dirty(va, true);
            }
            cur += n;
            done += n;
        }
        Ok(())
    }

    /// Reads a NUL-terminated string from user memory, capped at `max`
    /// bytes (the NUL excluded).
    pub fn copy_in_str_user(&self, addr: usize, max: usize) -> Result<Vec<u8>> {
        let as_id = self
            .with_current(|t| t.as_id)
            .ok_or(KernelError::InvalidArgument)?;
        let mut vm = self.vm().lock();
        let mut out = Vec::new();
        let mut cur = addr;
        loop {
            if is_kernel_vaddr(cur) {
                return Err(KernelError::InvalidArgument);
            }
            let va = pg_round_down(cur);
            {
                let space = vm.spaces.get(&as_id).ok_or(KernelError::InvalidArgument)?;
                if !space.spt.contains_key(&va) {
                    return Err(KernelError::InvalidArgument);
                }
            }
            do_claim(self, &mut vm, as_id, va)?;
            let Vm {
                ref mut spaces,
                ref mut frames,
                ..
            } = *vm;
            let space = spaces.get_mut(&as_id).expect("space vanished mid-copy");
            let fid = space.spt[&va].frame.expect("just claimed");
            space.pt.set_accessed(va, true);
            let data = &frames.frame(fid).data;
            let mut off = cur - va;
            while off < PGSIZE {
                let byte = data[off];
                if byte == 0 {
                    return Ok(out);
                }
                if out.len() >= max {
                    return Err(KernelError::NameTooLong);
                }
                out.push(byte);
                off += 1;
            }
            cur = va + PGSIZE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::{test_kernel, test_kernel_with};
    use crate::kernel::KernelConfig;

    fn anon_space(kernel: &Kernel) -> AsId {
        let as_id = kernel.vm_new_space();
        kernel.with_current(|t| t.as_id = Some(as_id));
        as_id
    }

    fn alloc_anon(kernel: &Kernel, as_id: AsId, va: usize) {
        kernel
            .vm_alloc_page(as_id, va, true, PageInit::Zero, PageKind::Anon)
            .unwrap();
    }

    #[test]
    fn claim_installs_frame_and_mapping() {
        let kernel = test_kernel();
        let as_id = anon_space(&kernel);
        alloc_anon(&kernel, as_id, 0x10000);
        kernel.vm_claim_page(as_id, 0x10000).unwrap();
        let vm = kernel.vm().lock();
        let space = vm.space(as_id).unwrap();
        let page = &space.spt[&0x10000];
        let fid = page.frame.unwrap();
        // The frame's back-pointer and the descriptor agree.
        assert_eq!(vm.frames().frame(fid).page, Some((as_id, 0x10000)));
        assert!(space.pt.present(0x10000));
        assert!(space.pt.is_writable(0x10000));
    }

    #[test]
    fn double_alloc_rejected() {
        let kernel = test_kernel();
        let as_id = anon_space(&kernel);
        alloc_anon(&kernel, as_id, 0x10000);
        assert_eq!(
            kernel.vm_alloc_page(as_id, 0x10000, true, PageInit::Zero, PageKind::Anon),
            Err(KernelError::AlreadyExists)
        );
    }

    #[test]
    fn user_copy_round_trip() {
        let kernel = test_kernel();
        let as_id = anon_space(&kernel);
        alloc_anon(&kernel, as_id, 0x10000);
        alloc_anon(&kernel, as_id, 0x11000);
        let msg = b"crossing a page boundary";
        let addr = 0x11000 - 10;
        kernel.copy_out_user(addr, msg).unwrap();
        let mut back = [0u8; 24];
        kernel.copy_in_user(addr, &mut back).unwrap();
        assert_eq!(&back, msg);
    }

    #[test]
    fn copy_rejects_unmapped_and_kernel_ranges() {
        let kernel = test_kernel();
        let as_id = anon_space(&kernel);
        alloc_anon(&kernel, as_id, 0x10000);
        assert!(kernel.copy_out_user(0x20000, b"x").is_err());
        assert!(kernel
            .copy_out_user(crate::memlayout::KERN_BASE, b"x")
            .is_err());
        // Read-only page rejects writes but allows reads.
        kernel
            .vm_alloc_page(as_id, 0x30000, false, PageInit::Zero, PageKind::Anon)
            .unwrap();
        assert!(kernel.copy_out_user(0x30000, b"x").is_err());
        let mut b = [0u8; 1];
        assert!(kernel.copy_in_user(0x30000, &mut b).is_ok());
    }

    #[test]
    fn copy_in_str_reads_until_nul() {
        let kernel = test_kernel();
        let as_id = anon_space(&kernel);
        alloc_anon(&kernel, as_id, 0x10000);
        kernel.copy_out_user(0x10000, b"hello\0junk").unwrap();
        let s = kernel.copy_in_str_user(0x10000, 64).unwrap();
        assert_eq!(s, b"hello");
        assert_eq!(
            kernel.copy_in_str_user(0x10000, 3),
            Err(KernelError::NameTooLong)
        );
    }

    /// Eviction correctness: with a 10-frame pool, write a distinct byte to
    /// 20 anonymous pages, then read every page back. Contents survive the
    /// round trip through swap and at most 10 slots stay allocated.
    #[test]
    fn eviction_round_trips_through_swap() {
        let kernel = test_kernel_with(KernelConfig {
            user_frames: 10,
            mlfqs: false,
            format: true,
        });
        let as_id = anon_space(&kernel);
        let base = 0x40000;
        for i in 0..20usize {
            let va = base + i * PGSIZE;
            alloc_anon(&kernel, as_id, va);
            kernel.copy_out_user(va, &[i as u8]).unwrap();
        }
        for i in 0..20usize {
            let va = base + i * PGSIZE;
            let mut b = [0u8; 1];
            kernel.copy_in_user(va, &mut b).unwrap();
            assert_eq!(b[0], i as u8, "page {} lost its contents", i);
        }
        let vm = kernel.vm().lock();
        assert!(vm.swap().allocated() <= 10);
        // Every resident page's frame back-pointer is consistent, and every
        // swapped-out page holds an allocated slot.
        let space = vm.space(as_id).unwrap();
        for (va, page) in &space.spt {
            if let Some(fid) = page.frame {
                assert_eq!(vm.frames().frame(fid).page, Some((as_id, *va)));
                assert!(space.pt.present(*va));
            } else {
                assert!(!space.pt.present(*va));
                match page.state {
                    PageState::Anon { slot: Some(slot) } => {
                        assert!(vm.swap().is_allocated(slot));
                    }
                    _ => panic!("non-resident page without a swap slot"),
                }
            }
        }
    }

    /// Stack growth: an access within 64 bytes below rsp grows the stack
    /// down to the fault address; an access below the 1 MiB limit is
    /// rejected.
    #[test]
    fn stack_growth_heuristic() {
        let kernel = test_kernel();
        let as_id = anon_space(&kernel);
        // The initial stack page, as exec would set it up.
        alloc_anon(&kernel, as_id, USER_STACK - PGSIZE);
        kernel.vm_claim_page(as_id, USER_STACK - PGSIZE).unwrap();
        {
            let mut vm = kernel.vm().lock();
            vm.space_mut(as_id).unwrap().stack_ceiling = USER_STACK - PGSIZE;
        }

        // Push rsp down one page and touch just below it.
        let rsp = (USER_STACK - PGSIZE - 8) as u64;
        assert!(kernel.handle_page_fault(rsp as usize - 8, false, true, true, rsp));

        // Far jump with rsp moved to the limit: every page in between is
        // allocated lazily.
        let bottom = USER_STACK - STACK_LIMIT;
        assert!(kernel.handle_page_fault(bottom, false, true, true, bottom as u64));
        {
            let vm = kernel.vm().lock();
            let space = vm.space(as_id).unwrap();
            assert_eq!(space.stack_ceiling, bottom);
            assert!(space.spt.contains_key(&(bottom + 8 * PGSIZE)));
        }

        // One byte below the limit dies.
        assert!(!kernel.handle_page_fault(bottom - 1, false, true, true, (bottom - 1) as u64));
        // A wild address far from rsp dies.
        assert!(!kernel.handle_page_fault(0x9990_0000, false, false, true, rsp));
        // Kernel addresses faulting from user mode die.
        assert!(!kernel.handle_page_fault(
            crate::memlayout::KERN_BASE + 16,
            false,
            false,
            true,
            rsp
        ));
    }

    #[test]
    fn write_fault_on_read_only_page_is_fatal() {
        let kernel = test_kernel();
        let as_id = anon_space(&kernel);
        kernel
            .vm_alloc_page(as_id, 0x50000, false, PageInit::Zero, PageKind::Anon)
            .unwrap();
        let rsp = USER_STACK as u64;
        assert!(!kernel.handle_page_fault(0x50000, false, true, true, rsp));
        // A read fault on the same page lazily loads it.
        assert!(kernel.handle_page_fault(0x50000, false, false, true, rsp));
        // Protection faults (present) are always fatal.
        assert!(!kernel.handle_page_fault(0x50000, true, true, true, rsp));
    }

    /// Copy-on-fork: parent and child diverge after the copy.
    #[test]
    fn fork_copy_preserves_both_sides() {
        let kernel = test_kernel();
        let parent = anon_space(&kernel);
        alloc_anon(&kernel, parent, 0x10000);
        kernel.copy_out_user(0x10000, b"parent data").unwrap();

        let child = kernel.vm_copy_space(parent).unwrap();

        // Diverge: parent rewrites, child keeps the original snapshot.
        kernel.copy_out_user(0x10000, b"parent NEW!").unwrap();
        let mut buf = [0u8; 11];
        kernel.with_current(|t| t.as_id = Some(child));
        kernel.copy_in_user(0x10000, &mut buf).unwrap();
        assert_eq!(&buf, b"parent data");
        kernel.with_current(|t| t.as_id = Some(parent));
        kernel.copy_in_user(0x10000, &mut buf).unwrap();
        assert_eq!(&buf, b"parent NEW!");
    }

    #[test]
    fn fork_copies_pending_pages_lazily() {
        let kernel = test_kernel();
        let parent = anon_space(&kernel);
        alloc_anon(&kernel, parent, 0x10000);
        let child = kernel.vm_copy_space(parent).unwrap();
        let vm = kernel.vm().lock();
        let page = &vm.space(child).unwrap().spt[&0x10000];
        assert!(page.frame.is_none());
        assert!(matches!(
            page.state,
            PageState::Uninit {
                init: PageInit::Zero,
                target: PageKind::Anon
            }
        ));
    }
}
