//! Per-process page table.
//!
//! Models the hardware mapping the MMU would consult: one entry per mapped
//! user page carrying the frame binding and the writable/accessed/dirty
//! bits. Installing the mapping into real hardware is the embedder's job;
//! the kernel core treats this structure as authoritative.

use alloc::collections::BTreeMap;

use bitflags::bitflags;

use super::FrameId;

bitflags! {
    pub struct PteFlags: u8 {
        /// Writable by user code.
        const W = 1 << 0;
        /// Accessed since the bit was last cleared.
        const A = 1 << 1;
        /// Written since the bit was last cleared.
        const D = 1 << 2;
    }
}

pub struct Pte {
    pub frame: FrameId,
    pub flags: PteFlags,
}

pub struct PageTable {
    entries: BTreeMap<usize, Pte>,
}

impl PageTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, va: usize) -> Option<&Pte> {
        self.entries.get(&va)
    }

    pub fn present(&self, va: usize) -> bool {
        self.entries.contains_key(&va)
    }

    /// Maps `va` to `frame`. Fails if `va` is already mapped.
    pub fn set_page(&mut self, va: usize, frame: FrameId, writable: bool) -> bool {
        if self.entries.contains_key(&va) {
            return false;
        }
        let mut flags = PteFlags::empty();
        if writable {
            flags |= PteFlags::W;
        }
        let _ = self.entries.insert(va, Pte { frame, flags });
        true
    }

    /// Marks `va` "not present". Returns whether a mapping existed.
    pub fn clear_page(&mut self, va: usize) -> bool {
        self.entries.remove(&va).is_some()
    }

    pub fn is_writable(&self, va: usize) -> bool {
        self.get(va).map_or(false, |pte| pte.flags.contains(PteFlags::W))
    }

    pub fn is_accessed(&self, va: usize) -> bool {
        self.get(va).map_or(false, |pte| pte.flags.contains(PteFlags::A))
    }

    pub fn set_accessed(&mut self, va: usize, accessed: bool) {
        if let Some(pte) = self.entries.get_mut(&va) {
            pte.flags.set(PteFlags::A, accessed);
        }
    }

    pub fn is_dirty(&self, va: usize) -> bool {
        self.get(va).map_or(false, |pte| pte.flags.contains(PteFlags::D))
    }

    pub fn set_dirty(&mut self, va: usize, dirty: bool) {
        if let Some(pte) = self.entries.get_mut(&va) {
            pte.flags.set(PteFlags::D, dirty);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_unmap() {
        let mut pt = PageTable::new();
        assert!(pt.set_page(0x1000, 3, true));
        assert!(!pt.set_page(0x1000, 4, false));
        assert!(pt.present(0x1000));
        assert!(pt.is_writable(0x1000));
        assert!(!pt.is_accessed(0x1000));
        pt.set_accessed(0x1000, true);
        pt.set_dirty(0x1000, true);
        assert!(pt.is_accessed(0x1000));
        assert!(pt.is_dirty(0x1000));
        assert!(pt.clear_page(0x1000));
        assert!(!pt.clear_page(0x1000));
        assert!(!pt.present(0x1000));
    }

    #[test]
    fn read_only_mapping() {
        let mut pt = PageTable::new();
        assert!(pt.set_page(0x2000, 0, false));
        assert!(!pt.is_writable(0x2000));
    }
}
