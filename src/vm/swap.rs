//! Swap slot allocator.
//!
//! A bitmap over the swap device where each run of `SECTORS_PER_PAGE`
//! consecutive bits represents one slot, large enough to hold one evicted
//! page. Slots are allocated first-fit on eviction of anonymous pages and
//! freed on swap-in.

use bitvec::prelude::*;

use crate::error::{KernelError, Result};
use crate::param::SECTORS_PER_PAGE;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SwapSlot(u32);

impl SwapSlot {
    /// First sector of this slot on the swap device.
    pub fn first_sector(self) -> u32 {
        self.0 * SECTORS_PER_PAGE as u32
    }
}

pub struct SwapTable {
    used: BitVec,
    slots: u32,
}

impl SwapTable {
    /// Builds the allocator for a swap device of `sectors` sectors; a
    /// trailing partial slot is unusable and ignored.
    pub fn new(sectors: u32) -> Self {
        let slots = sectors / SECTORS_PER_PAGE as u32;
        Self {
            used: BitVec::repeat(false, slots as usize * SECTORS_PER_PAGE),
            slots,
        }
    }

    /// Finds the first clear run and sets it.
    pub fn alloc(&mut self) -> Result<SwapSlot> {
        for slot in 0..self.slots as usize {
            let range = slot * SECTORS_PER_PAGE..(slot + 1) * SECTORS_PER_PAGE;
            if self.used[range.clone()].not_any() {
                self.used[range].fill(true);
                return Ok(SwapSlot(slot as u32));
            }
        }
        Err(KernelError::SwapFull)
    }

    /// Clears the slot's run.
    pub fn free(&mut self, slot: SwapSlot) {
        let base = slot.0 as usize * SECTORS_PER_PAGE;
        let range = base..base + SECTORS_PER_PAGE;
        assert!(self.used[range.clone()].all(), "freeing a free swap slot");
        self.used[range].fill(false);
    }

    pub fn is_allocated(&self, slot: SwapSlot) -> bool {
        let base = slot.0 as usize * SECTORS_PER_PAGE;
        self.used[base..base + SECTORS_PER_PAGE].all()
    }

    /// Number of slots currently allocated.
    pub fn allocated(&self) -> usize {
        self.used.count_ones() / SECTORS_PER_PAGE
    }

    pub fn capacity(&self) -> u32 {
        self.slots
    }
}
