//! Anonymous pages.
//!
//! Pages with no backing file: zero-filled on first claim, pushed to the
//! swap device on eviction and read back on the next fault. The sector
//! transfers go through the HAL swap disk, one sector at a time.

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::param::{PGSIZE, SECTORS_PER_PAGE, SECTOR_SIZE};

use super::SwapSlot;

/// Reads a slot's sectors back into a frame.
pub(super) fn read_swap(kernel: &Kernel, slot: SwapSlot, data: &mut [u8; PGSIZE]) -> Result<()> {
    let disk = kernel.hal().swap_disk();
    let mut buf = [0u8; SECTOR_SIZE];
    for i in 0..SECTORS_PER_PAGE {
        disk.read(slot.first_sector() + i as u32, &mut buf)?;
        data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&buf);
    }
    Ok(())
}

/// Writes a frame's contents into a slot.
pub(super) fn write_swap(kernel: &Kernel, slot: SwapSlot, data: &[u8; PGSIZE]) -> Result<()> {
    let disk = kernel.hal().swap_disk();
    if (slot.first_sector() + SECTORS_PER_PAGE as u32) > disk.size() {
        return Err(KernelError::DeviceError);
    }
    let mut buf = [0u8; SECTOR_SIZE];
    for i in 0..SECTORS_PER_PAGE {
        buf.copy_from_slice(&data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
        disk.write(slot.first_sector() + i as u32, &buf)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::test_kernel;
    use crate::vm::SwapTable;

    #[test]
    fn swap_round_trip_preserves_page_contents() {
        let kernel = test_kernel();
        let mut table = SwapTable::new(kernel.hal().swap_disk().size());
        let slot = table.alloc().unwrap();
        let mut page = [0u8; PGSIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        write_swap(&kernel, slot, &page).unwrap();
        let mut back = [0u8; PGSIZE];
        read_swap(&kernel, slot, &mut back).unwrap();
        assert!(page.iter().eq(back.iter()));
    }
}
