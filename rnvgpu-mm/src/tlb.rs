// SPDX-FileCopyrightText: 2025 rnvgpu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! TLB invalidation and device-cache flush sequences.
//!
//! Every sequence is a bounded synchronous poll: the retry budget caps the
//! worst-case stall, and exhaustion surfaces as a [`VmError::PollTimeout`]
//! for the caller to log. Callers treat the timeout as a warning and keep
//! going: the hardware is assumed to settle eventually, and retrying at
//! this granularity could wedge the device.

use rnvgpu_common::PAddr;

use crate::error::VmResult;
use crate::gmmu::Aperture;
use crate::regs::{
    poll_until, pri_fifo_space, RegisterIo, FLUSH_FB_FLUSH, FLUSH_L2_FLUSH_DIRTY, FLUSH_OUTSTANDING,
    FLUSH_PENDING, MMU_CTRL, MMU_CTRL_PRI_FIFO_EMPTY, MMU_INVALIDATE, MMU_INVALIDATE_ALL_VA,
    MMU_INVALIDATE_PDB, MMU_INVALIDATE_TRIGGER,
};

/// PDB register value: directory base >> 12 in the address field plus the
/// aperture of the memory holding the tables.
#[inline]
pub fn pdb_entry(pdb_phys: PAddr, aperture: Aperture) -> u32 {
    ((((pdb_phys >> 12) & 0x0FFF_FFFF) as u32) << 4) | aperture.bits()
}

/// Invalidate every cached translation for the given page directory.
///
/// Sequence: wait for invalidate-FIFO space, program the PDB, trigger an
/// all-VA invalidate, then wait for the FIFO to drain.
pub fn tlb_invalidate(
    regs: &dyn RegisterIo,
    pdb_phys: PAddr,
    aperture: Aperture,
    retries: u32,
) -> VmResult<()> {
    poll_until(regs, MMU_CTRL, retries, |v| pri_fifo_space(v) > 0)?;

    regs.write32(MMU_INVALIDATE_PDB, pdb_entry(pdb_phys, aperture));
    regs.write32(
        MMU_INVALIDATE,
        MMU_INVALIDATE_ALL_VA | MMU_INVALIDATE_TRIGGER,
    );

    poll_until(regs, MMU_CTRL, retries, |v| v & MMU_CTRL_PRI_FIFO_EMPTY != 0)
}

/// Flush the framebuffer interface so outstanding writes reach memory.
pub fn fb_flush(regs: &dyn RegisterIo, retries: u32) -> VmResult<()> {
    regs.write32(FLUSH_FB_FLUSH, FLUSH_PENDING);
    poll_until(regs, FLUSH_FB_FLUSH, retries, |v| {
        v & (FLUSH_PENDING | FLUSH_OUTSTANDING) == 0
    })
}

/// Write back dirty L2 lines so no stale data can surface under a future
/// mapping of the same physical pages.
pub fn l2_flush_dirty(regs: &dyn RegisterIo, retries: u32) -> VmResult<()> {
    regs.write32(FLUSH_L2_FLUSH_DIRTY, FLUSH_PENDING);
    poll_until(regs, FLUSH_L2_FLUSH_DIRTY, retries, |v| {
        v & (FLUSH_PENDING | FLUSH_OUTSTANDING) == 0
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VmError;
    use crate::sim::SimRegisters;

    #[test]
    fn test_invalidate_programs_pdb() {
        let regs = SimRegisters::new();
        tlb_invalidate(&regs, 0x1234_5000, Aperture::VideoMemory, 16).unwrap();

        assert_eq!(regs.last_write(MMU_INVALIDATE_PDB), Some(0x0012_3451));
        assert_eq!(regs.invalidate_count(), 1);
    }

    #[test]
    fn test_invalidate_busy_times_out() {
        let regs = SimRegisters::new();
        regs.set_busy(true);
        let result = tlb_invalidate(&regs, 0x1000, Aperture::VideoMemory, 4);
        assert!(matches!(result, Err(VmError::PollTimeout { .. })));
        // Nothing was triggered while the FIFO never opened.
        assert_eq!(regs.invalidate_count(), 0);
    }

    #[test]
    fn test_fb_flush() {
        let regs = SimRegisters::new();
        fb_flush(&regs, 16).unwrap();
        assert_eq!(regs.fb_flush_count(), 1);
    }

    #[test]
    fn test_l2_flush_busy() {
        let regs = SimRegisters::new();
        regs.set_busy(true);
        assert!(matches!(
            l2_flush_dirty(&regs, 4),
            Err(VmError::PollTimeout { .. })
        ));
    }
}
