// SPDX-FileCopyrightText: 2025 rnvgpu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Register-access boundary and the MMU/flush register block.
//!
//! Only the registers the flush and invalidate sequences touch are
//! described. Offsets and fields follow the Tegra-class layout: a flush
//! block around 0x70000 and the MMU control block around 0x100C80.

use crate::error::{VmError, VmResult};

/// Raw 32-bit register access.
///
/// Implementations synchronize internally.
pub trait RegisterIo: Send + Sync {
    fn read32(&self, addr: u32) -> u32;
    fn write32(&self, addr: u32, value: u32);
}

// ---------------------------------------------------------------------------
// Register offsets
// ---------------------------------------------------------------------------

/// Framebuffer-interface flush trigger/status.
pub const FLUSH_FB_FLUSH: u32 = 0x0007_0000;
/// L2 dirty-line flush trigger/status.
pub const FLUSH_L2_FLUSH_DIRTY: u32 = 0x0007_0010;
/// MMU control/status (invalidate FIFO state).
pub const MMU_CTRL: u32 = 0x0010_0C80;
/// Page-directory base for the next invalidate.
pub const MMU_INVALIDATE_PDB: u32 = 0x0010_0CB8;
/// Invalidate trigger.
pub const MMU_INVALIDATE: u32 = 0x0010_0CBC;

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

/// Flush requested and not yet retired.
pub const FLUSH_PENDING: u32 = 1 << 0;
/// Flush data still outstanding in the fabric.
pub const FLUSH_OUTSTANDING: u32 = 1 << 1;

/// The invalidate FIFO has drained.
pub const MMU_CTRL_PRI_FIFO_EMPTY: u32 = 1 << 15;

/// Free invalidate-FIFO slots, bits [23:16] of [`MMU_CTRL`].
#[inline]
pub fn pri_fifo_space(ctrl: u32) -> u32 {
    (ctrl >> 16) & 0xFF
}

/// Invalidate every VA cached for the PDB.
pub const MMU_INVALIDATE_ALL_VA: u32 = 1 << 0;
/// Kick the invalidate.
pub const MMU_INVALIDATE_TRIGGER: u32 = 1 << 31;

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

/// Spin on `addr` until `done` accepts the value, bounded by `retries`.
///
/// The retry budget bounds the worst-case stall; exhaustion is reported to
/// the caller, which decides whether it is fatal.
pub fn poll_until(
    regs: &dyn RegisterIo,
    addr: u32,
    retries: u32,
    mut done: impl FnMut(u32) -> bool,
) -> VmResult<()> {
    for _ in 0..retries {
        if done(regs.read32(addr)) {
            return Ok(());
        }
        std::hint::spin_loop();
    }
    Err(VmError::PollTimeout { addr, retries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRegisters;

    #[test]
    fn test_poll_completes() {
        let regs = SimRegisters::new();
        assert!(poll_until(&regs, MMU_CTRL, 10, |v| pri_fifo_space(v) > 0).is_ok());
    }

    #[test]
    fn test_poll_timeout() {
        let regs = SimRegisters::new();
        regs.set_busy(true);
        let err = poll_until(&regs, MMU_CTRL, 3, |v| pri_fifo_space(v) > 0);
        assert!(matches!(
            err,
            Err(VmError::PollTimeout { addr: MMU_CTRL, retries: 3 })
        ));
    }

    #[test]
    fn test_fifo_space_field() {
        assert_eq!(pri_fifo_space(0x00FF_0000), 0xFF);
        assert_eq!(pri_fifo_space(0x0001_8000), 1);
        assert_eq!(pri_fifo_space(0x0000_8000), 0);
    }
}
