// SPDX-FileCopyrightText: 2025 rnvgpu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Software stand-ins for the hardware and driver services consumed at the
//! crate boundary. They model just enough behavior for tests and for
//! consumers running without a device: registers whose flush handshakes
//! complete immediately (or never, when forced busy) and a pin service
//! backed by a handle table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::{VmError, VmResult};
use crate::pin::{BufferHandle, PinService, PinnedBuffer};
use crate::regs::{
    RegisterIo, FLUSH_FB_FLUSH, FLUSH_L2_FLUSH_DIRTY, FLUSH_PENDING, MMU_CTRL,
    MMU_CTRL_PRI_FIFO_EMPTY, MMU_INVALIDATE, MMU_INVALIDATE_TRIGGER,
};

// ---------------------------------------------------------------------------
// SimRegisters
// ---------------------------------------------------------------------------

/// Register file whose MMU and flush handshakes retire instantly.
///
/// With `set_busy(true)` every poll target reads as permanently busy, which
/// drives the bounded-retry timeout paths.
#[derive(Default)]
pub struct SimRegisters {
    written: Mutex<HashMap<u32, u32>>,
    busy: AtomicBool,
    invalidates: AtomicU32,
    fb_flushes: AtomicU32,
    l2_flushes: AtomicU32,
}

impl SimRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force every poll target to read busy (or release it again).
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    /// Number of TLB invalidates triggered so far.
    pub fn invalidate_count(&self) -> u32 {
        self.invalidates.load(Ordering::Acquire)
    }

    /// Number of framebuffer flushes triggered so far.
    pub fn fb_flush_count(&self) -> u32 {
        self.fb_flushes.load(Ordering::Acquire)
    }

    /// Number of L2 dirty flushes triggered so far.
    pub fn l2_flush_count(&self) -> u32 {
        self.l2_flushes.load(Ordering::Acquire)
    }

    /// Last value written to a register, if any.
    pub fn last_write(&self, addr: u32) -> Option<u32> {
        self.written.lock().get(&addr).copied()
    }
}

impl RegisterIo for SimRegisters {
    fn read32(&self, addr: u32) -> u32 {
        let busy = self.busy.load(Ordering::Acquire);
        match addr {
            MMU_CTRL => {
                if busy {
                    0 // no FIFO space, never drains
                } else {
                    MMU_CTRL_PRI_FIFO_EMPTY | (0x10 << 16)
                }
            }
            FLUSH_FB_FLUSH | FLUSH_L2_FLUSH_DIRTY => {
                if busy {
                    FLUSH_PENDING
                } else {
                    0
                }
            }
            _ => self.written.lock().get(&addr).copied().unwrap_or(0),
        }
    }

    fn write32(&self, addr: u32, value: u32) {
        self.written.lock().insert(addr, value);
        match addr {
            MMU_INVALIDATE if value & MMU_INVALIDATE_TRIGGER != 0 => {
                self.invalidates.fetch_add(1, Ordering::AcqRel);
            }
            FLUSH_FB_FLUSH if value & FLUSH_PENDING != 0 => {
                self.fb_flushes.fetch_add(1, Ordering::AcqRel);
            }
            FLUSH_L2_FLUSH_DIRTY if value & FLUSH_PENDING != 0 => {
                self.l2_flushes.fetch_add(1, Ordering::AcqRel);
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// SimPinService
// ---------------------------------------------------------------------------

/// Pin service backed by a table of pre-registered buffers.
pub struct SimPinService {
    buffers: Mutex<HashMap<u32, PinnedBuffer>>,
    pins: Mutex<HashMap<u32, u32>>,
}

impl SimPinService {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            pins: Mutex::new(HashMap::new()),
        }
    }

    /// Register a buffer so later `pin` calls can resolve it.
    pub fn register(&self, handle: BufferHandle, pinned: PinnedBuffer) {
        self.buffers.lock().insert(handle.0, pinned);
    }

    /// Current pin count for a handle.
    pub fn pin_count(&self, handle: BufferHandle) -> u32 {
        self.pins.lock().get(&handle.0).copied().unwrap_or(0)
    }
}

impl Default for SimPinService {
    fn default() -> Self {
        Self::new()
    }
}

impl PinService for SimPinService {
    fn pin(&self, buffer: BufferHandle) -> VmResult<PinnedBuffer> {
        let pinned = self
            .buffers
            .lock()
            .get(&buffer.0)
            .cloned()
            .ok_or(VmError::PinFailed(buffer.0))?;
        *self.pins.lock().entry(buffer.0).or_insert(0) += 1;
        Ok(pinned)
    }

    fn unpin(&self, buffer: BufferHandle) {
        let mut pins = self.pins.lock();
        match pins.get_mut(&buffer.0) {
            Some(count) if *count > 0 => *count -= 1,
            _ => log::warn!("sim: unbalanced unpin for buffer {}", buffer.0),
        }
    }
}
