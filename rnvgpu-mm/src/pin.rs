// SPDX-FileCopyrightText: 2025 rnvgpu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Physical-memory pinning boundary.
//!
//! Turning an opaque buffer handle into physical segments is the job of an
//! external allocation service; this module only defines the contract the
//! mapping path consumes. A pinned buffer's segments stay valid until the
//! matching unpin.

use rnvgpu_common::PAddr;

use crate::error::VmResult;

/// Opaque client buffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u32);

/// One physically contiguous piece of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterSegment {
    /// Physical base address of the segment.
    pub base: PAddr,
    /// Segment length in bytes.
    pub len: u64,
}

/// Result of pinning a buffer: its scatter list plus the attributes the
/// mapping path needs.
#[derive(Debug, Clone)]
pub struct PinnedBuffer {
    /// Physical segments, in buffer order. Each segment is aligned to and
    /// a multiple of `align`.
    pub segments: Vec<ScatterSegment>,
    /// Buffer size in bytes.
    pub size: u64,
    /// Physical alignment of the backing store, used for page-size
    /// selection.
    pub align: u64,
}

impl PinnedBuffer {
    /// Physical base of the first segment.
    pub fn phys_base(&self) -> PAddr {
        self.segments.first().map_or(0, |seg| seg.base)
    }

    /// Total bytes covered by the scatter list.
    pub fn covered(&self) -> u64 {
        self.segments.iter().map(|seg| seg.len).sum()
    }
}

/// The external pin/unpin service.
///
/// Implementations synchronize internally; calls arrive while the address
/// space holds its own lock.
pub trait PinService: Send + Sync {
    /// Pin `buffer` and describe its physical backing.
    fn pin(&self, buffer: BufferHandle) -> VmResult<PinnedBuffer>;

    /// Drop one pin reference on `buffer`.
    fn unpin(&self, buffer: BufferHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phys_base_and_covered() {
        let pinned = PinnedBuffer {
            segments: vec![
                ScatterSegment { base: 0x4000, len: 0x2000 },
                ScatterSegment { base: 0x9000, len: 0x1000 },
            ],
            size: 0x3000,
            align: 0x1000,
        };
        assert_eq!(pinned.phys_base(), 0x4000);
        assert_eq!(pinned.covered(), 0x3000);
    }

    #[test]
    fn test_empty_scatter_list() {
        let pinned = PinnedBuffer {
            segments: Vec::new(),
            size: 0,
            align: 0x1000,
        };
        assert_eq!(pinned.phys_base(), 0);
        assert_eq!(pinned.covered(), 0);
    }
}
