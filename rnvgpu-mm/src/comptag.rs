// SPDX-FileCopyrightText: 2025 rnvgpu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Compression-tag allocation boundary.
//!
//! Compression tags index a hardware side table; the mapping path only
//! needs to reserve a run of tag lines per compressible mapping and give
//! it back on unmap. The allocator is shared between address spaces and
//! carries its own lock.

use parking_lot::Mutex;

use crate::va_allocator::VaAllocator;

/// Tag line 0 is reserved; a zero ctag field in a leaf entry means
/// "uncompressed".
pub const COMPTAG_NONE: u32 = 0;

/// A reserved run of compression-tag lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtagRange {
    /// First tag line of the run.
    pub offset: u32,
    /// Run length in lines.
    pub lines: u32,
}

/// Allocator interface for compression-tag lines.
pub trait ComptagAllocator: Send + Sync {
    /// Reserve `lines` contiguous tag lines. `None` when the pool is dry;
    /// callers fall back to the uncompressed kind.
    fn alloc(&self, lines: u32) -> Option<u32>;

    /// Return a run previously handed out by `alloc`.
    fn free(&self, offset: u32, lines: u32);
}

/// Range allocator over a fixed pool of tag lines.
pub struct RangeComptagAllocator {
    inner: Mutex<VaAllocator>,
}

impl RangeComptagAllocator {
    /// Pool of `num_lines` tag lines; line 0 stays reserved.
    pub fn new(num_lines: u32) -> Self {
        Self {
            // Unit "page size" turns the VA range allocator into a plain
            // line allocator.
            inner: Mutex::new(VaAllocator::new(1, num_lines as u64, 1)),
        }
    }
}

impl ComptagAllocator for RangeComptagAllocator {
    fn alloc(&self, lines: u32) -> Option<u32> {
        self.inner.lock().alloc(lines as u64).map(|line| line as u32)
    }

    fn free(&self, offset: u32, lines: u32) {
        self.inner.lock().free(offset as u64, lines as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_zero_reserved() {
        let tags = RangeComptagAllocator::new(8);
        let first = tags.alloc(1).unwrap();
        assert_ne!(first, COMPTAG_NONE);
        assert_eq!(first, 1);
    }

    #[test]
    fn test_alloc_free_cycle() {
        let tags = RangeComptagAllocator::new(16);
        let a = tags.alloc(4).unwrap();
        let b = tags.alloc(4).unwrap();
        assert_ne!(a, b);
        tags.free(a, 4);
        assert_eq!(tags.alloc(4).unwrap(), a);
    }

    #[test]
    fn test_exhaustion() {
        let tags = RangeComptagAllocator::new(8);
        // 7 usable lines (line 0 reserved).
        assert!(tags.alloc(8).is_none());
        let run = tags.alloc(7).unwrap();
        assert!(tags.alloc(1).is_none());
        tags.free(run, 7);
        assert!(tags.alloc(1).is_some());
    }
}
