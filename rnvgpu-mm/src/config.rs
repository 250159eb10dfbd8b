// SPDX-FileCopyrightText: 2025 rnvgpu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use rnvgpu_common::{PAddr, VAddr};

use crate::gmmu::Aperture;

/// Address-space configuration.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// One past the highest virtual address, a multiple of the directory
    /// stride.
    pub va_limit: VAddr,
    /// Whether the big leaf page size is available to mappings.
    pub big_pages: bool,
    /// Memory domain holding buffers and page tables.
    pub aperture: Aperture,
    /// Capacity of the page-table backing arena in bytes.
    pub backing_capacity: usize,
    /// Device-physical address the arena is presented at.
    pub arena_base: PAddr,
    /// Retry budget for hardware flush/invalidate polling.
    pub flush_retries: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            // 128 GiB of GPU VA.
            va_limit: 1 << 37,
            big_pages: true,
            aperture: Aperture::VideoMemory,
            backing_capacity: 8 * 1024 * 1024,
            arena_base: 0x1000_0000,
            flush_retries: 1000,
        }
    }
}
