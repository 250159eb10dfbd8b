// SPDX-FileCopyrightText: 2025 rnvgpu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

use rnvgpu_common::VAddr;

/// Errors returned by the GPU virtual-memory manager.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("no free virtual-address range for {num_pages} pages of size 0x{page_size:X}")]
    NoVaSpace { num_pages: u64, page_size: u64 },

    #[error("backing-page arena exhausted (order {0} block)")]
    NoBackingPages(u32),

    #[error("alignment 0x{0:X} satisfies no supported page size")]
    UnsupportedAlignment(u64),

    #[error("offset 0x{0:016X} is not aligned to page size 0x{1:X}")]
    MisalignedOffset(VAddr, u64),

    #[error("size must be non-zero")]
    ZeroSize,

    #[error("range [0x{0:016X}..0x{1:016X}) exceeds the address-space limit")]
    OutOfRange(VAddr, VAddr),

    #[error("virtual address 0x{0:016X} is already mapped")]
    DuplicateMapping(VAddr),

    #[error("fixed virtual range at 0x{0:016X} is not free")]
    VaRangeBusy(VAddr),

    #[error("virtual address 0x{0:016X} is not mapped")]
    NotMapped(VAddr),

    #[error("scatter list covers 0x{covered:X} bytes, mapping needs 0x{needed:X}")]
    ScatterTooShort { covered: u64, needed: u64 },

    #[error("buffer handle {0} cannot be pinned")]
    PinFailed(u32),

    #[error("va_limit 0x{0:X} is not a multiple of the directory stride")]
    BadVaLimit(u64),

    #[error("register poll on 0x{addr:06X} exhausted {retries} retries")]
    PollTimeout { addr: u32, retries: u32 },

    #[error("failed to create backing arena: {0}")]
    ArenaFailed(#[from] std::io::Error),
}

/// Result alias for virtual-memory operations.
pub type VmResult<T> = Result<T, VmError>;
