// SPDX-FileCopyrightText: 2025 rnvgpu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU virtual-memory manager.
//!
//! Builds and maintains the two-level GMMU page table mapping GPU virtual
//! addresses onto device-physical memory, allocates virtual-address ranges,
//! and binds client buffers into an address space. Translation changes are
//! ordered against device-cache flushes and a deferred TLB-invalidate
//! protocol before the GPU may observe them.

pub mod address_space;
pub mod backing;
pub mod buffer;
pub mod comptag;
pub mod config;
pub mod error;
pub mod gmmu;
pub mod kind;
pub mod page_size;
pub mod page_table;
pub mod pin;
pub mod regs;
pub mod sim;
pub mod tlb;
pub mod va_allocator;

pub use address_space::{AddressSpace, Translation, VaRegion};
pub use buffer::MapFlags;
pub use comptag::{ComptagAllocator, RangeComptagAllocator};
pub use config::VmConfig;
pub use error::{VmError, VmResult};
pub use gmmu::Aperture;
pub use page_size::PageSize;
pub use pin::{BufferHandle, PinService, PinnedBuffer, ScatterSegment};
pub use regs::RegisterIo;
