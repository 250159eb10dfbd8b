// SPDX-FileCopyrightText: 2025 rnvgpu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Mapped-buffer registry and deferred-unmap cache.
//!
//! The registry is an address-ordered index of every mapping in one
//! address space, supporting exact lookup for unmap and containing-range
//! lookup for reverse queries. The deferred-unmap cache tracks mappings a
//! client has let go of but that are kept intact for cheap revival if the
//! same buffer is mapped again with the same attributes.

use std::collections::BTreeMap;

use bitflags::bitflags;

use rnvgpu_common::{PAddr, VAddr};

use crate::comptag::CtagRange;
use crate::error::{VmError, VmResult};
use crate::page_size::PageSize;
use crate::pin::{BufferHandle, PinnedBuffer};

bitflags! {
    /// Caller-facing mapping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// The caller supplies the virtual offset.
        const FIXED_OFFSET = 1 << 0;
        /// Map GPU-cacheable (clear means volatile leaf entries).
        const CACHEABLE = 1 << 2;
    }
}

/// Lifecycle of a mapping.
///
/// `Retained` replaces the source's refcount juggling: a retained mapping
/// has no live user but keeps its translation, pin, and tags until it is
/// revived by a matching map request, evicted under allocation pressure,
/// or torn down with the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Live,
    Retained,
}

/// One buffer bound into the address space.
#[derive(Debug)]
pub struct MappedBuffer {
    /// Assigned virtual address (registry key).
    pub va: VAddr,
    /// Mapped size in bytes, page-size aligned.
    pub size: u64,
    pub page_size: PageSize,
    pub buffer: BufferHandle,
    /// Physical backing, pinned for the mapping's lifetime.
    pub pinned: PinnedBuffer,
    /// Kind requested by the client, used for reuse matching.
    pub requested_kind: u8,
    /// Kind actually written to the leaf entries (post-fallback).
    pub kind: u8,
    /// Compression-tag run, if the mapping is compressed.
    pub ctag: Option<CtagRange>,
    pub flags: MapFlags,
    pub state: BufferState,
}

/// Address-ordered index over [`MappedBuffer`] by virtual address.
#[derive(Default)]
pub struct BufferMapRegistry {
    map: BTreeMap<VAddr, MappedBuffer>,
}

impl BufferMapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a mapping. Duplicate virtual addresses are never permitted
    /// within one address space.
    pub fn insert(&mut self, mapping: MappedBuffer) -> VmResult<()> {
        let va = mapping.va;
        if self.map.contains_key(&va) {
            return Err(VmError::DuplicateMapping(va));
        }
        self.map.insert(va, mapping);
        Ok(())
    }

    pub fn remove(&mut self, va: VAddr) -> Option<MappedBuffer> {
        self.map.remove(&va)
    }

    pub fn get(&self, va: VAddr) -> Option<&MappedBuffer> {
        self.map.get(&va)
    }

    pub fn get_mut(&mut self, va: VAddr) -> Option<&mut MappedBuffer> {
        self.map.get_mut(&va)
    }

    /// The mapping whose range contains `va`, if any.
    pub fn find_containing(&self, va: VAddr) -> Option<&MappedBuffer> {
        let (_, mapping) = self.map.range(..=va).next_back()?;
        if va < mapping.va + mapping.size {
            Some(mapping)
        } else {
            None
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = VAddr> + '_ {
        self.map.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MappedBuffer> {
        self.map.values()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Unordered list of retained mappings awaiting revival or eviction.
#[derive(Default)]
pub struct DeferredUnmapCache {
    entries: Vec<VAddr>,
}

impl DeferredUnmapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, va: VAddr) {
        debug_assert!(!self.entries.contains(&va));
        self.entries.push(va);
    }

    /// Drop `va` from the cache if present.
    pub fn remove(&mut self, va: VAddr) {
        self.entries.retain(|&entry| entry != va);
    }

    /// Find a retained mapping matching a new map request: same physical
    /// base, same flags, same requested kind, and the same virtual address
    /// when the request is for a fixed offset.
    pub fn find(
        &self,
        registry: &BufferMapRegistry,
        phys_base: PAddr,
        flags: MapFlags,
        kind: u8,
        fixed_va: Option<VAddr>,
    ) -> Option<VAddr> {
        self.entries.iter().copied().find(|&va| {
            registry.get(va).is_some_and(|m| {
                m.pinned.phys_base() == phys_base
                    && m.flags == flags
                    && m.requested_kind == kind
                    && fixed_va.map_or(true, |fixed| fixed == va)
            })
        })
    }

    /// Take every retained address, leaving the cache empty.
    pub fn drain(&mut self) -> Vec<VAddr> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
