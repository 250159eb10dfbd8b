// SPDX-FileCopyrightText: 2025 rnvgpu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Two-level page-table structure.
//!
//! One directory per address space, one slot per 128 MiB stride. Each slot
//! owns up to two lazily created leaf tables (small-page and big-page); the
//! slot's hardware words are recomputed from that pair's occupancy whenever
//! it changes. A leaf is freed as soon as its live-entry counter drops to
//! zero, retracting the matching validity aperture.

use rnvgpu_common::{PAddr, SMALL_PAGE_SIZE, VAddr};

use crate::backing::{BackingAllocator, BackingBlock};
use crate::error::VmResult;
use crate::gmmu::{self, Aperture};
use crate::page_size::{PageSize, PDE_SHIFT};

/// Bytes per directory or leaf entry (two 32-bit words).
pub const ENTRY_BYTES: usize = 8;

/// One leaf table: a backing block plus the count of valid entries in it.
#[derive(Debug)]
pub struct LeafTable {
    pub block: BackingBlock,
    pub live_entries: u32,
}

/// Per-stride directory state: at most one leaf table per page size.
#[derive(Debug, Default)]
struct DirectorySlot {
    tables: [Option<LeafTable>; 2],
}

impl DirectorySlot {
    fn leaf_phys(&self, page_size: PageSize) -> Option<PAddr> {
        self.tables[page_size.index()].as_ref().map(|t| t.block.phys)
    }
}

/// The top-level page directory of one address space.
pub struct PageDirectory {
    block: BackingBlock,
    slots: Vec<DirectorySlot>,
    aperture: Aperture,
}

impl PageDirectory {
    /// Allocate the directory covering `[0, va_limit)`. The directory block
    /// itself comes zeroed, so every slot starts out invalid.
    pub fn new(
        backing: &mut BackingAllocator,
        va_limit: VAddr,
        aperture: Aperture,
    ) -> VmResult<Self> {
        let num_slots = (va_limit >> PDE_SHIFT) as usize;
        let bytes = (num_slots * ENTRY_BYTES) as u64;

        let mut order = 0;
        while (SMALL_PAGE_SIZE << order) < bytes {
            order += 1;
        }
        let block = backing.alloc(order)?;

        let mut slots = Vec::with_capacity(num_slots);
        slots.resize_with(num_slots, DirectorySlot::default);

        Ok(Self {
            block,
            slots,
            aperture,
        })
    }

    /// Physical address of the directory, programmed as the PDB.
    pub fn pdb_phys(&self) -> PAddr {
        self.block.phys
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Directory slot covering a virtual address.
    #[inline]
    pub fn slot_index(va: VAddr) -> usize {
        (va >> PDE_SHIFT) as usize
    }

    /// Backing block of the leaf for `slot`/`page_size`, if it exists.
    pub fn leaf_block(&self, slot: usize, page_size: PageSize) -> Option<BackingBlock> {
        self.slots[slot].tables[page_size.index()]
            .as_ref()
            .map(|t| t.block)
    }

    /// Live-entry count of the leaf for `slot`/`page_size` (0 if absent).
    pub fn leaf_live(&self, slot: usize, page_size: PageSize) -> u32 {
        self.slots[slot].tables[page_size.index()]
            .as_ref()
            .map_or(0, |t| t.live_entries)
    }

    /// Create the leaf table for `slot`/`page_size` if it does not exist
    /// and rewrite the slot's directory words. Idempotent.
    pub fn ensure_leaf(
        &mut self,
        backing: &mut BackingAllocator,
        slot: usize,
        page_size: PageSize,
    ) -> VmResult<()> {
        if self.slots[slot].tables[page_size.index()].is_some() {
            return Ok(());
        }

        let block = backing.alloc(page_size.info().leaf_order)?;
        self.slots[slot].tables[page_size.index()] = Some(LeafTable {
            block,
            live_entries: 0,
        });
        self.rewrite_slot(backing, slot);
        log::trace!(
            "gmmu: new {:?} leaf for slot {} at phys {:#X}",
            page_size,
            slot,
            block.phys
        );
        Ok(())
    }

    /// Bump the live-entry counter of an existing leaf.
    pub fn add_live(&mut self, slot: usize, page_size: PageSize, count: u32) {
        if let Some(table) = self.slots[slot].tables[page_size.index()].as_mut() {
            table.live_entries += count;
        }
    }

    /// Drop `count` from a leaf's live-entry counter, returning the new
    /// value (0 if the leaf is absent).
    pub fn sub_live(&mut self, slot: usize, page_size: PageSize, count: u32) -> u32 {
        match self.slots[slot].tables[page_size.index()].as_mut() {
            Some(table) => {
                debug_assert!(table.live_entries >= count);
                table.live_entries = table.live_entries.saturating_sub(count);
                table.live_entries
            }
            None => 0,
        }
    }

    /// Free the leaf for `slot`/`page_size` if it holds no valid entries,
    /// rewriting the slot words to retract its aperture.
    pub fn release_leaf_if_empty(
        &mut self,
        backing: &mut BackingAllocator,
        slot: usize,
        page_size: PageSize,
    ) {
        let empty = matches!(
            &self.slots[slot].tables[page_size.index()],
            Some(table) if table.live_entries == 0
        );
        if !empty {
            return;
        }

        if let Some(table) = self.slots[slot].tables[page_size.index()].take() {
            backing.free(table.block);
        }
        self.rewrite_slot(backing, slot);
        log::trace!("gmmu: released {:?} leaf for slot {}", page_size, slot);
    }

    /// Free every leaf and the directory block itself. Used at
    /// address-space teardown.
    pub fn release_all(&mut self, backing: &mut BackingAllocator) {
        for slot in &mut self.slots {
            for table in &mut slot.tables {
                if let Some(table) = table.take() {
                    backing.free(table.block);
                }
            }
        }
        backing.free(self.block);
    }

    /// Recompute and write a slot's two directory words from its current
    /// leaf occupancy.
    fn rewrite_slot(&self, backing: &mut BackingAllocator, slot: usize) {
        let [w0, w1] = gmmu::pde_words(
            self.slots[slot].leaf_phys(PageSize::Big),
            self.slots[slot].leaf_phys(PageSize::Small),
            self.aperture,
        );
        backing.write_word(&self.block, slot * 2, w0);
        backing.write_word(&self.block, slot * 2 + 1, w1);
    }
}
