// SPDX-FileCopyrightText: 2025 rnvgpu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU address-space front end.
//!
//! One `AddressSpace` owns the directory, the per-page-size VA windows,
//! the buffer registry, and the deferred-unmap cache, all behind a single
//! mutex: every structural operation holds it for its full duration, so no
//! thread ever observes a half-written table. External services (pin,
//! compression tags, registers) are called from inside the locked region;
//! they synchronize internally.
//!
//! TLB invalidation is deferred: structural changes set a dirty flag, and
//! [`AddressSpace::tlb_invalidate`] performs the hardware sequence before
//! dependent GPU work is allowed to run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use rnvgpu_common::{align_down, align_up, is_aligned, PAddr, VAddr};

use crate::backing::BackingAllocator;
use crate::buffer::{BufferMapRegistry, BufferState, DeferredUnmapCache, MapFlags, MappedBuffer};
use crate::comptag::{ComptagAllocator, CtagRange, COMPTAG_NONE};
use crate::config::VmConfig;
use crate::error::{VmError, VmResult};
use crate::gmmu::{self, EntryAttrs, COMPTAG_GRANULARITY};
use crate::kind;
use crate::page_size::{select_page_size, PageSize, PDE_STRIDE};
use crate::page_table::PageDirectory;
use crate::pin::{BufferHandle, PinService, PinnedBuffer};
use crate::regs::RegisterIo;
use crate::tlb;
use crate::va_allocator::VaAllocator;

/// One per-page-size VA window, as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaRegion {
    pub page_size: u64,
    pub base: VAddr,
    pub limit: VAddr,
}

/// Decoded leaf-entry state for a virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub phys: PAddr,
    pub page_size: PageSize,
    pub kind: u8,
    pub ctag_line: u32,
    pub volatile: bool,
}

struct VmInner {
    backing: BackingAllocator,
    dir: PageDirectory,
    /// VA allocators indexed by `PageSize`.
    va: [VaAllocator; 2],
    registry: BufferMapRegistry,
    deferred: DeferredUnmapCache,
}

/// A GPU virtual address space.
pub struct AddressSpace {
    cfg: VmConfig,
    regs: Arc<dyn RegisterIo>,
    pin: Arc<dyn PinService>,
    comptags: Arc<dyn ComptagAllocator>,
    inner: Mutex<VmInner>,
    tlb_dirty: AtomicBool,
}

impl AddressSpace {
    /// Create an address space covering `[0, cfg.va_limit)`.
    pub fn new(
        cfg: VmConfig,
        regs: Arc<dyn RegisterIo>,
        pin: Arc<dyn PinService>,
        comptags: Arc<dyn ComptagAllocator>,
    ) -> VmResult<Self> {
        if cfg.va_limit < 2 * PDE_STRIDE || !is_aligned(cfg.va_limit, PDE_STRIDE) {
            return Err(VmError::BadVaLimit(cfg.va_limit));
        }

        let mut backing = BackingAllocator::new(cfg.backing_capacity, cfg.arena_base)?;
        let dir = PageDirectory::new(&mut backing, cfg.va_limit, cfg.aperture)?;

        // One directory stride at the bottom stays permanently unallocated
        // so VA 0 can never name a valid mapping. Small pages own the lower
        // window and big pages the upper, which rules out cross-page-size
        // overlap by construction.
        let split = if cfg.big_pages {
            align_down(cfg.va_limit / 2, PDE_STRIDE).max(PDE_STRIDE)
        } else {
            cfg.va_limit
        };
        let va = [
            VaAllocator::new(PDE_STRIDE, split, PageSize::Small.info().size),
            VaAllocator::new(split, cfg.va_limit.max(split), PageSize::Big.info().size),
        ];

        log::debug!(
            "vm: address space va_limit={:#X} split={:#X} big_pages={}",
            cfg.va_limit,
            split,
            cfg.big_pages
        );

        Ok(Self {
            cfg,
            regs,
            pin,
            comptags,
            inner: Mutex::new(VmInner {
                backing,
                dir,
                va,
                registry: BufferMapRegistry::new(),
                deferred: DeferredUnmapCache::new(),
            }),
            tlb_dirty: AtomicBool::new(false),
        })
    }

    // -- Buffer mapping -----------------------------------------------------

    /// Bind a client buffer into the address space and return its virtual
    /// address.
    ///
    /// A retained mapping of the same buffer with the same flags and kind
    /// is revived instead of building a new translation. On any failure
    /// every side effect already taken is undone before the error returns.
    pub fn map_buffer(
        &self,
        buffer: BufferHandle,
        fixed_offset: Option<VAddr>,
        flags: MapFlags,
        kind: u8,
    ) -> VmResult<VAddr> {
        let mut inner = self.inner.lock();
        let pinned = self.pin.pin(buffer)?;

        let hit = inner
            .deferred
            .find(&inner.registry, pinned.phys_base(), flags, kind, fixed_offset);
        if let Some(va) = hit {
            inner.deferred.remove(va);
            if let Some(mapping) = inner.registry.get_mut(va) {
                mapping.state = BufferState::Live;
            }
            // The retained mapping already owns a pin reference.
            self.pin.unpin(buffer);
            log::debug!("vm: revived retained mapping at {:#X} for buffer {}", va, buffer.0);
            return Ok(va);
        }

        match self.map_new(&mut inner, buffer, &pinned, fixed_offset, flags, kind) {
            Ok(va) => Ok(va),
            Err(err) => {
                self.pin.unpin(buffer);
                Err(err)
            }
        }
    }

    /// Tear a mapping down immediately: clear its leaf entries, flush the
    /// device caches, and return its VA, tags, and pin.
    pub fn unmap_buffer(&self, va: VAddr) -> VmResult<()> {
        let mut inner = self.inner.lock();
        self.teardown(&mut inner, va)
    }

    /// Two-phase user unmap: the mapping loses its live user but keeps its
    /// translation, pin, and tags for possible revival. It is torn down for
    /// real when evicted under allocation pressure or when the address
    /// space goes away.
    pub fn release_buffer(&self, va: VAddr) -> VmResult<()> {
        let mut inner = self.inner.lock();
        let VmInner {
            registry, deferred, ..
        } = &mut *inner;
        let mapping = registry.get_mut(va).ok_or(VmError::NotMapped(va))?;
        if mapping.state == BufferState::Live {
            mapping.state = BufferState::Retained;
            deferred.push(va);
            log::debug!("vm: retained mapping at {:#X} for possible reuse", va);
        }
        Ok(())
    }

    /// Reverse lookup: the buffer mapped at (or spanning) `va` and the
    /// byte offset of `va` inside it.
    pub fn find_buffer(&self, va: VAddr) -> VmResult<(BufferHandle, u64)> {
        let inner = self.inner.lock();
        let mapping = inner
            .registry
            .find_containing(va)
            .ok_or(VmError::NotMapped(va))?;
        Ok((mapping.buffer, va - mapping.va))
    }

    // -- Space reservation --------------------------------------------------

    /// Reserve a run of `num_pages` pages of the given size without
    /// binding a buffer.
    pub fn reserve_va(
        &self,
        page_size: PageSize,
        num_pages: u64,
        fixed_offset: Option<VAddr>,
    ) -> VmResult<VAddr> {
        if num_pages == 0 {
            return Err(VmError::ZeroSize);
        }
        let mut inner = self.inner.lock();
        self.alloc_va(&mut inner, page_size, num_pages, fixed_offset)
    }

    /// Return a reservation made with [`AddressSpace::reserve_va`].
    pub fn release_va(&self, page_size: PageSize, offset: VAddr, num_pages: u64) {
        let mut inner = self.inner.lock();
        inner.va[page_size.index()].free(offset, num_pages);
    }

    /// The two per-page-size VA windows.
    pub fn va_regions(&self) -> [VaRegion; 2] {
        let inner = self.inner.lock();
        PageSize::ALL.map(|ps| {
            let (base, limit) = inner.va[ps.index()].window();
            VaRegion {
                page_size: ps.info().size,
                base,
                limit,
            }
        })
    }

    // -- Hardware synchronization -------------------------------------------

    /// Perform the deferred TLB invalidation if any structural change is
    /// pending. Poll exhaustion is logged and tolerated; the hardware is
    /// assumed to settle eventually.
    pub fn tlb_invalidate(&self) {
        if !self.tlb_dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.lock();
        if let Err(err) = tlb::tlb_invalidate(
            self.regs.as_ref(),
            inner.dir.pdb_phys(),
            self.cfg.aperture,
            self.cfg.flush_retries,
        ) {
            log::warn!("vm: TLB invalidate timed out: {}", err);
        }
    }

    // -- Queries ------------------------------------------------------------

    /// Decode the live leaf entry covering `va`, if one exists.
    ///
    /// Reads the actual table words, so it reflects exactly what the
    /// hardware walker would see.
    pub fn translate(&self, va: VAddr) -> Option<Translation> {
        let inner = self.inner.lock();
        if va >= self.cfg.va_limit {
            return None;
        }
        let slot = PageDirectory::slot_index(va);
        for page_size in [PageSize::Big, PageSize::Small] {
            let block = match inner.dir.leaf_block(slot, page_size) {
                Some(block) => block,
                None => continue,
            };
            let info = page_size.info();
            let entry = ((va >> info.shift) as usize) & (info.entries_per_leaf - 1);
            let w0 = inner.backing.read_word(&block, entry * 2);
            if !gmmu::pte_is_valid(w0) {
                continue;
            }
            let w1 = inner.backing.read_word(&block, entry * 2 + 1);
            return Some(Translation {
                phys: gmmu::pte_phys(w0) + (va & info.mask),
                page_size,
                kind: gmmu::pte_kind(w1),
                ctag_line: gmmu::pte_ctag(w1),
                volatile: gmmu::pte_volatile(w1),
            });
        }
        None
    }

    // -- Internals ----------------------------------------------------------

    fn map_new(
        &self,
        inner: &mut VmInner,
        buffer: BufferHandle,
        pinned: &PinnedBuffer,
        fixed_offset: Option<VAddr>,
        flags: MapFlags,
        requested_kind: u8,
    ) -> VmResult<VAddr> {
        if pinned.size == 0 {
            return Err(VmError::ZeroSize);
        }

        let page_size = select_page_size(pinned.align, self.cfg.big_pages)?;
        let info = page_size.info();
        let size = align_up(pinned.size, info.size);
        let num_pages = size / info.size;

        // Resolve the compression kind: small pages cannot carry
        // compression, and a dry tag pool degrades the mapping to the
        // uncompressed kind rather than failing it.
        let attr = kind::attr(requested_kind);
        let mut effective_kind = requested_kind;
        let mut ctag: Option<CtagRange> = None;
        if attr.compressible {
            if page_size != PageSize::Big {
                effective_kind = attr.fallback;
            } else {
                let lines = ((size + COMPTAG_GRANULARITY - 1) / COMPTAG_GRANULARITY) as u32;
                match self.comptags.alloc(lines) {
                    Some(offset) => ctag = Some(CtagRange { offset, lines }),
                    None => {
                        log::info!(
                            "vm: comptag pool dry, mapping buffer {} uncompressed",
                            buffer.0
                        );
                        effective_kind = attr.fallback;
                    }
                }
            }
        }

        let va = match self.alloc_va(inner, page_size, num_pages, fixed_offset) {
            Ok(va) => va,
            Err(err) => {
                self.free_ctag(&ctag);
                return Err(err);
            }
        };

        let first_slot = PageDirectory::slot_index(va);
        let last_slot = PageDirectory::slot_index(va + size - 1);
        if let Err(err) = self.ensure_leaves(inner, page_size, first_slot, last_slot) {
            inner.va[page_size.index()].free(va, num_pages);
            self.free_ctag(&ctag);
            return Err(err);
        }

        let mapping = MappedBuffer {
            va,
            size,
            page_size,
            buffer,
            pinned: pinned.clone(),
            requested_kind,
            kind: effective_kind,
            ctag,
            flags,
            state: BufferState::Live,
        };
        if let Err(err) = inner.registry.insert(mapping) {
            self.rollback_tables(inner, page_size, first_slot, last_slot);
            inner.va[page_size.index()].free(va, num_pages);
            self.free_ctag(&ctag);
            return Err(err);
        }

        let attrs = EntryAttrs {
            aperture: self.cfg.aperture,
            kind: effective_kind,
            ctag_base: ctag.map_or(COMPTAG_NONE, |c| c.offset),
            cacheable: flags.contains(MapFlags::CACHEABLE),
        };
        let written = {
            let VmInner { dir, backing, .. } = inner;
            gmmu::write_mapping(dir, backing, va, size, page_size, &pinned.segments, &attrs)
        };
        if let Err(err) = written {
            inner.registry.remove(va);
            {
                let VmInner { dir, backing, .. } = inner;
                gmmu::clear_mapping(dir, backing, va, size, page_size);
            }
            self.rollback_tables(inner, page_size, first_slot, last_slot);
            inner.va[page_size.index()].free(va, num_pages);
            self.free_ctag(&ctag);
            return Err(err);
        }

        self.tlb_dirty.store(true, Ordering::Release);
        log::debug!(
            "vm: map buffer {} [{:#X}..{:#X}) {:?} kind={:#04X}",
            buffer.0,
            va,
            va + size,
            page_size,
            effective_kind
        );
        Ok(va)
    }

    /// Allocate a virtual range, evicting retained mappings once when the
    /// first attempt comes up empty.
    fn alloc_va(
        &self,
        inner: &mut VmInner,
        page_size: PageSize,
        num_pages: u64,
        fixed_offset: Option<VAddr>,
    ) -> VmResult<VAddr> {
        let info = page_size.info();
        match fixed_offset {
            Some(offset) => {
                if !is_aligned(offset, info.size) {
                    return Err(VmError::MisalignedOffset(offset, info.size));
                }
                let bytes = num_pages
                    .checked_mul(info.size)
                    .ok_or(VmError::OutOfRange(offset, VAddr::MAX))?;
                let end = offset
                    .checked_add(bytes)
                    .ok_or(VmError::OutOfRange(offset, VAddr::MAX))?;
                let (base, limit) = inner.va[page_size.index()].window();
                if offset < base || end > limit {
                    return Err(VmError::OutOfRange(offset, end));
                }
                if inner.va[page_size.index()].alloc_fixed(offset, num_pages) {
                    return Ok(offset);
                }
                // A retained mapping may be squatting on the range.
                if !inner.deferred.is_empty() {
                    self.evict_retained(inner);
                    if inner.va[page_size.index()].alloc_fixed(offset, num_pages) {
                        return Ok(offset);
                    }
                }
                Err(VmError::VaRangeBusy(offset))
            }
            None => {
                if let Some(va) = inner.va[page_size.index()].alloc(num_pages) {
                    return Ok(va);
                }
                if !inner.deferred.is_empty() {
                    log::debug!(
                        "vm: VA pressure, evicting {} retained mappings",
                        inner.deferred.len()
                    );
                    self.evict_retained(inner);
                    if let Some(va) = inner.va[page_size.index()].alloc(num_pages) {
                        return Ok(va);
                    }
                }
                Err(VmError::NoVaSpace {
                    num_pages,
                    page_size: info.size,
                })
            }
        }
    }

    /// Idempotently create the leaf tables for every covered slot,
    /// evicting retained mappings once if backing pages run out.
    fn ensure_leaves(
        &self,
        inner: &mut VmInner,
        page_size: PageSize,
        first_slot: usize,
        last_slot: usize,
    ) -> VmResult<()> {
        for slot in first_slot..=last_slot {
            let result = {
                let VmInner { dir, backing, .. } = inner;
                dir.ensure_leaf(backing, slot, page_size)
            };
            if let Err(err) = result {
                let mut recovered = false;
                if matches!(err, VmError::NoBackingPages(_)) && !inner.deferred.is_empty() {
                    self.evict_retained(inner);
                    let VmInner { dir, backing, .. } = inner;
                    recovered = dir.ensure_leaf(backing, slot, page_size).is_ok();
                }
                if !recovered {
                    self.rollback_tables(inner, page_size, first_slot, slot);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Drop any leaf in the slot range that ended up with no valid
    /// entries. Leaves shared with existing mappings stay.
    fn rollback_tables(
        &self,
        inner: &mut VmInner,
        page_size: PageSize,
        first_slot: usize,
        last_slot: usize,
    ) {
        let VmInner { dir, backing, .. } = inner;
        for slot in first_slot..=last_slot {
            dir.release_leaf_if_empty(backing, slot, page_size);
        }
    }

    fn free_ctag(&self, ctag: &Option<CtagRange>) {
        if let Some(ct) = ctag {
            self.comptags.free(ct.offset, ct.lines);
        }
    }

    /// Tear down every retained mapping.
    fn evict_retained(&self, inner: &mut VmInner) {
        for va in inner.deferred.drain() {
            if let Err(err) = self.teardown(inner, va) {
                log::warn!("vm: failed to evict retained mapping at {:#X}: {}", va, err);
            }
        }
    }

    /// Full unmap: clear entries, flush device caches, return VA, tags,
    /// and pin, and drop the registry record.
    fn teardown(&self, inner: &mut VmInner, va: VAddr) -> VmResult<()> {
        let mapping = inner.registry.remove(va).ok_or(VmError::NotMapped(va))?;
        inner.deferred.remove(va);

        {
            let VmInner { dir, backing, .. } = inner;
            gmmu::clear_mapping(dir, backing, mapping.va, mapping.size, mapping.page_size);
        }

        // Write dirty cache lines back before the physical pages can
        // reappear under a different mapping. Poll exhaustion is a
        // warning, not a failure.
        if let Err(err) = tlb::l2_flush_dirty(self.regs.as_ref(), self.cfg.flush_retries) {
            log::warn!("vm: L2 flush after unmap timed out: {}", err);
        }
        if let Err(err) = tlb::fb_flush(self.regs.as_ref(), self.cfg.flush_retries) {
            log::warn!("vm: FB flush after unmap timed out: {}", err);
        }

        let num_pages = mapping.size / mapping.page_size.info().size;
        inner.va[mapping.page_size.index()].free(mapping.va, num_pages);
        self.free_ctag(&mapping.ctag);
        self.pin.unpin(mapping.buffer);
        self.tlb_dirty.store(true, Ordering::Release);

        log::debug!(
            "vm: unmap [{:#X}..{:#X}) buffer {}",
            mapping.va,
            mapping.va + mapping.size,
            mapping.buffer.0
        );
        Ok(())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();

        let leftover: Vec<VAddr> = inner.registry.keys().collect();
        let live = inner
            .registry
            .iter()
            .filter(|m| m.state == BufferState::Live)
            .count();
        if live > 0 {
            log::warn!("vm: force-unmapping {} live buffers at teardown", live);
        }
        for va in leftover {
            if let Err(err) = self.teardown(&mut inner, va) {
                log::warn!("vm: teardown of {:#X} failed: {}", va, err);
            }
        }

        let VmInner { dir, backing, .. } = &mut *inner;
        dir.release_all(backing);
    }
}
