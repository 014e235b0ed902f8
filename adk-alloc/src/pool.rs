// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-size block pool. The region is pre-carved into equally sized,
//! aligned slots at init; alloc and free are O(1) pops and pushes on a
//! singly-linked free list. Slot headers carry the same `USED`/`FREE`
//! sentinels as the heap so stray frees are caught.

use crate::page::{self, PageBlock};
use crate::{align_up, AllocError, GuardPageMode, PageProtect, Region};
use core::ptr::{self, NonNull};
use std::collections::BTreeMap;

const SLOT_USED: u64 = 0xdead_b1cf_dead_b1cf;
const SLOT_FREE: u64 = 0xfc1b_dae0_fc1b_dae0;
const NIL: usize = usize::MAX;

#[repr(C)]
#[derive(Clone, Copy)]
struct SlotHeader {
    id: u64,
    tag: &'static str,
    /// Offset of the next free slot; meaningful only while free.
    next: usize,
}

struct GuardSlot {
    tag: &'static str,
    pages: Region,
}

pub struct Pool {
    alignment: usize,
    ptr_ofs: usize,
    aligned_block_size: usize,
    user_size: usize,
    num_blocks: usize,
    num_used_blocks: usize,
    num_free_blocks: usize,
    debug_checks: bool,

    // Region mode; base is null in guard mode.
    base: *mut u8,
    region_size: usize,
    free: usize,
    owned_pages: Option<PageBlock>,

    // Guard mode: one guarded page block per live slot.
    guard: Option<BTreeMap<usize, GuardSlot>>,
}

// SAFETY: single-owner; all region access goes through &mut methods.
unsafe impl Send for Pool {}

/// Bytes needed to hold `num_blocks` slots of `block_size` user bytes.
pub fn required_memory_size(
    num_blocks: usize,
    block_size: usize,
    alignment: usize,
    extra_header_bytes: usize,
) -> usize {
    aligned_slot_size(block_size, alignment, extra_header_bytes).0 * num_blocks
}

/// Slots obtainable from `memory_size` bytes.
pub fn block_count(
    memory_size: usize,
    block_size: usize,
    alignment: usize,
    extra_header_bytes: usize,
) -> usize {
    memory_size / aligned_slot_size(block_size, alignment, extra_header_bytes).0
}

fn aligned_slot_size(
    block_size: usize,
    alignment: usize,
    extra_header_bytes: usize,
) -> (usize, usize) {
    let alignment = alignment.max(core::mem::size_of::<*const u8>());
    assert!(alignment.is_power_of_two());
    let header_size = core::mem::size_of::<SlotHeader>() + extra_header_bytes;
    let ptr_ofs = align_up(header_size, alignment);
    (align_up(block_size + ptr_ofs, alignment), ptr_ofs)
}

impl Pool {
    /// Carves `region` into `region.size / aligned_block_size` slots of
    /// `block_size` user bytes each.
    pub fn new(
        region: Region,
        block_size: usize,
        alignment: usize,
        extra_header_bytes: usize,
    ) -> Self {
        assert!(alignment == 0 || alignment.is_power_of_two());
        let clamped = alignment.max(core::mem::size_of::<*const u8>());
        assert_eq!(region.addr() & (clamped - 1), 0, "misaligned pool region");

        let (slot_size, ptr_ofs) = aligned_slot_size(block_size, clamped, extra_header_bytes);
        let num_blocks = region.size() / slot_size;
        assert!(num_blocks > 0, "pool region too small for a single block");

        let mut pool = Self {
            alignment: clamped,
            ptr_ofs,
            aligned_block_size: slot_size,
            user_size: slot_size - ptr_ofs,
            num_blocks,
            num_used_blocks: 0,
            num_free_blocks: num_blocks,
            debug_checks: false,
            base: region.ptr().as_ptr(),
            region_size: region.size(),
            free: 0,
            owned_pages: None,
            guard: None,
        };

        for i in 0..num_blocks {
            let ofs = i * slot_size;
            let next = if i + 1 < num_blocks { (i + 1) * slot_size } else { NIL };
            pool.write_hdr(
                ofs,
                SlotHeader {
                    id: SLOT_FREE,
                    tag: "",
                    next,
                },
            );
        }
        pool
    }

    /// Creates a pool whose region is mapped from the OS and released on
    /// drop. `GuardPageMode::Enabled` places every slot on its own
    /// guarded page block instead of carving a shared region.
    pub fn with_mapped_pages(
        pool_size: usize,
        block_size: usize,
        alignment: usize,
        extra_header_bytes: usize,
        guard_mode: GuardPageMode,
    ) -> Result<Self, AllocError> {
        let aligned_pool_size = align_up(pool_size, page::page_size());

        if guard_mode == GuardPageMode::Enabled {
            let clamped = alignment.max(core::mem::size_of::<*const u8>());
            let (slot_size, ptr_ofs) =
                aligned_slot_size(block_size, clamped, extra_header_bytes);
            let num_blocks = aligned_pool_size / slot_size;
            assert!(num_blocks > 0, "pool region too small for a single block");
            return Ok(Self {
                alignment: clamped,
                ptr_ofs,
                aligned_block_size: slot_size,
                user_size: slot_size - ptr_ofs,
                num_blocks,
                num_used_blocks: 0,
                num_free_blocks: num_blocks,
                debug_checks: false,
                base: ptr::null_mut(),
                region_size: aligned_pool_size,
                free: NIL,
                owned_pages: None,
                guard: Some(BTreeMap::new()),
            });
        }

        let pages = page::map_page_block(aligned_pool_size, PageProtect::ReadWrite, guard_mode)?;
        let mut pool = Self::new(pages.region, block_size, alignment, extra_header_bytes);
        pool.owned_pages = Some(pages);
        Ok(pool)
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn num_used_blocks(&self) -> usize {
        self.num_used_blocks
    }

    pub fn num_free_blocks(&self) -> usize {
        self.num_free_blocks
    }

    /// User bytes available in every slot.
    pub fn user_size(&self) -> usize {
        self.user_size
    }

    pub fn enable_debug_checks(&mut self, enable: bool) {
        self.debug_checks = enable;
    }

    #[inline]
    fn hdr_ptr(&self, ofs: usize) -> *mut SlotHeader {
        debug_assert!(ofs < self.region_size);
        // SAFETY: ofs is a slot offset inside the region.
        unsafe { self.base.add(ofs).cast() }
    }

    #[inline]
    fn read_hdr(&self, ofs: usize) -> SlotHeader {
        // SAFETY: slot offsets are alignment-multiples with alignment at
        // least pointer size.
        unsafe { self.hdr_ptr(ofs).read() }
    }

    #[inline]
    fn write_hdr(&mut self, ofs: usize, hdr: SlotHeader) {
        // SAFETY: as in read_hdr.
        unsafe { self.hdr_ptr(ofs).write(hdr) }
    }

    fn ofs_of(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.as_ptr() as usize;
        let base = self.base as usize;
        assert!(
            addr >= base + self.ptr_ofs && addr < base + self.region_size,
            "pointer outside pool bounds"
        );
        addr - base - self.ptr_ofs
    }

    /// Pops a free slot. Returns `None` when the pool is exhausted.
    pub fn try_alloc(&mut self, tag: &'static str) -> Option<NonNull<u8>> {
        if self.debug_checks {
            self.verify();
        }

        if self.guard.is_some() {
            return self.guard_alloc(tag);
        }

        if self.free == NIL {
            return None;
        }
        let ofs = self.free;
        let mut hdr = self.read_hdr(ofs);
        debug_assert_eq!(hdr.id, SLOT_FREE);
        self.free = hdr.next;
        hdr.id = SLOT_USED;
        hdr.tag = tag;
        hdr.next = NIL;
        self.write_hdr(ofs, hdr);
        self.num_free_blocks -= 1;
        self.num_used_blocks += 1;

        // SAFETY: the user area is inside the slot.
        Some(unsafe { NonNull::new_unchecked(self.base.add(ofs + self.ptr_ofs)) })
    }

    /// As [Pool::try_alloc], then zeroes the slot's user bytes.
    pub fn try_calloc(&mut self, tag: &'static str) -> Option<NonNull<u8>> {
        let ptr = self.try_alloc(tag)?;
        // SAFETY: every slot holds user_size writable bytes.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, self.user_size) };
        Some(ptr)
    }

    /// As [Pool::try_alloc] but traps the process on exhaustion.
    pub fn alloc(&mut self, tag: &'static str) -> NonNull<u8> {
        match self.try_alloc(tag) {
            Some(ptr) => ptr,
            None => self.trap_out_of_memory(tag),
        }
    }

    /// As [Pool::try_calloc] but traps the process on exhaustion.
    pub fn calloc(&mut self, tag: &'static str) -> NonNull<u8> {
        match self.try_calloc(tag) {
            Some(ptr) => ptr,
            None => self.trap_out_of_memory(tag),
        }
    }

    #[cold]
    fn trap_out_of_memory(&self, tag: &'static str) -> ! {
        tracing::error!(
            num_blocks = self.num_blocks,
            block_size = self.user_size,
            tag,
            "memory pool exhausted"
        );
        std::process::abort();
    }

    /// Returns a slot to the free list. Freeing a pointer outside the
    /// pool, or one whose slot is not in use, is a caller bug and traps.
    pub fn free(&mut self, ptr: NonNull<u8>, tag: &'static str) {
        if self.debug_checks {
            self.verify();
        }

        if self.guard.is_some() {
            self.guard_free(ptr);
            return;
        }

        let ofs = self.ofs_of(ptr);
        let mut hdr = self.read_hdr(ofs);
        assert_eq!(hdr.id, SLOT_USED, "double free or stray pointer ({tag})");
        hdr.id = SLOT_FREE;
        hdr.tag = tag;
        hdr.next = self.free;
        self.write_hdr(ofs, hdr);
        self.free = ofs;
        self.num_free_blocks += 1;
        self.num_used_blocks -= 1;

        if self.debug_checks {
            self.verify();
        }
    }

    fn guard_alloc(&mut self, tag: &'static str) -> Option<NonNull<u8>> {
        if self.num_used_blocks == self.num_blocks {
            return None;
        }
        let page = page::page_size();
        let interior = align_up(self.user_size, page);
        let pages = page::map_pages(interior + 2 * page, PageProtect::NoAccess).ok()?;
        // SAFETY: the interior spans [base+page, base+page+interior).
        let rw = Region::new(
            unsafe { NonNull::new_unchecked(pages.ptr().as_ptr().add(page)) },
            interior,
        );
        page::protect_pages(rw, PageProtect::ReadWrite);

        // End-align the slot so an overrun hits the trailing guard page.
        let user = pages.addr() + page + interior - self.user_size;
        self.guard.as_mut()?.insert(user, GuardSlot { tag, pages });
        self.num_used_blocks += 1;
        self.num_free_blocks -= 1;
        // SAFETY: user points into the read-write interior.
        Some(unsafe { NonNull::new_unchecked(user as *mut u8) })
    }

    fn guard_free(&mut self, ptr: NonNull<u8>) {
        let slot = self
            .guard
            .as_mut()
            .and_then(|slots| slots.remove(&(ptr.as_ptr() as usize)));
        match slot {
            Some(slot) => {
                self.num_used_blocks -= 1;
                self.num_free_blocks += 1;
                page::unmap_pages(slot.pages);
            }
            None => debug_assert!(false, "freeing a pointer this pool does not own"),
        }
    }

    /// Counter/structure agreement check; traps on the first violation.
    pub fn verify(&self) {
        assert_eq!(self.num_used_blocks + self.num_free_blocks, self.num_blocks);

        match &self.guard {
            None => {
                let mut used = 0usize;
                let mut free = 0usize;
                for i in 0..self.num_blocks {
                    let hdr = self.read_hdr(i * self.aligned_block_size);
                    assert!(
                        hdr.id == SLOT_USED || hdr.id == SLOT_FREE,
                        "pool: corrupt slot header at index {i}"
                    );
                    if hdr.id == SLOT_USED {
                        used += 1;
                    } else {
                        free += 1;
                    }
                }
                assert_eq!(used, self.num_used_blocks);
                assert_eq!(free, self.num_free_blocks);

                let mut list_len = 0usize;
                let mut it = self.free;
                while it != NIL {
                    let hdr = self.read_hdr(it);
                    assert_eq!(hdr.id, SLOT_FREE, "used slot on the pool free list");
                    list_len += 1;
                    it = hdr.next;
                }
                assert_eq!(list_len, self.num_free_blocks);
            }
            Some(slots) => {
                assert_eq!(slots.len(), self.num_used_blocks);
            }
        }
    }

    /// Visits every slot. In guard mode only live slots are visible.
    pub fn walk(&self, mut callback: impl FnMut(usize, bool, &'static str)) {
        match &self.guard {
            None => {
                for i in 0..self.num_blocks {
                    let hdr = self.read_hdr(i * self.aligned_block_size);
                    callback(
                        self.base as usize + i * self.aligned_block_size,
                        hdr.id == SLOT_USED,
                        hdr.tag,
                    );
                }
            }
            Some(slots) => {
                for (user, slot) in slots {
                    callback(*user, true, slot.tag);
                }
            }
        }
    }

    /// Logs one warning per slot still in use.
    pub fn report_leaks(&self, pool_name: &str) {
        self.walk(|addr, used, tag| {
            if used {
                tracing::warn!(
                    pool = pool_name,
                    tag,
                    addr = format_args!("{addr:#x}"),
                    "memory leak"
                );
            }
        });
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Some(slots) = self.guard.take() {
            for slot in slots.values() {
                page::unmap_pages(slot.pages);
            }
        }
        if let Some(pages) = self.owned_pages.take() {
            page::unmap_page_block(pages);
        }
    }
}
