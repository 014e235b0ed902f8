// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bifurcated heap: two backing heaps and a size threshold. Requests below
//! the threshold land in the low heap, the rest in the high heap, which
//! keeps small-object churn from fragmenting the large-block arena. Frees
//! recover the owning heap from the pointer address alone.

use crate::heap::Heap;
use crate::{AllocError, GuardPageMode, Region};
use core::ptr::{self, NonNull};

pub struct BifurcatedHeap {
    low: Heap,
    high: Heap,
    threshold: usize,
}

impl BifurcatedHeap {
    pub fn new(low_region: Region, high_region: Region, threshold: usize) -> Self {
        Self {
            low: Heap::new(low_region, 8, 0, "bifurcated_low_heap"),
            high: Heap::new(high_region, 8, 0, "bifurcated_high_heap"),
            threshold,
        }
    }

    /// Maps both backing regions from the OS. Per-allocation guard pages
    /// are downgraded to a bracketed region here; address-based ownership
    /// recovery needs both heaps contiguous in their own ranges.
    pub fn with_mapped_pages(
        low_size: usize,
        high_size: usize,
        threshold: usize,
        guard_mode: GuardPageMode,
    ) -> Result<Self, AllocError> {
        let guard_mode = match guard_mode {
            GuardPageMode::Enabled => GuardPageMode::Minimal,
            other => other,
        };
        Ok(Self {
            low: Heap::with_mapped_pages(low_size, 8, 0, "bifurcated_low_heap", guard_mode)?,
            high: Heap::with_mapped_pages(high_size, 8, 0, "bifurcated_high_heap", guard_mode)?,
            threshold,
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn low(&self) -> &Heap {
        &self.low
    }

    pub fn high(&self) -> &Heap {
        &self.high
    }

    fn select_by_size(&mut self, size: usize) -> &mut Heap {
        if size < self.threshold {
            &mut self.low
        } else {
            &mut self.high
        }
    }

    /// Recovers ownership from the address: exactly one backing heap range
    /// contains any pointer handed out by this heap.
    fn select_by_allocation(&mut self, ptr: NonNull<u8>) -> &mut Heap {
        let addr = ptr.as_ptr() as usize;
        if self.low.contains(addr) {
            &mut self.low
        } else {
            debug_assert!(
                self.high.contains(addr),
                "pointer does not belong to the bifurcated heap"
            );
            &mut self.high
        }
    }

    pub fn try_alloc(&mut self, size: usize, tag: &'static str) -> Option<NonNull<u8>> {
        self.select_by_size(size).try_alloc(size, tag)
    }

    pub fn alloc(&mut self, size: usize, tag: &'static str) -> NonNull<u8> {
        self.select_by_size(size).alloc(size, tag)
    }

    pub fn try_calloc(&mut self, size: usize, tag: &'static str) -> Option<NonNull<u8>> {
        self.select_by_size(size).try_calloc(size, tag)
    }

    pub fn calloc(&mut self, size: usize, tag: &'static str) -> NonNull<u8> {
        self.select_by_size(size).calloc(size, tag)
    }

    /// Reallocates, moving the allocation between the backing heaps when
    /// the new size crosses the threshold. A cross-heap move degrades to
    /// alloc-on-target, copy, free-on-source.
    pub fn try_realloc(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
        tag: &'static str,
    ) -> Option<NonNull<u8>> {
        let old_is_low = self.low.contains(ptr.as_ptr() as usize);
        let new_is_low = new_size < self.threshold;

        if old_is_low == new_is_low {
            return self.select_by_allocation(ptr).try_realloc(ptr, new_size, tag);
        }

        let old_size = self.select_by_allocation(ptr).block_size(ptr);
        let new_ptr = self.select_by_size(new_size).try_alloc(new_size, tag)?;
        // SAFETY: distinct heaps, so the ranges cannot overlap; the copy
        // is bounded by both capacities.
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));
        }
        self.select_by_allocation(ptr).free(ptr, tag);
        Some(new_ptr)
    }

    pub fn realloc(&mut self, ptr: NonNull<u8>, new_size: usize, tag: &'static str) -> NonNull<u8> {
        let old_is_low = self.low.contains(ptr.as_ptr() as usize);
        let new_is_low = new_size < self.threshold;

        if old_is_low == new_is_low {
            return self.select_by_allocation(ptr).realloc(ptr, new_size, tag);
        }

        let old_size = self.select_by_allocation(ptr).block_size(ptr);
        let new_ptr = self.select_by_size(new_size).alloc(new_size, tag);
        // SAFETY: as in try_realloc.
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));
        }
        self.select_by_allocation(ptr).free(ptr, tag);
        new_ptr
    }

    pub fn free(&mut self, ptr: NonNull<u8>, tag: &'static str) {
        self.select_by_allocation(ptr).free(ptr, tag);
    }

    pub fn verify(&self) {
        self.low.verify();
        self.high.verify();
    }
}
