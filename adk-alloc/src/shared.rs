// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A mutex-wrapped heap implementing the `allocator_api2` [Allocator]
//! trait. Heaps themselves are single-owner; a subsystem whose
//! collaborators allocate from another thread (the reporter's HTTP
//! completion path, the cache's transport) wraps its heap in one of
//! these and hands out references.

use crate::heap::{Heap, HeapMetrics};
use crate::{AllocError, Allocator, Layout};
use core::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

const SHARED_TAG: &str = "shared_heap";

pub struct SharedHeap {
    inner: Mutex<Heap>,
}

impl SharedHeap {
    pub fn new(heap: Heap) -> Self {
        Self {
            inner: Mutex::new(heap),
        }
    }

    /// Locks the underlying heap for a batch of tagged operations.
    pub fn lock(&self) -> MutexGuard<'_, Heap> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn try_alloc(&self, size: usize, tag: &'static str) -> Option<NonNull<u8>> {
        self.lock().try_alloc(size, tag)
    }

    pub fn alloc(&self, size: usize, tag: &'static str) -> NonNull<u8> {
        self.lock().alloc(size, tag)
    }

    pub fn free(&self, ptr: NonNull<u8>, tag: &'static str) {
        self.lock().free(ptr, tag)
    }

    pub fn metrics(&self) -> HeapMetrics {
        self.lock().metrics()
    }

    pub fn report_leaks(&self) {
        self.lock().report_leaks()
    }
}

// SAFETY: allocations are served from the wrapped heap under its mutex;
// pointers stay valid until deallocated regardless of which thread frees
// them.
unsafe impl Allocator for SharedHeap {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Err(AllocError);
        }
        let mut heap = self.lock();
        if layout.align() > heap.alignment() {
            return Err(AllocError);
        }
        match heap.try_alloc(layout.size(), SHARED_TAG) {
            Some(ptr) => Ok(NonNull::slice_from_raw_parts(ptr, layout.size())),
            None => Err(AllocError),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        self.lock().free(ptr, SHARED_TAG);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Region;
    use allocator_api2::vec::Vec as AllocVec;
    use std::sync::Arc;

    struct TestRegion {
        _backing: Vec<u64>,
        region: Region,
    }

    fn test_region(size: usize) -> TestRegion {
        let mut backing = vec![0u64; size / 8 + 8];
        let raw = backing.as_mut_ptr() as usize;
        let aligned = (raw + 63) & !63;
        TestRegion {
            region: Region::new(NonNull::new(aligned as *mut u8).unwrap(), size),
            _backing: backing,
        }
    }

    #[test]
    fn backs_an_allocator_api_vec() {
        let mem = test_region(64 * 1024);
        let shared = SharedHeap::new(Heap::new(mem.region, 8, 0, "shared"));

        {
            let mut vec: AllocVec<u8, &SharedHeap> = AllocVec::new_in(&shared);
            vec.extend_from_slice(b"scratch buffer contents");
            assert_eq!(&vec[..7], b"scratch");
            assert!(shared.metrics().num_used_blocks > 0);
        }
        assert_eq!(shared.metrics().num_used_blocks, 0);
    }

    #[test]
    fn rejects_over_aligned_layouts() {
        let mem = test_region(16 * 1024);
        let shared = SharedHeap::new(Heap::new(mem.region, 8, 0, "shared"));
        let layout = Layout::from_size_align(64, 4096).unwrap();
        assert!(shared.allocate(layout).is_err());
    }

    #[test]
    fn concurrent_allocation_stays_consistent() {
        let mem = test_region(1024 * 1024);
        let shared = Arc::new(SharedHeap::new(Heap::new(mem.region, 8, 0, "shared")));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if let Some(ptr) = shared.try_alloc(128, "worker") {
                            shared.free(ptr, "worker");
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let metrics = shared.metrics();
        assert_eq!(metrics.num_used_blocks, 0);
        assert_eq!(metrics.free_bytes, metrics.heap_size);
        shared.lock().verify();
    }
}
