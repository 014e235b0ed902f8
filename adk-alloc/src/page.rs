// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Page-granular mappings from the OS, plus guarded page blocks: a
//! reservation bracketed by two inaccessible pages so that running off
//! either end of the inner region traps immediately.

use crate::{align_up, AllocError, GuardPageMode, PageProtect, Region};
use core::ptr::NonNull;

/// A guarded reservation. `internal` is the whole mapping including the
/// bracketing guard pages; `region` is the accessible interior handed to
/// the caller.
#[derive(Clone, Copy, Debug)]
pub struct PageBlock {
    pub internal: Region,
    pub region: Region,
}

/// System page size. Cached after the first query.
pub fn page_size() -> usize {
    use std::sync::OnceLock;
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(os::query_page_size)
}

/// Reserves `ceil(size / page_size) * page_size` bytes with the given
/// protection. Fails with [AllocError] when the OS is out of address
/// space or commit.
pub fn map_pages(size: usize, protect: PageProtect) -> Result<Region, AllocError> {
    if size == 0 {
        return Err(AllocError);
    }
    let mapped_size = align_up(size, page_size());
    os::map(mapped_size, protect)
}

/// Changes the protection of `pages`, which must be page-aligned in both
/// address and size.
pub fn protect_pages(pages: Region, protect: PageProtect) {
    let page = page_size();
    debug_assert_eq!(pages.addr() & (page - 1), 0, "unaligned page region");
    debug_assert_eq!(pages.size() & (page - 1), 0, "unaligned page region size");
    os::protect(pages, protect);
}

/// Releases a mapping previously obtained from [map_pages].
pub fn unmap_pages(pages: Region) {
    os::unmap(pages);
}

/// Reserves `size` rounded up to whole pages, plus (in `Minimal` and
/// `Enabled` modes) one inaccessible page on each side. The returned
/// block's `region` is the interior with `protect` applied. In
/// `Disabled` mode this is equivalent to [map_pages].
pub fn map_page_block(
    size: usize,
    protect: PageProtect,
    guard_mode: GuardPageMode,
) -> Result<PageBlock, AllocError> {
    if guard_mode == GuardPageMode::Disabled {
        let region = map_pages(size, protect)?;
        return Ok(PageBlock {
            internal: region,
            region,
        });
    }

    let page = page_size();
    let block_size = align_up(size.max(1), page);
    let total_size = block_size + 2 * page;

    let internal = os::map(total_size, PageProtect::NoAccess)?;
    // SAFETY: total_size = block_size + 2 pages, so base + page is in
    // bounds and the interior spans exactly block_size bytes.
    let interior_ptr = unsafe { NonNull::new_unchecked(internal.ptr().as_ptr().add(page)) };
    let region = Region::new(interior_ptr, block_size);
    os::protect(region, protect);

    Ok(PageBlock { internal, region })
}

/// Releases a block obtained from [map_page_block], guard pages included.
pub fn unmap_page_block(block: PageBlock) {
    os::unmap(block.internal);
}

#[cfg(unix)]
mod os {
    use super::*;

    pub(super) fn query_page_size() -> usize {
        // SAFETY: sysconf with a valid name has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        debug_assert!(size > 0 && (size as usize).is_power_of_two());
        size as usize
    }

    fn prot_flags(protect: PageProtect) -> libc::c_int {
        match protect {
            PageProtect::NoAccess => libc::PROT_NONE,
            PageProtect::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }

    pub(super) fn map(size: usize, protect: PageProtect) -> Result<Region, AllocError> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
        // SAFETY: these args create a fresh private anonymous mapping,
        // akin to malloc.
        let result = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size as libc::size_t,
                prot_flags(protect),
                flags,
                -1,
                0,
            )
        };
        if result == libc::MAP_FAILED {
            return Err(AllocError);
        }
        // SAFETY: a non-MAP_FIXED mapping never starts at address zero.
        let ptr = unsafe { NonNull::new_unchecked(result.cast::<u8>()) };
        Ok(Region::new(ptr, size))
    }

    pub(super) fn protect(pages: Region, protect: PageProtect) {
        // SAFETY: caller hands back a region derived from map(); mprotect
        // on a live page-aligned mapping is well-defined.
        let rc = unsafe {
            libc::mprotect(
                pages.ptr().as_ptr().cast(),
                pages.size() as libc::size_t,
                prot_flags(protect),
            )
        };
        debug_assert_eq!(rc, 0, "mprotect failed");
    }

    pub(super) fn unmap(pages: Region) {
        // SAFETY: only regions produced by map() reach here.
        let rc = unsafe { libc::munmap(pages.ptr().as_ptr().cast(), pages.size() as libc::size_t) };
        debug_assert_eq!(rc, 0, "munmap failed");
    }
}

#[cfg(windows)]
mod os {
    use super::*;
    use windows_sys::Win32::System::Memory;
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    pub(super) fn query_page_size() -> usize {
        let mut info = core::mem::MaybeUninit::<SYSTEM_INFO>::uninit();
        // SAFETY: GetSystemInfo fills the struct and cannot fail.
        let info = unsafe {
            GetSystemInfo(info.as_mut_ptr());
            info.assume_init()
        };
        info.dwPageSize as usize
    }

    fn prot_flags(protect: PageProtect) -> u32 {
        match protect {
            PageProtect::NoAccess => Memory::PAGE_NOACCESS,
            PageProtect::ReadWrite => Memory::PAGE_READWRITE,
        }
    }

    pub(super) fn map(size: usize, protect: PageProtect) -> Result<Region, AllocError> {
        let alloc_type = Memory::MEM_COMMIT | Memory::MEM_RESERVE;
        // SAFETY: these args create a fresh reservation, akin to malloc.
        let result =
            unsafe { Memory::VirtualAlloc(core::ptr::null(), size, alloc_type, prot_flags(protect)) };
        match NonNull::new(result.cast::<u8>()) {
            Some(ptr) => Ok(Region::new(ptr, size)),
            None => Err(AllocError),
        }
    }

    pub(super) fn protect(pages: Region, protect: PageProtect) {
        let mut old = 0u32;
        // SAFETY: re-protecting part of a live reservation obtained from
        // map().
        let rc = unsafe {
            Memory::VirtualProtect(
                pages.ptr().as_ptr().cast(),
                pages.size(),
                prot_flags(protect),
                &mut old,
            )
        };
        debug_assert_ne!(rc, 0, "VirtualProtect failed");
    }

    pub(super) fn unmap(pages: Region) {
        // SAFETY: pages.ptr is the base of a reservation created by map().
        let rc = unsafe { Memory::VirtualFree(pages.ptr().as_ptr().cast(), 0, Memory::MEM_RELEASE) };
        debug_assert_ne!(rc, 0, "VirtualFree failed");
    }
}
