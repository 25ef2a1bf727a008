//! Page-granular allocations butted up against an inaccessible page.
//!
//! ```plaintext
//! base                                      base + (pages - 1) * ps
//! |                                         |
//! v                                         v
//! +--------------------+--------------------+--------------------+
//! | rw      [ user data .....................]  PROT_NONE       |
//! +--------------------+--------------------+--------------------+
//!           ^
//!           (end - size) rounded down to align
//! ```
//!
//! The first byte past the allocation faults, right at the instruction that
//! overran it. Costs at least two pages of address space per allocation, so
//! it is only for hunting a specific stomp.

use std::{alloc::Layout, ptr::NonNull};

use super::{AllocError, SourceAllocator};
use crate::{
    debug_println,
    os::mem::{page_size, MmapRegion, Protection},
    util::{assert::aligned_to, num::align_down},
};

#[derive(Clone, Copy, Debug, Default)]
pub struct GuardAllocator(());

impl GuardAllocator {
    pub const fn new() -> Self {
        Self(())
    }

    /// Pages reserved for a `size` byte allocation, guard page included
    pub fn pages_for(size: usize) -> usize {
        size.div_ceil(page_size()) + 1
    }

    /// `align` of 0 means "don't care"
    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let ps = page_size();
        let align = align.max(1);
        if size == 0 || !align.is_power_of_two() || align > ps {
            return Err(AllocError::InvalidLayout { size, align });
        }
        let pages = Self::pages_for(size);
        let region = MmapRegion::reserve(pages * ps, Protection::None)
            .map_err(|_| AllocError::OutOfMemory { size, align })?;
        if let Err(e) = region.protect(0, (pages - 1) * ps, Protection::ReadWrite) {
            debug_println!("GuardAllocator: {e}");
            return Err(AllocError::OutOfMemory { size, align });
        }
        let (base, _) = region.into_raw_parts();

        if align == ps {
            // SAFETY: mmap never returns null
            return Ok(unsafe { NonNull::new_unchecked(base) });
        }
        let end = base as usize + (pages - 1) * ps;
        let ptr = align_down(end - size, align) as *mut u8;
        debug_assert!(aligned_to(ptr, align));
        // SAFETY: `ptr` is inside the first page of the mapping, so not null
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    /// # Safety
    ///
    /// `ptr` must have come from [`GuardAllocator::allocate`] with this
    /// `size`, and must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let ps = page_size();
        let base = align_down(ptr.as_ptr() as usize, ps);
        // SAFETY: the allocation always starts in the first page of its
        // mapping, and the caller gave us the size it was made with
        drop(unsafe { MmapRegion::from_raw_parts(base as *mut u8, Self::pages_for(size) * ps) });
    }
}

// SAFETY: blocks are `layout.size()` bytes of fresh read/write pages aligned
// to `layout.align()`, and mmap is thread safe
unsafe impl SourceAllocator for GuardAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        GuardAllocator::allocate(self, layout.size(), layout.align())
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { GuardAllocator::deallocate(self, ptr, layout.size()) }
    }
}
