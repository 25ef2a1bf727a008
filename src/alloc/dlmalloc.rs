use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::NonNull,
};

use dlmalloc::GlobalDlmalloc;

use super::{AllocError, SourceAllocator};
use crate::util::hint::cold;

// https://gee.cs.oswego.edu/dl/html/malloc.html

/// Every chunk `dlmalloc()` hands out is at least this aligned
pub const DLMALLOC_MIN_ALIGN: usize = 8;

/// `dlmalloc()` as a source for the tracking layer. The heap is the crate's
/// process-wide one (it carries its own lock), so two `DlmallocSource`s share
/// it and a block can be freed through either.
///
/// Handy when the tracked heap should stay apart from the system `malloc()`,
/// e.g. so the program's own heap layout doesn't change when tracking is
/// switched on.
#[derive(Clone, Copy, Debug, Default)]
pub struct DlmallocSource(());

impl DlmallocSource {
    pub const fn new() -> Self {
        Self(())
    }
}

// SAFETY: `GlobalDlmalloc` upholds the `GlobalAlloc` contract and is
// internally locked
unsafe impl SourceAllocator for DlmallocSource {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(layout.size() > 0);
        // SAFETY: nonzero size, checked by the caller
        let data = unsafe { GlobalDlmalloc.alloc(layout) };
        match NonNull::new(data) {
            Some(data) => Ok(data),
            None => cold(|| Err(AllocError::oom(layout))),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY:
        // - Identical contract to caller, which is described in
        //   `SourceAllocator` docs.
        unsafe { GlobalDlmalloc.dealloc(ptr.as_ptr(), layout) }
    }
}
