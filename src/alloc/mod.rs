//! Allocators. [`tracking::TrackingAllocator`] is the debug heap proper, the
//! rest are the raw memory it can sit on top of.

pub mod dlmalloc;
pub mod guard;
pub mod meta;
mod registry;
pub mod report;
pub mod tag;
pub mod tracking;

use std::{
    alloc::{GlobalAlloc, Layout, System},
    ptr::NonNull,
};

use thiserror::Error;

pub use self::{
    dlmalloc::DlmallocSource,
    guard::GuardAllocator,
    meta::AllocationInfo,
    report::{AllocationRecord, GuardReport, GuardViolation, LeakReport, SiteSummary},
    tag::TagScope,
    tracking::{CorruptionPolicy, LeakPolicy, TrackingAllocator, TrackingConfig},
};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("out of memory allocating {size} bytes (align {align})")]
    OutOfMemory { size: usize, align: usize },
    #[error("invalid allocation request: {size} bytes (align {align})")]
    InvalidLayout { size: usize, align: usize },
}

impl AllocError {
    pub(crate) fn oom(layout: Layout) -> Self {
        Self::OutOfMemory {
            size: layout.size(),
            align: layout.align(),
        }
    }
}

/// Where the raw memory comes from.
///
/// # Safety
///
/// - `allocate()` must return a block of at least `layout.size()` bytes
///   aligned to `layout.align()`, valid until it is passed to `deallocate()`.
/// - The allocator must be usable from any thread.
pub unsafe trait SourceAllocator: Send + Sync {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// # Safety
    ///
    /// `ptr` must have come from `allocate()` on this allocator with the same
    /// `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

// SAFETY: forwards to `S`
unsafe impl<S: SourceAllocator + ?Sized> SourceAllocator for &S {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { (**self).deallocate(ptr, layout) }
    }
}

/// The platform allocator (`malloc()`)
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemSource;

// SAFETY: `System` upholds the `GlobalAlloc` contract, which is stricter
unsafe impl SourceAllocator for SystemSource {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(layout.size() > 0);
        // SAFETY: the tracking layer never asks for zero bytes
        NonNull::new(unsafe { System.alloc(layout) }).ok_or(AllocError::oom(layout))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { System.dealloc(ptr.as_ptr(), layout) }
    }
}
