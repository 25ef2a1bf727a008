//! The per-allocation header and where everything sits in a block.

use std::{alloc::Layout, cmp, mem, ptr::NonNull};

use super::AllocError;
use crate::stack::StackNodeHandle;

/// Written just before and just after the user region
pub const ALLOCATION_GUARD: u32 = 0xFDFD_FDFD;
/// Fresh allocations are filled with this
pub const UNINITIALIZED_MEMORY_PATTERN: u8 = 0xCD;
/// Freed allocations are filled with this before going back to the source
pub const FREED_MEMORY_PATTERN: u8 = 0xDD;
/// What "align 0" means, and the least alignment any user pointer gets
pub const MIN_ALIGN: usize = 8;

pub(crate) const GUARD_SIZE: usize = mem::size_of::<u32>();

/// Metadata in front of every tracked allocation, also the node of the live
/// allocation list. Memory that didn't come from the tracking allocator can
/// get into the list too, see
/// [`super::TrackingAllocator::register_external`].
#[repr(C)]
#[derive(Debug)]
pub struct AllocationInfo {
    pub(crate) previous: *mut AllocationInfo,
    pub(crate) next: *mut AllocationInfo,
    pub(crate) size: usize,
    /// As requested, 0 for "default"
    pub(crate) align: usize,
    pub(crate) tag: Option<&'static str>,
    pub(crate) stack: StackNodeHandle,
    pub(crate) flags: u32,
}

impl AllocationInfo {
    /// Not our memory. Linked for leak reporting, never guard checked.
    pub const EXTERNAL: u32 = 1 << 0;
    /// Allocated while the tracker was already busy on this thread, so it
    /// never made it into the list
    pub const UNLINKED: u32 = 1 << 1;

    pub(crate) const fn new(size: usize, align: usize, tag: Option<&'static str>) -> Self {
        Self {
            previous: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
            size,
            align,
            tag,
            stack: StackNodeHandle::ROOT,
            flags: 0,
        }
    }

    /// A record for memory that lives somewhere else (a C library's heap,
    /// a mapping, ...), to be registered with
    /// [`super::TrackingAllocator::register_external`].
    pub const fn external(size: usize, tag: Option<&'static str>) -> Self {
        let mut info = Self::new(size, 0, tag);
        info.flags = Self::EXTERNAL;
        info
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn tag(&self) -> Option<&'static str> {
        self.tag
    }

    pub fn stack(&self) -> StackNodeHandle {
        self.stack
    }

    pub fn is_external(&self) -> bool {
        self.flags & Self::EXTERNAL != 0
    }

    pub(crate) fn is_linked(&self) -> bool {
        self.flags & Self::UNLINKED == 0
    }
}

/// How far in front of the user pointer the header starts. The front guard
/// takes the last 4 bytes of that span.
pub const fn header_size(guards: bool) -> usize {
    let raw = mem::size_of::<AllocationInfo>() + if guards { GUARD_SIZE } else { 0 };
    (raw + MIN_ALIGN - 1) & !(MIN_ALIGN - 1)
}

/// Where the pieces of one block live. A block looks like this
///
/// ```plaintext
/// +--------------------+ <- source pointer (aligned to `source.align()`)
/// | padding...         |
/// | AllocationInfo     | header_size bytes
/// | front guard        |
/// +--------------------+ <- user pointer = source pointer + offset
/// | user data          | size bytes
/// +--------------------+
/// | back guard         | unaligned
/// +--------------------+
/// ```
///
/// Everything is derived from `(size, align, guards)`, so `deallocate()` can
/// rebuild it from the header alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockLayout {
    /// What we ask the source for
    pub source: Layout,
    /// Source pointer to user pointer
    pub offset: usize,
    pub size: usize,
    pub guards: bool,
}

impl BlockLayout {
    pub fn new(size: usize, align: usize, guards: bool) -> Result<Self, AllocError> {
        let invalid = AllocError::InvalidLayout { size, align };
        if size == 0 || (align != 0 && !align.is_power_of_two()) {
            return Err(invalid);
        }
        let align = cmp::max(align, MIN_ALIGN);
        let header = header_size(guards);
        let offset = header.checked_next_multiple_of(align).ok_or(invalid)?;
        let total = offset
            .checked_add(size)
            .and_then(|n| n.checked_add(if guards { GUARD_SIZE } else { 0 }))
            .ok_or(invalid)?;
        let source = Layout::from_size_align(total, align).map_err(|_| invalid)?;
        Ok(Self {
            source,
            offset,
            size,
            guards,
        })
    }

    /// # Safety
    ///
    /// `base` must be a block of `self.source`
    pub unsafe fn user(&self, base: NonNull<u8>) -> NonNull<u8> {
        unsafe { base.add(self.offset) }
    }

    /// # Safety
    ///
    /// `user` must be the user pointer of a block of this layout
    pub unsafe fn base(&self, user: NonNull<u8>) -> NonNull<u8> {
        unsafe { user.sub(self.offset) }
    }

    /// # Safety
    ///
    /// `user` must be the user pointer of a block with a header
    pub unsafe fn info(guards: bool, user: NonNull<u8>) -> NonNull<AllocationInfo> {
        unsafe { user.sub(header_size(guards)).cast() }
    }

    /// # Safety
    ///
    /// `user` must be the user pointer of a block with guards
    pub unsafe fn front_guard(user: NonNull<u8>) -> *mut u32 {
        unsafe { user.as_ptr().sub(GUARD_SIZE).cast() }
    }

    /// # Safety
    ///
    /// `user` must be the user pointer of a guarded block of `size` bytes
    pub unsafe fn back_guard(user: NonNull<u8>, size: usize) -> *mut u32 {
        unsafe { user.as_ptr().add(size).cast() }
    }
}

/// Are both guards around `user` intact? `(front, back)`
///
/// # Safety
///
/// `user` must be the user pointer of a live guarded block of `size` bytes
pub(crate) unsafe fn guards_intact(user: NonNull<u8>, size: usize) -> (bool, bool) {
    unsafe {
        (
            BlockLayout::front_guard(user).read_unaligned() == ALLOCATION_GUARD,
            BlockLayout::back_guard(user, size).read_unaligned() == ALLOCATION_GUARD,
        )
    }
}
