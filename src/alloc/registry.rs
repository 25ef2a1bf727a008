use std::{marker::PhantomData, ptr::NonNull};

use super::meta::AllocationInfo;

/// The live allocation list. Intrusive and doubly linked through the
/// [`AllocationInfo`] headers, so insert and remove are O(1) and never
/// allocate. Newest first.
pub(crate) struct Registry {
    head: *mut AllocationInfo,
    tail: *mut AllocationInfo,
    len: usize,
    /// Bytes in owned (non-external) allocations
    total_size: usize,
}

// SAFETY: the list is only reachable through the registry, which lives behind
// the tracker's lock
unsafe impl Send for Registry {}

impl Registry {
    pub const fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
            tail: std::ptr::null_mut(),
            len: 0,
            total_size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// # Safety
    ///
    /// `info` must be valid, not in any list, and stay put until it is
    /// removed.
    pub unsafe fn insert(&mut self, mut info: NonNull<AllocationInfo>) {
        let node = unsafe { info.as_mut() };
        node.previous = std::ptr::null_mut();
        node.next = self.head;
        match NonNull::new(self.head) {
            Some(mut head) => unsafe { head.as_mut().previous = info.as_ptr() },
            None => self.tail = info.as_ptr(),
        }
        self.head = info.as_ptr();
        self.len += 1;
        if !node.is_external() {
            self.total_size += node.size;
        }
    }

    /// # Safety
    ///
    /// `info` must currently be in this list.
    pub unsafe fn remove(&mut self, mut info: NonNull<AllocationInfo>) {
        let node = unsafe { info.as_mut() };
        match NonNull::new(node.previous) {
            Some(mut previous) => unsafe { previous.as_mut().next = node.next },
            None => {
                debug_assert_eq!(self.head, info.as_ptr());
                self.head = node.next;
            }
        }
        match NonNull::new(node.next) {
            Some(mut next) => unsafe { next.as_mut().previous = node.previous },
            None => {
                debug_assert_eq!(self.tail, info.as_ptr());
                self.tail = node.previous;
            }
        }
        node.previous = std::ptr::null_mut();
        node.next = std::ptr::null_mut();
        self.len -= 1;
        if !node.is_external() {
            self.total_size -= node.size;
        }
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head,
            _registry: PhantomData,
        }
    }
}

pub(crate) struct Iter<'a> {
    next: *mut AllocationInfo,
    _registry: PhantomData<&'a Registry>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a AllocationInfo;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: every node in the list is valid while it's in the list, and
        // the list can't change while we borrow the registry
        let node = unsafe { self.next.as_ref()? };
        self.next = node.next;
        Some(node)
    }
}
