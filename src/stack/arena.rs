use std::mem;

use crate::os::mem::{MapError, MmapRegion};

/// Marks a missing link
pub(crate) const NONE: u32 = u32::MAX;

/// One return address in the trie. Links are indices into the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct StackNode {
    /// Identity of this node among its siblings. The root's is 0.
    pub instruction: usize,
    /// One frame deeper
    pub first_child: u32,
    /// Next sibling under the same parent
    pub next: u32,
    pub parent: u32,
}

/// Flat storage for [`StackNode`]s on an mmap'd region, so growing the trie
/// never calls the allocator we're tracking. Nodes are only ever appended,
/// indices stay valid for the life of the arena, and dropping it is one
/// `munmap()` no matter how deep the trie got.
pub(crate) struct NodeArena {
    region: MmapRegion,
    capacity: usize,
    len: usize,
}

impl NodeArena {
    /// Reserve room for `capacity` nodes, with the root already in slot 0.
    /// Pages are only committed as nodes get written.
    pub fn new(capacity: usize) -> Result<Self, MapError> {
        let capacity = capacity.clamp(1, NONE as usize);
        let region = MmapRegion::map_noreserve(capacity * mem::size_of::<StackNode>())?;
        let mut arena = Self {
            region,
            capacity,
            len: 0,
        };
        arena.push(StackNode {
            instruction: 0,
            first_child: NONE,
            next: NONE,
            parent: NONE,
        });
        Ok(arena)
    }

    fn slots(&self) -> *mut StackNode {
        self.region.as_ptr().cast()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn push(&mut self, node: StackNode) -> Option<u32> {
        if self.len == self.capacity {
            return None;
        }
        // SAFETY: `len < capacity` and the region holds `capacity` nodes;
        // mmap memory is page aligned, so aligned for `StackNode`
        unsafe { self.slots().add(self.len).write(node) };
        self.len += 1;
        Some((self.len - 1) as u32)
    }

    pub fn get(&self, index: u32) -> &StackNode {
        assert!((index as usize) < self.len, "stack node {index} out of bounds");
        // SAFETY: bounds checked, every slot below `len` is initialized
        unsafe { &*self.slots().add(index as usize) }
    }

    fn get_mut(&mut self, index: u32) -> &mut StackNode {
        assert!((index as usize) < self.len, "stack node {index} out of bounds");
        // SAFETY: as above, and we have `&mut self`
        unsafe { &mut *self.slots().add(index as usize) }
    }

    /// Scan `parent`'s children for `instruction`
    pub fn find_child(&self, parent: u32, instruction: usize) -> Option<u32> {
        let mut child = self.get(parent).first_child;
        while child != NONE {
            let node = self.get(child);
            if node.instruction == instruction {
                return Some(child);
            }
            child = node.next;
        }
        None
    }

    /// Add a new child under `parent`, `None` if the arena is full
    pub fn push_child(&mut self, parent: u32, instruction: usize) -> Option<u32> {
        let next = self.get(parent).first_child;
        let child = self.push(StackNode {
            instruction,
            first_child: NONE,
            next,
            parent,
        })?;
        self.get_mut(parent).first_child = child;
        Some(child)
    }
}
