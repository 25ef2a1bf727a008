//! Attributing allocations to whoever is "in charge" on this thread.
//!
//! ```
//! use debugheap::alloc::TagScope;
//!
//! let _tag = TagScope::new("renderer");
//! // everything allocated by the tracking allocator on this thread until
//! // `_tag` drops is tagged "renderer"
//! ```

use std::{cell::Cell, marker::PhantomData};

thread_local! {
    static ACTIVE_TAG: Cell<Option<&'static str>> = const { Cell::new(None) };
}

/// The tag new allocations on this thread get
pub fn active() -> Option<&'static str> {
    ACTIVE_TAG.try_with(Cell::get).ok().flatten()
}

/// Sets the thread's active tag for as long as it lives, then puts back
/// whatever was active before. Not `Send`: it belongs to the thread whose tag
/// it changed.
#[must_use = "the tag is only active while the scope is alive"]
pub struct TagScope {
    previous: Option<&'static str>,
    _not_send: PhantomData<*const ()>,
}

impl TagScope {
    pub fn new(tag: &'static str) -> Self {
        let previous = ACTIVE_TAG.try_with(|t| t.replace(Some(tag))).ok().flatten();
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for TagScope {
    fn drop(&mut self) {
        _ = ACTIVE_TAG.try_with(|t| t.set(self.previous));
    }
}
