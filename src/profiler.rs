//! Named regions of code, tracked per thread.
//!
//! Release builds often have no usable symbols, so when something crashes the
//! open regions are the best account of where the thread was. The crash
//! handler reads them off the faulting thread with [`snapshot`].
//!
//! ```
//! use debugheap::profile_scope;
//!
//! fn load_level() {
//!     profile_scope!("load_level");
//!     // ...
//! }
//! ```

use std::{cell::Cell, fmt, marker::PhantomData};

use serde::Serialize;

/// Regions deeper than this are counted but not named
pub const MAX_OPEN_REGIONS: usize = 16;

struct RegionStack {
    depth: Cell<usize>,
    names: [Cell<&'static str>; MAX_OPEN_REGIONS],
}

#[allow(clippy::declare_interior_mutable_const)]
const UNNAMED: Cell<&'static str> = Cell::new("");

thread_local! {
    static REGIONS: RegionStack = const {
        RegionStack {
            depth: Cell::new(0),
            names: [UNNAMED; MAX_OPEN_REGIONS],
        }
    };
}

/// Open for as long as it lives. Regions must close in the reverse order they
/// opened, which scoping gives you for free.
#[must_use = "the region closes as soon as the scope is dropped"]
pub struct ProfileScope {
    _not_send: PhantomData<*const ()>,
}

impl ProfileScope {
    #[inline]
    pub fn new(name: &'static str) -> Self {
        _ = REGIONS.try_with(|regions| {
            let depth = regions.depth.get();
            if let Some(slot) = regions.names.get(depth) {
                slot.set(name);
            }
            regions.depth.set(depth + 1);
        });
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for ProfileScope {
    #[inline]
    fn drop(&mut self) {
        _ = REGIONS.try_with(|regions| {
            regions.depth.set(regions.depth.get().saturating_sub(1));
        });
    }
}

/// Open a [`ProfileScope`] until the end of the enclosing block
#[macro_export]
macro_rules! profile_scope {
    ($name:expr) => {
        let _profile_scope = $crate::profiler::ProfileScope::new($name);
    };
}

/// The open regions of one thread, outermost first. Fixed size, so taking one
/// never allocates.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProfileSnapshot {
    names: [&'static str; MAX_OPEN_REGIONS],
    depth: usize,
}

impl ProfileSnapshot {
    pub const EMPTY: Self = Self {
        names: [""; MAX_OPEN_REGIONS],
        depth: 0,
    };

    /// The regions we have names for
    pub fn regions(&self) -> &[&'static str] {
        &self.names[..self.depth.min(MAX_OPEN_REGIONS)]
    }

    /// How many regions were really open
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_truncated(&self) -> bool {
        self.depth > MAX_OPEN_REGIONS
    }
}

impl Default for ProfileSnapshot {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for ProfileSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileSnapshot")
            .field("regions", &self.regions())
            .field("depth", &self.depth)
            .finish()
    }
}

impl fmt::Display for ProfileSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, name) in self.regions().iter().enumerate() {
            if i > 0 {
                f.write_str(" > ")?;
            }
            f.write_str(name)?;
        }
        if self.is_truncated() {
            write!(f, " > ... ({} more)", self.depth - MAX_OPEN_REGIONS)?;
        }
        Ok(())
    }
}

impl Serialize for ProfileSnapshot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut s = serializer.serialize_struct("ProfileSnapshot", 2)?;
        s.serialize_field("regions", self.regions())?;
        s.serialize_field("depth", &self.depth)?;
        s.end()
    }
}

/// The calling thread's open regions
pub fn snapshot() -> ProfileSnapshot {
    REGIONS
        .try_with(|regions| {
            let mut snapshot = ProfileSnapshot::EMPTY;
            snapshot.depth = regions.depth.get();
            for (name, slot) in snapshot.names.iter_mut().zip(&regions.names) {
                *name = slot.get();
            }
            snapshot
        })
        .unwrap_or_default()
}
