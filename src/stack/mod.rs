//! A trie of call stacks. Every allocation records its stack, and most
//! allocations come from a handful of call paths that share almost all of
//! their outer frames, so we store each distinct path once and hand out the
//! leaf as a handle.
//!
//! The trie is rooted at the outermost frame (closest to `main()`), so paths
//! converge toward the root and diverge at the first frame where two calls
//! went different ways.

mod arena;
pub mod symbols;

use std::fmt::{self, Write as _};

use serde::Serialize;

use crate::{debug_println, lock::FutexMutex};

use self::arena::{NodeArena, NONE};
pub use self::symbols::{BacktraceSymbols, Symbol, SymbolContext, SymbolService};

/// Maximum number of frames captured per `record()`
pub const MAX_FRAMES: usize = 256;

/// A node in a [`StackTree`]. The node stands for the whole path from itself
/// up to the root. Only meaningful for the tree that handed it out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StackNodeHandle(u32);

impl StackNodeHandle {
    /// The root: no frames, "unknown location"
    pub const ROOT: Self = Self(0);

    pub const fn is_root(self) -> bool {
        self.0 == 0
    }

    pub const fn index(self) -> u32 {
        self.0
    }
}

impl Default for StackNodeHandle {
    fn default() -> Self {
        Self::ROOT
    }
}

/// See the module docs
pub struct StackTree<'a> {
    symbols: &'a SymbolContext<'a>,
    capacity: usize,
    /// Mapped on first use, so the tree can be built in a `const` context
    /// (a global allocator, say) before anything can be mapped.
    nodes: FutexMutex<Option<NodeArena>>,
}

impl<'a> StackTree<'a> {
    /// Default maximum number of distinct frames. The arena is reserved up
    /// front but only touched pages are committed.
    pub const DEFAULT_CAPACITY: usize = 1 << 22;

    pub const fn new(symbols: &'a SymbolContext<'a>) -> Self {
        Self::with_capacity(symbols, Self::DEFAULT_CAPACITY)
    }

    pub const fn with_capacity(symbols: &'a SymbolContext<'a>, capacity: usize) -> Self {
        Self {
            symbols,
            capacity,
            nodes: FutexMutex::new(None),
        }
    }

    pub fn symbols(&self) -> &'a SymbolContext<'a> {
        self.symbols
    }

    /// Map the arena if we haven't yet. The first tree to do so brings the
    /// symbol service up. `None` if the arena can't be mapped, in which case
    /// every stack is "unknown".
    fn arena<'g>(&self, nodes: &'g mut Option<NodeArena>) -> Option<&'g mut NodeArena> {
        if nodes.is_none() {
            match NodeArena::new(self.capacity) {
                Ok(arena) => {
                    self.symbols.acquire();
                    *nodes = Some(arena);
                }
                Err(e) => {
                    debug_println!("StackTree: could not map node arena: {e}");
                    return None;
                }
            }
        }
        nodes.as_mut()
    }

    /// Record the caller's stack (minus the caller itself, which is the
    /// diagnostics code asking) and return the node for it.
    #[inline(never)]
    pub fn record(&self) -> StackNodeHandle {
        let mut frames = [0usize; MAX_FRAMES];
        // skip `record()` and whoever called it
        let nr_frames = self.symbols.service().capture_stack(2, &mut frames);
        self.insert(&frames[..nr_frames])
    }

    /// Insert a captured stack (innermost frame first) and return its leaf.
    /// Gives back the root if the stack is empty or the trie is full.
    pub fn insert(&self, frames: &[usize]) -> StackNodeHandle {
        if frames.is_empty() {
            return StackNodeHandle::ROOT;
        }
        let mut nodes = self.nodes.lock();
        let Some(arena) = self.arena(&mut nodes) else {
            return StackNodeHandle::ROOT;
        };
        let mut node = StackNodeHandle::ROOT.0;
        for &instruction in frames.iter().rev() {
            node = match arena.find_child(node, instruction) {
                Some(child) => child,
                None => match arena.push_child(node, instruction) {
                    Some(child) => child,
                    None => return StackNodeHandle::ROOT,
                },
            };
        }
        StackNodeHandle(node)
    }

    /// Number of nodes in the trie, root included
    pub fn len(&self) -> usize {
        self.nodes.lock().as_ref().map_or(1, NodeArena::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// One frame out, `None` at the root
    pub fn get_parent(&self, node: StackNodeHandle) -> Option<StackNodeHandle> {
        if node.is_root() {
            return None;
        }
        let nodes = self.nodes.lock();
        let parent = nodes.as_ref()?.get(node.0).parent;
        (parent != NONE).then_some(StackNodeHandle(parent))
    }

    /// The return address a node stands for, `None` for the root
    pub fn instruction(&self, node: StackNodeHandle) -> Option<usize> {
        if node.is_root() {
            return None;
        }
        let nodes = self.nodes.lock();
        Some(nodes.as_ref()?.get(node.0).instruction)
    }

    /// Fill `out` with `node` and its ancestors, innermost first, stopping
    /// before the root or when `out` is full. Returns how many were written.
    pub fn get_path(&self, node: StackNodeHandle, out: &mut [StackNodeHandle]) -> usize {
        let nodes = self.nodes.lock();
        let Some(arena) = nodes.as_ref() else {
            return 0;
        };
        let mut i = 0;
        let mut current = node.0;
        while i < out.len() && current != NONE && current != StackNodeHandle::ROOT.0 {
            out[i] = StackNodeHandle(current);
            i += 1;
            current = arena.get(current).parent;
        }
        i
    }

    /// Like [`StackTree::get_path`] into a `Vec`, at most `max_depth` long
    pub fn path(&self, node: StackNodeHandle, max_depth: usize) -> Vec<StackNodeHandle> {
        let mut out = vec![StackNodeHandle::ROOT; max_depth];
        let len = self.get_path(node, &mut out);
        out.truncate(len);
        out
    }

    /// Copy the return addresses from `node` to the root into `out`,
    /// innermost first
    pub fn frames(&self, node: StackNodeHandle, out: &mut [usize]) -> usize {
        let nodes = self.nodes.lock();
        let Some(arena) = nodes.as_ref() else {
            return 0;
        };
        let mut i = 0;
        let mut current = node.0;
        while i < out.len() && current != NONE && current != StackNodeHandle::ROOT.0 {
            let n = arena.get(current);
            out[i] = n.instruction;
            i += 1;
            current = n.parent;
        }
        i
    }

    /// The function a node's return address lands in, `None` for the root or
    /// if there's no debug info for it
    pub fn get_function(&self, node: StackNodeHandle) -> Option<Symbol> {
        // Resolve without holding the lock, resolving allocates
        let instruction = self.instruction(node)?;
        self.symbols.resolve(instruction)
    }

    /// One line per frame, innermost first, `\tN/A` where we have no symbol
    pub fn format_callstack(&self, node: StackNodeHandle) -> String {
        let mut frames = [0usize; MAX_FRAMES];
        let nr_frames = self.frames(node, &mut frames);
        let mut out = String::new();
        for &instruction in &frames[..nr_frames] {
            _ = match self.symbols.resolve(instruction) {
                Some(symbol) => writeln!(out, "\t{symbol}"),
                None => writeln!(out, "\tN/A ({instruction:#x})"),
            };
        }
        out
    }

    /// Write the call stack to the debug output, one frame per line
    pub fn print_callstack(&self, node: StackNodeHandle) {
        let mut frames = [0usize; MAX_FRAMES];
        let nr_frames = self.frames(node, &mut frames);
        for &instruction in &frames[..nr_frames] {
            match self.symbols.resolve(instruction) {
                Some(symbol) => debug_println!("\t{symbol}"),
                None => debug_println!("\tN/A"),
            }
        }
    }
}

impl Drop for StackTree<'_> {
    fn drop(&mut self) {
        if self.nodes.get_mut().take().is_some() {
            self.symbols.release();
        }
    }
}

impl fmt::Debug for StackTree<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackTree")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
