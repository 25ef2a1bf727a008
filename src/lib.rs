//! A debug heap for tracking down memory bugs.
//!
//! - [`alloc::TrackingAllocator`] puts guard values around every allocation,
//!   fills fresh and freed memory with recognisable patterns, remembers who
//!   allocated what, and reports stomps and leaks.
//! - [`alloc::GuardAllocator`] puts every allocation right up against an
//!   inaccessible page, so an overrun faults on the spot.
//! - [`stack::StackTree`] stores call stacks as a shared trie.
//! - [`crash`] turns fatal signals into a readable report and dump files.

pub mod alloc;
pub mod arch;
pub mod crash;
pub mod externc;
pub mod lock;
pub mod os;
pub mod profiler;
pub mod stack;
pub mod util;

pub use crate::{
    alloc::{
        AllocError, DlmallocSource, GuardAllocator, SystemSource, TagScope, TrackingAllocator,
        TrackingConfig,
    },
    crash::{CrashConfig, CrashReporter},
    profiler::ProfileScope,
    stack::{BacktraceSymbols, StackNodeHandle, StackTree, SymbolContext},
};
