//! The platform debug-information service: capturing return addresses and
//! turning them back into names. Everything that wants symbols goes through a
//! [`SymbolContext`], which owns the "is the service initialized" bookkeeping
//! that would otherwise be process-global state.

use std::{ffi::c_void, fmt, path::PathBuf};

use crate::lock::FutexMutex;

/// A resolved frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{}({}):\t{}", file.display(), line, self.name),
            (Some(file), None) => write!(f, "{}:\t{}", file.display(), self.name),
            _ => write!(f, "{}", self.name),
        }
    }
}

/// # Implementing
///
/// `capture_stack()` is called on every tracked allocation, so it must not
/// allocate through the tracked heap (or if it does, it must cope with being
/// re-entered). `resolve()` may allocate freely; it is never called with an
/// allocator lock held.
pub trait SymbolService: Send + Sync {
    /// Called when the first [`super::StackTree`] using this service comes alive
    fn initialize(&self) {}

    /// Called when the last [`super::StackTree`] using this service goes away
    fn cleanup(&self) {}

    /// Pick up modules that were loaded or unloaded since the last refresh
    fn refresh_modules(&self) {}

    /// Write the return addresses of the calling stack into `out`, innermost
    /// first. `skip` counts frames *above* `capture_stack()` itself, so
    /// `skip = 0` starts with whoever called `capture_stack()`. Returns the
    /// number of addresses written.
    fn capture_stack(&self, skip: usize, out: &mut [usize]) -> usize;

    /// Find the function/file/line for an instruction address
    fn resolve(&self, address: usize) -> Option<Symbol>;
}

/// Symbols through the `backtrace` crate (libunwind + gimli)
#[derive(Clone, Copy, Debug, Default)]
pub struct BacktraceSymbols;

impl SymbolService for BacktraceSymbols {
    fn cleanup(&self) {
        backtrace::clear_symbol_cache();
    }

    fn refresh_modules(&self) {
        // The cache holds the parsed module list, dropping it forces a re-read
        // of /proc/self/maps on the next resolve
        backtrace::clear_symbol_cache();
    }

    #[inline(never)]
    fn capture_stack(&self, skip: usize, out: &mut [usize]) -> usize {
        let this_fn = <Self as SymbolService>::capture_stack as usize;
        let mut found_self = false;
        let mut nr_skipped = 0;
        let mut nr_frames = 0;
        backtrace::trace(|frame| {
            if !found_self {
                // Everything up to and including this function is backtrace
                // machinery
                found_self = frame.symbol_address() as usize == this_fn;
                return true;
            }
            if nr_skipped < skip {
                nr_skipped += 1;
                return true;
            }
            if nr_frames == out.len() {
                return false;
            }
            out[nr_frames] = frame.ip() as usize;
            nr_frames += 1;
            true
        });
        if !found_self {
            // We never recognised our own frame (inlined, or no symbol
            // addresses on this platform). Better to hand back too much than
            // nothing.
            nr_frames = 0;
            backtrace::trace(|frame| {
                if nr_frames == out.len() {
                    return false;
                }
                out[nr_frames] = frame.ip() as usize;
                nr_frames += 1;
                true
            });
        }
        nr_frames
    }

    fn resolve(&self, address: usize) -> Option<Symbol> {
        let mut symbol = None;
        backtrace::resolve(address as *mut c_void, |s| {
            if symbol.is_some() {
                return;
            }
            let Some(name) = s.name() else {
                return;
            };
            symbol = Some(Symbol {
                name: name.to_string(),
                file: s.filename().map(|f| f.to_path_buf()),
                line: s.lineno(),
            });
        });
        symbol
    }
}

/// A symbol service plus the number of live stack trees using it. The first
/// tree to come alive initializes the service, the last to go away tears it
/// down.
pub struct SymbolContext<'a> {
    service: &'a dyn SymbolService,
    instances: FutexMutex<usize>,
}

impl<'a> SymbolContext<'a> {
    pub const fn new(service: &'a dyn SymbolService) -> Self {
        Self {
            service,
            instances: FutexMutex::new(0),
        }
    }

    pub fn service(&self) -> &'a dyn SymbolService {
        self.service
    }

    /// Number of stack trees currently holding the service
    pub fn instances(&self) -> usize {
        *self.instances.lock()
    }

    pub(crate) fn acquire(&self) {
        let mut instances = self.instances.lock();
        if *instances == 0 {
            self.service.initialize();
        }
        *instances += 1;
    }

    pub(crate) fn release(&self) {
        let mut instances = self.instances.lock();
        debug_assert!(*instances > 0);
        *instances = instances.saturating_sub(1);
        if *instances == 0 {
            self.service.cleanup();
        }
    }

    /// Must be called after a dynamic library is loaded or unloaded.
    pub fn refresh_module_list(&self) {
        debug_assert!(self.instances() > 0, "no stack tree is using this context");
        self.service.refresh_modules();
    }

    /// Bring the service up on a thread that is handling a fault. Doesn't
    /// touch the instance lock, the faulting thread might be holding it.
    pub(crate) fn reinitialize_for_crash(&self) {
        self.service.initialize();
        self.service.refresh_modules();
    }

    pub fn resolve(&self, address: usize) -> Option<Symbol> {
        self.service.resolve(address)
    }
}

impl fmt::Debug for SymbolContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolContext")
            .field("instances", &*self.instances.lock())
            .finish_non_exhaustive()
    }
}
