//! The debug heap.
//!
//! Every allocation gets an [`AllocationInfo`] header, optional guard values
//! on both sides, and the call stack that made it. Live allocations are kept
//! in a list so they can be checked for stomps at any point
//! ([`TrackingAllocator::check_guards`]) and reported if they're still
//! around at the end ([`TrackingAllocator::check_leaks`]).
//!
//! The allocator can be the process allocator:
//!
//! ```no_run
//! use debugheap::{
//!     alloc::{SystemSource, TrackingAllocator},
//!     stack::{BacktraceSymbols, SymbolContext},
//! };
//!
//! static SYMBOLS: SymbolContext<'static> = SymbolContext::new(&BacktraceSymbols);
//!
//! #[global_allocator]
//! static HEAP: TrackingAllocator<'static, SystemSource> =
//!     TrackingAllocator::new(SystemSource, &SYMBOLS);
//! ```
//!
//! Recording a stack or building a report can itself allocate. Anything
//! allocated on a thread that is already inside the tracker still gets a
//! header and guards, but skips the stack and the list, so the tracker never
//! waits on itself. The list lock is only ever held from inside, which keeps
//! that true for a fault under the lock: the crash path can still allocate.

use std::{
    alloc::{GlobalAlloc, Layout},
    cell::Cell,
    fmt,
    ptr::{self, NonNull},
    str::FromStr,
    sync::atomic::{AtomicUsize, Ordering},
};

use thiserror::Error;

use super::{
    meta::{
        guards_intact, header_size, AllocationInfo, BlockLayout, ALLOCATION_GUARD,
        FREED_MEMORY_PATTERN, UNINITIALIZED_MEMORY_PATTERN,
    },
    registry::Registry,
    report::{AllocationRecord, GuardReport, GuardViolation, LeakReport},
    tag, AllocError, SourceAllocator,
};
use crate::{
    debug_println,
    lock::{FutexMutex, FutexMutexGuard},
    stack::{StackNodeHandle, StackTree, SymbolContext},
    util::{env, hint::cold, print::debug_break},
};

thread_local! {
    static IN_TRACKER: Cell<bool> = const { Cell::new(false) };
}

/// Marks this thread as busy inside the tracker until dropped. Every tracker
/// in the process leaves this thread's allocations off its list meanwhile.
pub(crate) struct ReentrancyGuard(());

impl ReentrancyGuard {
    /// `None` if the thread is already inside (or is so far into exiting that
    /// its thread locals are gone)
    pub(crate) fn enter() -> Option<Self> {
        match IN_TRACKER.try_with(|busy| busy.replace(true)) {
            Ok(false) => Some(Self(())),
            _ => None,
        }
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        _ = IN_TRACKER.try_with(|busy| busy.set(false));
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown policy {value:?}, expected one of {expected}")]
pub struct ParsePolicyError {
    value: String,
    expected: &'static str,
}

/// What `deallocate()` does about a block with broken guards. Scans always
/// report and carry on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CorruptionPolicy {
    /// Report, then abort the process
    #[default]
    Abort,
    /// Report, then free the block anyway
    Report,
}

impl FromStr for CorruptionPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "report" => Ok(Self::Report),
            _ => Err(ParsePolicyError {
                value: s.to_owned(),
                expected: "abort, report",
            }),
        }
    }
}

/// What `check_leaks()` does once it has reported
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LeakPolicy {
    /// Stop in the debugger (or die of `SIGTRAP` without one)
    #[default]
    Break,
    Report,
}

impl FromStr for LeakPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "break" => Ok(Self::Break),
            "report" => Ok(Self::Report),
            _ => Err(ParsePolicyError {
                value: s.to_owned(),
                expected: "break, report",
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackingConfig {
    /// Fill fresh memory with `0xCD` and freed memory with `0xDD`
    pub fill: bool,
    /// Surround every allocation with guard values
    pub guards: bool,
    pub on_corrupt_free: CorruptionPolicy,
    pub on_leak: LeakPolicy,
}

impl TrackingConfig {
    pub const DEFAULT: Self = Self {
        fill: true,
        guards: true,
        on_corrupt_free: CorruptionPolicy::Abort,
        on_leak: LeakPolicy::Break,
    };

    pub const fn with_fill(mut self, fill: bool) -> Self {
        self.fill = fill;
        self
    }

    pub const fn with_guards(mut self, guards: bool) -> Self {
        self.guards = guards;
        self
    }

    pub const fn with_corruption_policy(mut self, policy: CorruptionPolicy) -> Self {
        self.on_corrupt_free = policy;
        self
    }

    pub const fn with_leak_policy(mut self, policy: LeakPolicy) -> Self {
        self.on_leak = policy;
        self
    }

    /// [`TrackingConfig::DEFAULT`], overridden by `DEBUGHEAP_FILL`,
    /// `DEBUGHEAP_GUARDS`, `DEBUGHEAP_ON_CORRUPTION` (`abort`|`report`) and
    /// `DEBUGHEAP_ON_LEAK` (`break`|`report`)
    pub fn from_env() -> Self {
        let mut config = Self::DEFAULT;
        if let Some(fill) = env::flag("DEBUGHEAP_FILL") {
            config.fill = fill;
        }
        if let Some(guards) = env::flag("DEBUGHEAP_GUARDS") {
            config.guards = guards;
        }
        if let Some(policy) = env::parse("DEBUGHEAP_ON_CORRUPTION") {
            config.on_corrupt_free = policy;
        }
        if let Some(policy) = env::parse("DEBUGHEAP_ON_LEAK") {
            config.on_leak = policy;
        }
        config
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// See the module docs. `S` is where the raw blocks come from.
pub struct TrackingAllocator<'a, S: SourceAllocator> {
    source: S,
    stack_tree: StackTree<'a>,
    registry: FutexMutex<Registry>,
    config: TrackingConfig,
    corrupted_frees: AtomicUsize,
}

impl<'a, S: SourceAllocator> TrackingAllocator<'a, S> {
    pub const fn new(source: S, symbols: &'a SymbolContext<'a>) -> Self {
        Self::with_config(source, symbols, TrackingConfig::DEFAULT)
    }

    pub const fn with_config(
        source: S,
        symbols: &'a SymbolContext<'a>,
        config: TrackingConfig,
    ) -> Self {
        Self {
            source,
            stack_tree: StackTree::new(symbols),
            registry: FutexMutex::new(Registry::new()),
            config,
            corrupted_frees: AtomicUsize::new(0),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn stack_tree(&self) -> &StackTree<'a> {
        &self.stack_tree
    }

    pub fn config(&self) -> TrackingConfig {
        self.config
    }

    pub fn are_guards_enabled(&self) -> bool {
        self.config.guards
    }

    pub fn is_fill_enabled(&self) -> bool {
        self.config.fill
    }

    /// Bytes in live allocations (external records not included)
    pub fn total_size(&self) -> usize {
        self.lock().total_size()
    }

    /// Number of records in the live list, external ones included
    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    /// How many blocks `deallocate()` found with broken guards
    pub fn corrupted_frees(&self) -> usize {
        self.corrupted_frees.load(Ordering::Relaxed)
    }

    fn user_of(&self, info: &AllocationInfo) -> NonNull<u8> {
        // SAFETY: the header sits `header_size()` bytes in front of its user
        // pointer, inside the same block
        unsafe {
            NonNull::from(info)
                .cast::<u8>()
                .add(header_size(self.config.guards))
        }
    }

    fn record_of(&self, info: &AllocationInfo) -> AllocationRecord {
        let address = if info.is_external() {
            info as *const AllocationInfo as usize
        } else {
            self.user_of(info).as_ptr() as usize
        };
        AllocationRecord::new(info, address)
    }

    /// `align` is a power of two, or 0 for the default (8). `size` can't be
    /// 0.
    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let guards = self.config.guards;
        let layout = BlockLayout::new(size, align, guards)?;
        let base = self.source.allocate(layout.source)?;
        // SAFETY: `base` is a fresh block of `layout.source`
        let user = unsafe { layout.user(base) };
        let info = unsafe { BlockLayout::info(guards, user) };

        let reentrancy = ReentrancyGuard::enter();
        let mut header = AllocationInfo::new(size, align, tag::active());
        match reentrancy {
            Some(_) => header.stack = self.stack_tree.record(),
            None => header.flags |= AllocationInfo::UNLINKED,
        }

        // SAFETY: the header slot, the user region and both guards are all
        // inside the block. The header slot is 8-aligned because the user
        // pointer and `header_size()` both are.
        unsafe {
            info.as_ptr().write(header);
            if self.config.fill {
                user.as_ptr().write_bytes(UNINITIALIZED_MEMORY_PATTERN, size);
            }
            if guards {
                BlockLayout::front_guard(user).write_unaligned(ALLOCATION_GUARD);
                BlockLayout::back_guard(user, size).write_unaligned(ALLOCATION_GUARD);
            }
        }

        if reentrancy.is_some() {
            // SAFETY: the header is new, and lives until `deallocate()`
            unsafe { self.registry.lock().insert(info) };
        }
        Ok(user)
    }

    /// Null is fine and does nothing.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer from [`Self::allocate`] (or
    /// [`Self::reallocate`]) on this allocator, and must not be used
    /// afterwards.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        let Some(user) = NonNull::new(ptr) else {
            return;
        };
        let guards = self.config.guards;
        // SAFETY: caller guarantees this is one of our live blocks
        let info = unsafe { BlockLayout::info(guards, user) };
        let header = unsafe { info.as_ref() };
        debug_assert!(!header.is_external(), "external records aren't ours to free");
        let (size, align, linked) = (header.size, header.align, header.is_linked());

        if guards {
            // SAFETY: live guarded block of `size` bytes
            let (front_intact, back_intact) = unsafe { guards_intact(user, size) };
            if !(front_intact && back_intact) {
                cold(|| {
                    self.corrupted_frees.fetch_add(1, Ordering::Relaxed);
                    let violation = GuardViolation {
                        allocation: self.record_of(header),
                        front_intact,
                        back_intact,
                    };
                    self.report_corruption(&violation);
                    if self.config.on_corrupt_free == CorruptionPolicy::Abort {
                        debug_println!("debugheap: aborting on corrupted free");
                        std::process::abort();
                    }
                });
            }
        }

        let layout = match BlockLayout::new(size, align, guards) {
            Ok(layout) => layout,
            Err(e) => {
                // Only possible if the header itself was overwritten. Leak
                // the block rather than hand the source a bogus layout.
                debug_println!("debugheap: corrupted header at {:p}: {e}", info.as_ptr());
                return;
            }
        };

        if self.config.fill {
            // SAFETY: the user region is ours until we free it below
            unsafe { user.as_ptr().write_bytes(FREED_MEMORY_PATTERN, size) };
        }
        if linked {
            // SAFETY: linked headers are in our list
            unsafe { self.lock().registry.remove(info) };
        }
        // SAFETY: same block, same layout as `allocate()` asked for
        unsafe { self.source.deallocate(layout.base(user), layout.source) };
    }

    /// Always moves: allocates a new block, copies
    /// `min(old size, new_size)` bytes and frees the old one. A null `ptr`
    /// is an `allocate()`, a `new_size` of 0 is a `deallocate()` and gives
    /// back `None`. If the new block can't be had the old one is untouched.
    ///
    /// `old_size` is what the caller believes the size to be. The copy uses
    /// the size in the header.
    ///
    /// # Safety
    ///
    /// As for [`Self::deallocate`]
    pub unsafe fn reallocate(
        &self,
        ptr: *mut u8,
        new_size: usize,
        old_size: usize,
        align: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(user) = NonNull::new(ptr) else {
            return self.allocate(new_size, align).map(Some);
        };
        if new_size == 0 {
            unsafe { self.deallocate(ptr) };
            return Ok(None);
        }
        let new = self.allocate(new_size, align)?;
        // SAFETY: caller guarantees `ptr` is one of our live blocks
        let size = unsafe { BlockLayout::info(self.config.guards, user).as_ref().size };
        debug_assert!(old_size == 0 || old_size == size, "reallocate(): size mismatch");
        unsafe {
            ptr::copy_nonoverlapping(user.as_ptr(), new.as_ptr(), size.min(new_size));
            self.deallocate(ptr);
        }
        Ok(Some(new))
    }

    /// Check the guards of every live allocation. Every broken one is
    /// reported (with the stack that allocated it) and the scan carries on.
    /// Does nothing when guards are off.
    pub fn check_guards(&self) -> GuardReport {
        if !self.config.guards {
            return GuardReport::default();
        }
        let report = {
            let _reentrancy = ReentrancyGuard::enter();
            let registry = self.registry.lock();
            let mut report = GuardReport::default();
            for info in registry.iter().filter(|info| !info.is_external()) {
                report.checked += 1;
                // SAFETY: owned, linked, so a live guarded block
                let (front_intact, back_intact) =
                    unsafe { guards_intact(self.user_of(info), info.size) };
                if !(front_intact && back_intact) {
                    report.violations.push(GuardViolation {
                        allocation: self.record_of(info),
                        front_intact,
                        back_intact,
                    });
                }
            }
            report
        };
        for violation in &report.violations {
            self.report_corruption(violation);
        }
        report
    }

    fn report_corruption(&self, violation: &GuardViolation) {
        let allocation = &violation.allocation;
        let side = match (violation.front_intact, violation.back_intact) {
            (false, false) => "both sides of",
            (false, true) => "just before",
            _ => "just past",
        };
        log::error!(
            "Memory was overwritten {side} allocation {:#x} ({} bytes, tag {:?})",
            allocation.address,
            allocation.size,
            allocation.tag,
        );
        self.stack_tree.print_callstack(allocation.stack);
    }

    /// Report every allocation that is still alive, then act on
    /// [`TrackingConfig::on_leak`]. Runs on drop, but a global allocator is
    /// never dropped, so call it at the end of `main()` there.
    pub fn check_leaks(&self) -> LeakReport {
        let report = {
            let _reentrancy = ReentrancyGuard::enter();
            let registry = self.registry.lock();
            LeakReport {
                leaks: registry.iter().map(|info| self.record_of(info)).collect(),
            }
        };
        if report.is_empty() {
            return report;
        }

        log::error!(
            "Memory leaks detected! {} allocations, {} bytes",
            report.len(),
            report.total_bytes()
        );
        for leak in &report.leaks {
            log::error!(
                "Allocation size: {}, memory: {:#x}, tag: {:?}",
                leak.size,
                leak.address,
                leak.tag
            );
            self.stack_tree.print_callstack(leak.stack);
        }
        if self.config.on_leak == LeakPolicy::Break {
            debug_break();
        }
        report
    }

    /// Put memory we didn't allocate on the live list, so it shows up in
    /// leak reports. Guard checks skip it.
    ///
    /// # Safety
    ///
    /// `info` must stay valid and in place until passed to
    /// [`Self::unregister_external`], and must not already be registered.
    pub unsafe fn register_external(&self, mut info: NonNull<AllocationInfo>) {
        let reentrancy = ReentrancyGuard::enter();
        // SAFETY: caller guarantees `info` is valid and not shared
        let header = unsafe { info.as_mut() };
        header.flags = (header.flags | AllocationInfo::EXTERNAL) & !AllocationInfo::UNLINKED;
        header.stack = match reentrancy {
            Some(_) => self.stack_tree.record(),
            None => StackNodeHandle::ROOT,
        };
        unsafe { self.registry.lock().insert(info) };
    }

    /// # Safety
    ///
    /// `info` must have been passed to [`Self::register_external`] on this
    /// allocator, and not unregistered since.
    pub unsafe fn unregister_external(&self, info: NonNull<AllocationInfo>) {
        unsafe { self.lock().registry.remove(info) };
    }

    /// Metadata of a live allocation, by user pointer. `None` if `ptr` isn't
    /// one (this walks the list, it never reads through `ptr`).
    pub fn allocation_info(&self, ptr: *const u8) -> Option<AllocationRecord> {
        let _reentrancy = ReentrancyGuard::enter();
        let registry = self.registry.lock();
        let info = registry
            .iter()
            .filter(|info| !info.is_external())
            .find(|info| self.user_of(info).as_ptr() as *const u8 == ptr)?;
        Some(self.record_of(info))
    }

    /// Hold the registry lock. Nothing can be allocated into or freed from
    /// the list until the guard drops; allocations made on this thread in the
    /// meantime are left off the list.
    pub fn lock(&self) -> RegistryLock<'_, 'a, S> {
        let reentrancy = ReentrancyGuard::enter();
        RegistryLock {
            registry: self.registry.lock(),
            tracker: self,
            _reentrancy: reentrancy,
        }
    }
}

impl<S: SourceAllocator> Drop for TrackingAllocator<'_, S> {
    fn drop(&mut self) {
        self.check_leaks();
    }
}

impl<S: SourceAllocator> fmt::Debug for TrackingAllocator<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingAllocator")
            .field("config", &self.config)
            .field("stack_tree", &self.stack_tree)
            .finish_non_exhaustive()
    }
}

/// See [`TrackingAllocator::lock`]
pub struct RegistryLock<'t, 'a, S: SourceAllocator> {
    registry: FutexMutexGuard<'t, Registry>,
    tracker: &'t TrackingAllocator<'a, S>,
    _reentrancy: Option<ReentrancyGuard>,
}

impl<S: SourceAllocator> RegistryLock<'_, '_, S> {
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn total_size(&self) -> usize {
        self.registry.total_size()
    }

    /// Newest first
    pub fn for_each(&self, mut f: impl FnMut(AllocationRecord)) {
        for info in self.registry.iter() {
            f(self.tracker.record_of(info));
        }
    }
}

// SAFETY: `allocate()` hands out `layout.size()` bytes aligned to at least
// `layout.align()`, and `deallocate()` ignores the layout
unsafe impl<S: SourceAllocator> GlobalAlloc for TrackingAllocator<'_, S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.allocate(layout.size().max(1), layout.align()) {
            Ok(data) => data.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _: Layout) {
        // SAFETY: identical contract
        unsafe { self.deallocate(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: identical contract
        match unsafe { self.reallocate(ptr, new_size.max(1), layout.size(), layout.align()) } {
            Ok(Some(data)) => data.as_ptr(),
            _ => ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        alloc::{guard::GuardAllocator, meta::MIN_ALIGN, SystemSource, TagScope},
        stack::tests::FakeSymbols,
    };

    const QUIET: TrackingConfig = TrackingConfig::DEFAULT
        .with_corruption_policy(CorruptionPolicy::Report)
        .with_leak_policy(LeakPolicy::Report);

    fn init_logging() {
        _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn pointers_are_aligned_and_writable_to_the_last_byte() {
        let fake = FakeSymbols::default();
        let ctx = SymbolContext::new(&fake);
        let tracker = TrackingAllocator::with_config(SystemSource, &ctx, QUIET);
        for size in [1, 3, 8, 100, 4096] {
            for align in [0, 1, 2, 8, 16, 64, 4096] {
                let p = tracker.allocate(size, align).unwrap();
                assert_eq!(p.as_ptr() as usize % align.max(MIN_ALIGN), 0);
                unsafe { p.as_ptr().write_bytes(0x42, size) };
                assert!(tracker.check_guards().is_clean(), "size {size} align {align}");
                unsafe { tracker.deallocate(p.as_ptr()) };
            }
        }
    }

    #[test]
    fn allocate_then_free_leaves_totals_unchanged() {
        let fake = FakeSymbols::default();
        let ctx = SymbolContext::new(&fake);
        let tracker = TrackingAllocator::with_config(SystemSource, &ctx, QUIET);
        let keep = tracker.allocate(10, 0).unwrap();
        let (count, total) = (tracker.live_count(), tracker.total_size());
        assert_eq!((count, total), (1, 10));

        let p = tracker.allocate(123, 16).unwrap();
        assert_eq!(tracker.live_count(), 2);
        assert_eq!(tracker.total_size(), 133);
        unsafe { tracker.deallocate(p.as_ptr()) };
        assert_eq!((tracker.live_count(), tracker.total_size()), (count, total));

        unsafe { tracker.deallocate(keep.as_ptr()) };
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn null_and_bad_requests() {
        let fake = FakeSymbols::default();
        let ctx = SymbolContext::new(&fake);
        let tracker = TrackingAllocator::with_config(SystemSource, &ctx, QUIET);
        unsafe { tracker.deallocate(ptr::null_mut()) };
        assert_eq!(
            tracker.allocate(0, 8),
            Err(AllocError::InvalidLayout { size: 0, align: 8 })
        );
        assert!(matches!(
            tracker.allocate(8, 24),
            Err(AllocError::InvalidLayout { .. })
        ));
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn repeated_scans_agree() {
        init_logging();
        let fake = FakeSymbols::default();
        let ctx = SymbolContext::new(&fake);
        let tracker = TrackingAllocator::with_config(SystemSource, &ctx, QUIET);
        let a = tracker.allocate(16, 0).unwrap();
        let b = tracker.allocate(16, 0).unwrap();
        unsafe { b.as_ptr().add(16).write(0) };
        let first = tracker.check_guards();
        let second = tracker.check_guards();
        assert_eq!(first, second);
        assert_eq!(first.checked, 2);
        assert_eq!(first.violations.len(), 1);
        unsafe {
            tracker.deallocate(a.as_ptr());
            tracker.deallocate(b.as_ptr());
        }
    }

    #[test]
    fn stomps_on_either_side_are_caught() {
        init_logging();
        let fake = FakeSymbols::default();
        let ctx = SymbolContext::new(&fake);
        let tracker = TrackingAllocator::with_config(SystemSource, &ctx, QUIET);
        let size = 24;
        let before = tracker.allocate(size, 0).unwrap();
        let after = tracker.allocate(size, 0).unwrap();
        let clean = tracker.allocate(size, 0).unwrap();
        unsafe {
            before.as_ptr().sub(1).write(0);
            after.as_ptr().add(size).write(0);
        }

        let report = tracker.check_guards();
        assert_eq!(report.violations.len(), 2);
        let v = report.find(before.as_ptr() as usize).unwrap();
        assert!(!v.front_intact && v.back_intact);
        assert_eq!(v.allocation.size, size);
        let v = report.find(after.as_ptr() as usize).unwrap();
        assert!(v.front_intact && !v.back_intact);
        assert!(report.find(clean.as_ptr() as usize).is_none());

        // `Report` frees them anyway
        assert_eq!(tracker.corrupted_frees(), 0);
        unsafe {
            tracker.deallocate(before.as_ptr());
            tracker.deallocate(after.as_ptr());
            tracker.deallocate(clean.as_ptr());
        }
        assert_eq!(tracker.corrupted_frees(), 2);
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn leaks_are_listed_with_their_stacks() {
        init_logging();
        let fake = FakeSymbols::default();
        let ctx = SymbolContext::new(&fake);
        let tracker = TrackingAllocator::with_config(SystemSource, &ctx, QUIET);
        FakeSymbols::script(&[0x1100, 0x1200, 0x1300]);
        let sizes = [8, 16, 24, 1000];
        let ptrs: Vec<_> = sizes
            .iter()
            .map(|&size| tracker.allocate(size, 0).unwrap())
            .collect();

        let report = tracker.check_leaks();
        assert_eq!(report.len(), sizes.len());
        let mut leaked: Vec<usize> = report.leaks.iter().map(|l| l.size).collect();
        leaked.sort_unstable();
        assert_eq!(leaked, sizes);
        assert!(report.leaks.iter().all(|l| !l.stack.is_root()));
        assert_eq!(report.by_site().len(), 1);
        let leaf = report.leaks[0].stack;
        assert_eq!(tracker.stack_tree().instruction(leaf), Some(0x1100));

        for p in ptrs {
            unsafe { tracker.deallocate(p.as_ptr()) };
        }
        assert!(tracker.check_leaks().is_empty());
    }

    /// Keeps a copy of the last block handed back to it
    #[derive(Default)]
    struct RecordingSource {
        last_freed: Mutex<Vec<u8>>,
    }

    unsafe impl SourceAllocator for RecordingSource {
        fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
            SystemSource.allocate(layout)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), layout.size()) };
            *self.last_freed.lock().unwrap() = bytes.to_vec();
            unsafe { SystemSource.deallocate(ptr, layout) }
        }
    }

    #[test]
    fn fill_patterns_are_visible() {
        let fake = FakeSymbols::default();
        let ctx = SymbolContext::new(&fake);
        let tracker = TrackingAllocator::with_config(RecordingSource::default(), &ctx, QUIET);
        let size = 40;
        let p = tracker.allocate(size, 0).unwrap();
        let fresh = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) };
        assert!(fresh.iter().all(|&b| b == UNINITIALIZED_MEMORY_PATTERN));
        unsafe { tracker.deallocate(p.as_ptr()) };

        let offset = BlockLayout::new(size, 0, true).unwrap().offset;
        let freed = tracker.source().last_freed.lock().unwrap().clone();
        assert!(freed[offset..offset + size]
            .iter()
            .all(|&b| b == FREED_MEMORY_PATTERN));
        let guard = ALLOCATION_GUARD.to_ne_bytes();
        assert_eq!(freed[offset - 4..offset], guard);
        assert_eq!(freed[offset + size..offset + size + 4], guard);
    }

    #[test]
    fn fill_and_guards_can_be_switched_off() {
        let fake = FakeSymbols::default();
        let ctx = SymbolContext::new(&fake);
        let config = QUIET.with_fill(false).with_guards(false);
        let tracker = TrackingAllocator::with_config(RecordingSource::default(), &ctx, config);
        assert!(!tracker.are_guards_enabled() && !tracker.is_fill_enabled());
        let p = tracker.allocate(16, 0).unwrap();
        unsafe {
            p.as_ptr().write_bytes(0x77, 16);
            p.as_ptr().add(16).write(0);
        }
        assert_eq!(tracker.check_guards(), GuardReport::default());
        unsafe { tracker.deallocate(p.as_ptr()) };
        let offset = BlockLayout::new(16, 0, false).unwrap().offset;
        let freed = tracker.source().last_freed.lock().unwrap().clone();
        assert!(freed[offset..offset + 16].iter().all(|&b| b == 0x77));
    }

    #[test]
    fn reallocate_moves_and_copies() {
        let fake = FakeSymbols::default();
        let ctx = SymbolContext::new(&fake);
        let tracker = TrackingAllocator::with_config(SystemSource, &ctx, QUIET);
        unsafe {
            let p = tracker.reallocate(ptr::null_mut(), 4, 0, 0).unwrap().unwrap();
            p.as_ptr().copy_from_nonoverlapping([1u8, 2, 3, 4].as_ptr(), 4);

            let grown = tracker.reallocate(p.as_ptr(), 8, 4, 0).unwrap().unwrap();
            assert_ne!(grown, p);
            assert_eq!(std::slice::from_raw_parts(grown.as_ptr(), 4), [1, 2, 3, 4]);
            assert_eq!(grown.as_ptr().add(4).read(), UNINITIALIZED_MEMORY_PATTERN);

            let shrunk = tracker.reallocate(grown.as_ptr(), 2, 8, 0).unwrap().unwrap();
            assert_eq!(std::slice::from_raw_parts(shrunk.as_ptr(), 2), [1, 2]);
            assert_eq!((tracker.live_count(), tracker.total_size()), (1, 2));

            assert_eq!(tracker.reallocate(shrunk.as_ptr(), 0, 2, 0), Ok(None));
        }
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn external_memory_is_tracked_but_not_checked() {
        init_logging();
        let fake = FakeSymbols::default();
        let ctx = SymbolContext::new(&fake);
        let tracker = TrackingAllocator::with_config(SystemSource, &ctx, QUIET);
        let mut info = AllocationInfo::external(4096, Some("driver"));
        let info_ptr = NonNull::from(&mut info);
        unsafe { tracker.register_external(info_ptr) };

        assert_eq!(tracker.live_count(), 1);
        assert_eq!(tracker.total_size(), 0);
        let report = tracker.check_guards();
        assert_eq!(report.checked, 0);
        assert!(report.is_clean());
        let leaks = tracker.check_leaks();
        assert_eq!(leaks.len(), 1);
        assert!(leaks.leaks[0].external);
        assert_eq!(leaks.leaks[0].size, 4096);
        assert_eq!(leaks.leaks[0].tag, Some("driver"));

        unsafe { tracker.unregister_external(info_ptr) };
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn lookups_see_tags_and_sizes() {
        let fake = FakeSymbols::default();
        let ctx = SymbolContext::new(&fake);
        let tracker = TrackingAllocator::with_config(SystemSource, &ctx, QUIET);
        let p = {
            let _tag = TagScope::new("physics");
            tracker.allocate(48, 16).unwrap()
        };
        let q = tracker.allocate(8, 0).unwrap();
        let info = tracker.allocation_info(p.as_ptr()).unwrap();
        assert_eq!((info.size, info.align, info.tag), (48, 16, Some("physics")));
        assert_eq!(tracker.allocation_info(q.as_ptr()).unwrap().tag, None);
        assert_eq!(tracker.allocation_info(ptr::null()), None);
        unsafe {
            tracker.deallocate(p.as_ptr());
            tracker.deallocate(q.as_ptr());
        }
        assert_eq!(tracker.allocation_info(p.as_ptr()), None);
    }

    #[test]
    fn allocating_under_the_lock_does_not_deadlock() {
        let fake = FakeSymbols::default();
        let ctx = SymbolContext::new(&fake);
        let tracker = TrackingAllocator::with_config(SystemSource, &ctx, QUIET);
        let p = tracker.allocate(8, 0).unwrap();
        let mut nested = None;
        {
            let lock = tracker.lock();
            lock.for_each(|record| {
                assert_eq!(record.size, 8);
                nested = Some(tracker.allocate(32, 0).unwrap());
            });
            assert_eq!(lock.len(), 1);
        }
        let nested = nested.unwrap();
        assert_eq!(tracker.live_count(), 1);
        assert_eq!(tracker.allocation_info(nested.as_ptr()), None);
        unsafe {
            tracker.deallocate(nested.as_ptr());
            tracker.deallocate(p.as_ptr());
        }
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn guard_pages_as_the_source() {
        let fake = FakeSymbols::default();
        let ctx = SymbolContext::new(&fake);
        let tracker = TrackingAllocator::with_config(GuardAllocator::new(), &ctx, QUIET);
        let p = tracker.allocate(100, 0).unwrap();
        unsafe { p.as_ptr().write_bytes(1, 100) };
        assert!(tracker.check_guards().is_clean());
        unsafe { tracker.deallocate(p.as_ptr()) };
    }

    #[test]
    fn global_alloc_round_trip() {
        let fake = FakeSymbols::default();
        let ctx = SymbolContext::new(&fake);
        let tracker = TrackingAllocator::with_config(SystemSource, &ctx, QUIET);
        unsafe {
            let layout = Layout::from_size_align(24, 8).unwrap();
            let p = tracker.alloc(layout);
            assert!(!p.is_null());
            let p = tracker.realloc(p, layout, 100);
            assert!(!p.is_null());
            assert_eq!(tracker.total_size(), 100);
            tracker.dealloc(p, Layout::from_size_align(100, 8).unwrap());
        }
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn policies_parse() {
        assert_eq!("abort".parse(), Ok(CorruptionPolicy::Abort));
        assert_eq!("Report".parse(), Ok(CorruptionPolicy::Report));
        assert_eq!("BREAK".parse(), Ok(LeakPolicy::Break));
        assert!("explode".parse::<LeakPolicy>().is_err());
        assert_eq!(TrackingConfig::default(), TrackingConfig::DEFAULT);
    }
}
