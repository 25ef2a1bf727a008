//! The C ABI. Return codes are `0` for success and `-1` for failure, the
//! reason is logged.

use std::ptr;

use libc::{c_int, c_void, size_t};

use crate::{
    alloc::{dlmalloc::DlmallocSource, LeakPolicy, TrackingAllocator, TrackingConfig},
    arch::fpu,
    crash::{self, watchpoint},
    stack::symbols::{BacktraceSymbols, SymbolContext},
};

static SYMBOLS: SymbolContext<'static> = SymbolContext::new(&BacktraceSymbols);

/// Leaks are reported and counted by [`debugheap_check_leaks`], what happens
/// next is up to the caller
#[no_mangle]
pub static DEBUGHEAP: TrackingAllocator<'static, DlmallocSource> = TrackingAllocator::with_config(
    DlmallocSource::new(),
    &SYMBOLS,
    TrackingConfig::DEFAULT.with_leak_policy(LeakPolicy::Report),
);

/// `align` of 0 means the default alignment. Null on failure.
#[no_mangle]
pub extern "C" fn debugheap_malloc(size: size_t, align: size_t) -> *mut c_void {
    match DEBUGHEAP.allocate(size, align) {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(e) => {
            log::warn!("debugheap_malloc({size}, {align}): {e}");
            ptr::null_mut()
        }
    }
}

/// # Safety
///
/// `ptr` must be null or come from [`debugheap_malloc`]/[`debugheap_realloc`]
#[no_mangle]
pub unsafe extern "C" fn debugheap_free(ptr: *mut c_void) {
    unsafe { DEBUGHEAP.deallocate(ptr.cast()) }
}

/// # Safety
///
/// As [`debugheap_free`], and `old_size` must be the size `ptr` was allocated
/// with
#[no_mangle]
pub unsafe extern "C" fn debugheap_realloc(
    ptr: *mut c_void,
    new_size: size_t,
    old_size: size_t,
    align: size_t,
) -> *mut c_void {
    match unsafe { DEBUGHEAP.reallocate(ptr.cast(), new_size, old_size, align) } {
        Ok(Some(ptr)) => ptr.as_ptr().cast(),
        Ok(None) => ptr::null_mut(),
        Err(e) => {
            log::warn!("debugheap_realloc({new_size}, {align}): {e}");
            ptr::null_mut()
        }
    }
}

/// Verify the guards of every live [`DEBUGHEAP`] allocation. Returns the
/// number of corrupted allocations.
#[no_mangle]
pub extern "C" fn debugheap_check_guards() -> size_t {
    DEBUGHEAP.check_guards().violations.len()
}

/// Report every live [`DEBUGHEAP`] allocation. Returns how many there are.
/// [`DEBUGHEAP`] is never dropped, so call this on the way out.
#[no_mangle]
pub extern "C" fn debugheap_check_leaks() -> size_t {
    DEBUGHEAP.check_leaks().len()
}

#[no_mangle]
pub extern "C" fn debugheap_enable_crash_reporting(enable: bool) {
    crash::global().set_enabled(enable);
}

#[no_mangle]
pub extern "C" fn debugheap_install_crash_handler() -> c_int {
    match crash::global().install() {
        Ok(()) => 0,
        Err(e) => {
            log::error!("could not install the crash handler: {e}");
            -1
        }
    }
}

#[no_mangle]
pub extern "C" fn debugheap_set_hardware_watchpoint(
    slot: u32,
    address: *const c_void,
    size: u32,
) -> c_int {
    match watchpoint::set_hardware_watchpoint(slot as usize, address as usize, size as usize) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

#[no_mangle]
pub extern "C" fn debugheap_clear_hardware_watchpoint(slot: u32) -> c_int {
    match watchpoint::clear_hardware_watchpoint(slot as usize) {
        Ok(()) => 0,
        Err(e) => {
            log::warn!("could not clear watchpoint slot {slot}: {e}");
            -1
        }
    }
}

/// `false` if this architecture has no way to trap
#[no_mangle]
pub extern "C" fn debugheap_enable_floating_point_traps(enable: bool) -> bool {
    fpu::enable_floating_point_traps(enable)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// The tests share [`DEBUGHEAP`] and count what's in it
    static SERIAL: Mutex<()> = Mutex::new(());

    #[test]
    fn malloc_free_through_the_c_abi() {
        let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let live = DEBUGHEAP.live_count();
        let p = debugheap_malloc(24, 16);
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0);
        unsafe { p.cast::<u8>().write_bytes(1, 24) };

        let q = unsafe { debugheap_realloc(p, 48, 24, 16) };
        assert!(!q.is_null());
        assert_eq!(unsafe { *q.cast::<u8>().add(23) }, 1);
        assert_eq!(debugheap_check_guards(), 0);

        unsafe { debugheap_free(q) };
        unsafe { debugheap_free(ptr::null_mut()) };
        assert_eq!(DEBUGHEAP.live_count(), live);
        assert!(debugheap_malloc(0, 0).is_null());
    }

    #[test]
    fn leaks_are_counted_for_c_callers() {
        let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let before = debugheap_check_leaks();
        let p = debugheap_malloc(32, 0);
        let q = debugheap_malloc(8, 0);
        assert_eq!(debugheap_check_leaks(), before + 2);
        unsafe { debugheap_free(p) };
        assert_eq!(debugheap_check_leaks(), before + 1);
        unsafe { debugheap_free(q) };
        assert_eq!(debugheap_check_leaks(), before);
    }

    #[test]
    fn bad_watchpoints_are_refused() {
        let value = 0u32;
        assert_eq!(
            debugheap_set_hardware_watchpoint(7, &value as *const u32 as *const c_void, 4),
            -1
        );
        assert_eq!(
            debugheap_set_hardware_watchpoint(0, &value as *const u32 as *const c_void, 3),
            -1
        );
        assert_eq!(debugheap_clear_hardware_watchpoint(2), 0);
        assert_eq!(debugheap_clear_hardware_watchpoint(9), -1);
    }
}
