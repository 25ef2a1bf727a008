//! Runs the debug heap on top of guard pages. With `overrun` on the command
//! line the demo writes one byte past the end of an allocation, which faults
//! on the spot and lands in the crash reporter.
//!
//! ```sh
//! cargo run --example guard_pages -- overrun
//! ```

use debugheap::{
    alloc::{GuardAllocator, TrackingAllocator, TrackingConfig},
    crash,
    profile_scope,
    stack::{BacktraceSymbols, SymbolContext},
};

static SYMBOLS: SymbolContext<'static> = SymbolContext::new(&BacktraceSymbols);

fn main() {
    env_logger::init();
    let reporter = crash::global();
    if let Err(e) = reporter.install() {
        eprintln!("no crash reporting: {e}");
    }
    reporter.set_enabled(true);

    // Guard values would sit between the data and the guard page, switch them
    // off so the overrun hits the page itself
    let heap = TrackingAllocator::with_config(
        GuardAllocator::new(),
        &SYMBOLS,
        TrackingConfig::DEFAULT.with_guards(false),
    );
    let overrun = std::env::args().any(|arg| arg == "overrun");

    profile_scope!("guard_pages");
    // A multiple of 8, so alignment doesn't leave a gap before the page
    let size = 128;
    let data = match heap.allocate(size, 0) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };
    println!("allocated {size} bytes at {:p}, the next page is off limits", data);

    // SAFETY: in bounds, unless we were asked to overrun
    unsafe {
        data.as_ptr().write_bytes(0x42, size);
        if overrun {
            profile_scope!("overrun");
            std::ptr::write_volatile(data.as_ptr().add(size), 0x42);
        }
        heap.deallocate(data.as_ptr());
    }
    println!("no overrun, nothing to see");
}
