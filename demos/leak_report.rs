//! Leaks a few allocations on purpose and prints what the debug heap makes of
//! them.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example leak_report
//! ```

use debugheap::{
    alloc::{LeakPolicy, SystemSource, TagScope, TrackingAllocator, TrackingConfig},
    stack::{BacktraceSymbols, SymbolContext},
};

static SYMBOLS: SymbolContext<'static> = SymbolContext::new(&BacktraceSymbols);

#[global_allocator]
static HEAP: TrackingAllocator<'static, SystemSource> = TrackingAllocator::with_config(
    SystemSource,
    &SYMBOLS,
    TrackingConfig::DEFAULT.with_leak_policy(LeakPolicy::Report),
);

#[inline(never)]
fn load_textures() -> Vec<Box<[u8]>> {
    let _tag = TagScope::new("textures");
    (0..3).map(|i| vec![0u8; 256 << i].into_boxed_slice()).collect()
}

#[inline(never)]
fn forget_a_config() {
    let _tag = TagScope::new("config");
    Box::leak(Box::new(String::from("fullscreen = true")));
}

fn main() {
    env_logger::init();

    let textures = load_textures();
    forget_a_config();
    std::mem::forget(textures);

    let clean = HEAP.check_guards();
    println!("guard scan: {} allocations, {} corrupted", clean.checked, clean.violations.len());

    let report = HEAP.check_leaks();
    println!(
        "{} allocations still alive ({} bytes)",
        report.len(),
        report.total_bytes()
    );
    for (site, summary) in report.by_site() {
        println!("{} allocations, {} bytes from:", summary.count, summary.bytes);
        print!("{}", HEAP.stack_tree().format_callstack(site));
    }
    if let Ok(json) = serde_json::to_string_pretty(&report) {
        println!("{json}");
    }
}
