//! Crashes in a few different ways so the crash reporter has something to
//! say.
//!
//! ```sh
//! cargo run --example crash -- segv    # null pointer read
//! cargo run --example crash -- watch   # hardware watchpoint hit
//! cargo run --example crash -- fpe     # trapped divide by zero
//! cargo run --example crash -- dump    # just write the dumps
//! ```

use std::hint::black_box;

use debugheap::{
    arch::fpu,
    crash::{self, set_hardware_watchpoint, CrashOutcome},
    profile_scope,
};

#[inline(never)]
fn read_null() -> u32 {
    profile_scope!("read_null");
    // SAFETY: it isn't, that's the point
    unsafe { std::ptr::read_volatile(black_box(std::ptr::null::<u32>())) }
}

#[inline(never)]
fn stomp_watched() {
    profile_scope!("stomp_watched");
    let mut value = Box::new(0u64);
    match set_hardware_watchpoint(0, &*value as *const u64 as usize, 8) {
        Ok(()) => **black_box(&mut value) = 1,
        Err(e) => eprintln!("{e}"),
    }
}

#[inline(never)]
fn divide_by_zero() -> f64 {
    profile_scope!("divide_by_zero");
    fpu::enable_floating_point_traps(true);
    black_box(1.0) / black_box(0.0)
}

fn main() {
    env_logger::init();
    let reporter = crash::global();
    if let Err(e) = reporter.install() {
        eprintln!("could not install the crash handler: {e}");
        return;
    }
    reporter.set_enabled(true);

    profile_scope!("main");
    match std::env::args().nth(1).as_deref() {
        Some("segv") => println!("{}", read_null()),
        Some("watch") => stomp_watched(),
        Some("fpe") => println!("{}", divide_by_zero()),
        Some("dump") => match reporter.write_dumps_now() {
            CrashOutcome::Reported(report) => {
                println!("minidump: {:?}", report.minidump);
                println!("fulldump: {:?}", report.fulldump);
            }
            outcome => println!("{outcome:?}"),
        },
        _ => eprintln!("usage: crash segv|watch|fpe|dump"),
    }
}
