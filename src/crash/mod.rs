//! Crash capture.
//!
//! [`CrashReporter::install`] hooks the fatal signals. When one arrives and
//! reporting is enabled, the faulting thread grabs what only it can see (its
//! open profiler regions), then hands the fault to a fresh worker thread which
//! walks the stack, tells the user and writes the dumps. The faulting thread
//! waits for the worker, but not forever. Afterwards the previous signal
//! disposition is put back and the fault replays into it.

pub mod context;
pub mod dump;
pub mod watchpoint;

use std::{
    ffi::c_void,
    fmt::Write as _,
    io, mem,
    path::PathBuf,
    ptr,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;

pub use self::{
    context::{module_base, signal_name, walk_frames, FaultContext},
    dump::{DumpError, DumpKind, DumpRequest, DumpWriter, ProcDumpWriter},
    watchpoint::{clear_hardware_watchpoint, set_hardware_watchpoint, WatchpointError},
};
use crate::{
    alloc::tracking::ReentrancyGuard,
    os::{
        mem::{MapError, MmapRegion},
        thread::current_thread_id,
    },
    profiler::{self, ProfileSnapshot},
    stack::symbols::{BacktraceSymbols, SymbolContext},
    util::{env, print::debug_output},
};

/// The signals that mean the process is going down
pub const FATAL_SIGNALS: [i32; 6] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGTRAP,
    libc::SIGABRT,
];

const ALTERNATE_STACK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CrashError {
    #[error("a crash handler is already installed")]
    AlreadyInstalled,
    #[error("sigaction({}) failed, errno = {errno}", signal_name(*.signal))]
    Os { signal: i32, errno: i32 },
    #[error("sigaltstack() failed, errno = {errno}")]
    AlternateStack { errno: i32 },
    #[error("could not map the signal stack: {0}")]
    Map(#[from] MapError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrashConfig {
    /// Where the dumps go, the working directory if `None`
    pub dump_dir: Option<PathBuf>,
    pub minidump_name: String,
    pub fulldump_name: String,
    /// How long the faulting thread waits for the worker
    pub worker_timeout: Duration,
    pub worker_stack_size: usize,
    pub max_frames: usize,
}

impl CrashConfig {
    /// Defaults, overridden by `DEBUGHEAP_DUMP_DIR` and
    /// `DEBUGHEAP_CRASH_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os("DEBUGHEAP_DUMP_DIR") {
            config.dump_dir = Some(dir.into());
        }
        if let Some(ms) = env::parse::<u64>("DEBUGHEAP_CRASH_TIMEOUT_MS") {
            config.worker_timeout = Duration::from_millis(ms);
        }
        config
    }

    fn dump_path(&self, name: &str) -> PathBuf {
        match &self.dump_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }
}

impl Default for CrashConfig {
    fn default() -> Self {
        Self {
            dump_dir: None,
            minidump_name: "minidump.dmp".into(),
            fulldump_name: "fulldump.dmp".into(),
            worker_timeout: Duration::from_secs(10),
            worker_stack_size: 256 * 1024,
            max_frames: 64,
        }
    }
}

/// Tells the user. Blocks until they've been told.
pub trait CrashNotifier: Send + Sync {
    fn notify(&self, message: &str);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StderrNotifier;

impl CrashNotifier for StderrNotifier {
    fn notify(&self, message: &str) {
        debug_output(message);
        debug_output("\n");
    }
}

/// What the worker came back with
#[derive(Debug)]
pub struct CrashReport {
    pub message: String,
    /// Return addresses, innermost first
    pub frames: Vec<usize>,
    pub minidump: Result<PathBuf, DumpError>,
    pub fulldump: Result<PathBuf, DumpError>,
}

#[derive(Debug)]
pub enum CrashOutcome {
    /// Reporting is off, nothing was done
    PassedThrough,
    Reported(CrashReport),
    /// The worker didn't finish in time, or couldn't be started. The message
    /// has what the faulting thread knew on its own.
    Abandoned { partial_message: String },
}

pub struct CrashReporter {
    enabled: AtomicBool,
    config: CrashConfig,
    symbols: &'static SymbolContext<'static>,
    dumper: &'static dyn DumpWriter,
    notifier: &'static dyn CrashNotifier,
}

static INSTALLED: OnceCell<&'static CrashReporter> = OnceCell::new();
static PREVIOUS_ACTIONS: OnceCell<PreviousActions> = OnceCell::new();
static HANDLING: AtomicBool = AtomicBool::new(false);

struct PreviousActions([libc::sigaction; FATAL_SIGNALS.len()]);

// SAFETY: plain data, only read after it's published
unsafe impl Send for PreviousActions {}
unsafe impl Sync for PreviousActions {}

impl CrashReporter {
    /// Starts out disabled
    pub fn new(
        config: CrashConfig,
        symbols: &'static SymbolContext<'static>,
        dumper: &'static dyn DumpWriter,
        notifier: &'static dyn CrashNotifier,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            config,
            symbols,
            dumper,
            notifier,
        }
    }

    pub fn config(&self) -> &CrashConfig {
        &self.config
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Become the process's fault handler. Only one reporter can ever be
    /// installed.
    ///
    /// The calling thread gets an alternate signal stack so that running out
    /// of stack is reportable too. Other threads that want that need to call
    /// [`install_alternate_stack`] themselves.
    pub fn install(&'static self) -> Result<(), CrashError> {
        INSTALLED
            .set(self)
            .map_err(|_| CrashError::AlreadyInstalled)?;
        install_alternate_stack()?;

        // SAFETY: zeroed sigactions are valid out-parameters
        let mut previous: [libc::sigaction; FATAL_SIGNALS.len()] = unsafe { mem::zeroed() };
        for (&signal, previous) in FATAL_SIGNALS.iter().zip(&mut previous) {
            // SAFETY: querying only
            if unsafe { libc::sigaction(signal, ptr::null(), previous) } != 0 {
                return Err(CrashError::Os { signal, errno: last_errno() });
            }
        }
        _ = PREVIOUS_ACTIONS.set(PreviousActions(previous));

        for signal in FATAL_SIGNALS {
            // SAFETY: `handle_signal` has the SA_SIGINFO signature
            unsafe {
                let mut action: libc::sigaction = mem::zeroed();
                action.sa_sigaction = handle_signal as usize;
                action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
                libc::sigemptyset(&mut action.sa_mask);
                if libc::sigaction(signal, &action, ptr::null_mut()) != 0 {
                    return Err(CrashError::Os { signal, errno: last_errno() });
                }
            }
        }
        log::debug!("crash handler installed");
        Ok(())
    }

    /// Report a fault on the calling thread. This is what the signal handler
    /// does, minus the signal.
    pub fn handle_fault(&'static self, fault: Option<FaultContext>) -> CrashOutcome {
        if !self.is_enabled() {
            return CrashOutcome::PassedThrough;
        }
        // The worker is a new thread, whatever state the service was in here
        // is irrelevant to it
        self.symbols.reinitialize_for_crash();
        self.report(fault)
    }

    /// Walk through the crash path without a fault: no stack, no
    /// notification, just the dumps. Works whether reporting is enabled or
    /// not.
    pub fn write_dumps_now(&'static self) -> CrashOutcome {
        self.report(None)
    }

    fn report(&'static self, fault: Option<FaultContext>) -> CrashOutcome {
        // The fault may have hit with a heap lock held by this thread. From
        // here on, allocations on either thread stay off the live lists.
        let _reentrancy = ReentrancyGuard::enter();
        // Only the faulting thread can read its own regions
        let job = CrashJob {
            reporter: self,
            fault,
            thread_id: fault.map_or_else(current_thread_id, |f| f.thread_id),
            profile: profiler::snapshot(),
        };
        let partial_message = job.partial_message();

        let (tx, rx) = crossbeam::channel::bounded(1);
        let spawned = thread::Builder::new()
            .name("debugheap-crash".into())
            .stack_size(self.config.worker_stack_size)
            .spawn(move || {
                let _reentrancy = ReentrancyGuard::enter();
                _ = tx.send(job.run());
            });
        if let Err(e) = spawned {
            log::error!("could not start the crash worker: {e}");
            return self.abandon(partial_message);
        }

        match rx.recv_timeout(self.config.worker_timeout) {
            Ok(report) => {
                debug_output(&report.message);
                debug_output("\n");
                log::error!("{}", report.message);
                CrashOutcome::Reported(report)
            }
            Err(_) => {
                log::error!(
                    "crash worker did not finish within {:?}",
                    self.config.worker_timeout
                );
                self.abandon(partial_message)
            }
        }
    }

    fn abandon(&self, partial_message: String) -> CrashOutcome {
        debug_output(&partial_message);
        debug_output("\n");
        log::error!("{partial_message}");
        CrashOutcome::Abandoned { partial_message }
    }
}

impl std::fmt::Debug for CrashReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashReporter")
            .field("enabled", &self.is_enabled())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Everything the worker gets from the faulting thread
struct CrashJob {
    reporter: &'static CrashReporter,
    fault: Option<FaultContext>,
    thread_id: u64,
    profile: ProfileSnapshot,
}

impl CrashJob {
    /// The open profiler regions, outermost first
    fn profiler_stack(&self) -> String {
        let mut message = String::from("Profiler stack:\n");
        for region in self.profile.regions() {
            _ = writeln!(message, "{region}");
        }
        if self.profile.is_truncated() {
            _ = writeln!(
                message,
                "... ({} more)",
                self.profile.depth() - self.profile.regions().len()
            );
        }
        message.push('\n');
        message
    }

    fn partial_message(&self) -> String {
        let mut message = self.profiler_stack();
        if let Some(fault) = &self.fault {
            _ = write!(
                message,
                "Code: {} ({}, si_code {})\nAddress: {:#x}",
                fault.signal_name(),
                fault.signal,
                fault.code,
                fault.address
            );
        }
        message
    }

    fn run(self) -> CrashReport {
        let reporter = self.reporter;
        let config = &reporter.config;
        let mut message = self.profiler_stack();

        let mut frames = vec![0usize; config.max_frames];
        let nr_frames = self
            .fault
            .map_or(0, |f| walk_frames(f.instruction_pointer, f.frame_pointer, &mut frames));
        frames.truncate(nr_frames);

        if let Some(fault) = &self.fault {
            message.push_str("Crash callstack:\n");
            for &frame in &frames {
                match reporter.symbols.resolve(frame) {
                    Some(symbol) => _ = writeln!(message, "\t{symbol}"),
                    None => _ = writeln!(message, "\tN/A ({frame:#x})"),
                }
            }
            _ = write!(
                message,
                "\nCode: {} ({}, si_code {})\nAddress: {:#x}\nBase: {:#x}",
                fault.signal_name(),
                fault.signal,
                fault.code,
                fault.address,
                module_base(fault.instruction_pointer).unwrap_or(0),
            );
            reporter.notifier.notify(&message);
        }

        let request = DumpRequest {
            fault: self.fault.as_ref(),
            thread_id: self.thread_id,
            profile: self.profile,
        };
        let minidump = self.write_dump(&config.minidump_name, DumpKind::Filtered, &request);
        let fulldump = self.write_dump(&config.fulldump_name, DumpKind::Full, &request);

        CrashReport {
            message,
            frames,
            minidump,
            fulldump,
        }
    }

    fn write_dump(&self, name: &str, kind: DumpKind, request: &DumpRequest<'_>) -> Result<PathBuf, DumpError> {
        let path = self.reporter.config.dump_path(name);
        match self.reporter.dumper.write_dump(&path, kind, request) {
            Ok(()) => {
                log::debug!("wrote {kind:?} dump to {}", path.display());
                Ok(path)
            }
            Err(e) => {
                log::error!("could not write {}: {e}", path.display());
                Err(e)
            }
        }
    }
}

extern "C" fn handle_signal(signal: libc::c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    // SAFETY: we're an SA_SIGINFO handler, these are our arguments
    let fault = unsafe { FaultContext::from_signal(signal, info, ucontext) };

    // A fault while reporting a fault goes straight to the previous handler
    if !HANDLING.swap(true, Ordering::AcqRel) {
        if let Some(reporter) = INSTALLED.get() {
            reporter.handle_fault(Some(fault));
        }
    }

    restore_previous_action(signal);
    // Returning re-runs a faulting instruction into the restored handler.
    // Signals that were sent, or that don't re-trigger, need raising again.
    if fault.code <= 0 || signal == libc::SIGTRAP || signal == libc::SIGABRT {
        // SAFETY: raise() is async-signal-safe
        unsafe { libc::raise(signal) };
    }
}

fn restore_previous_action(signal: i32) {
    let previous = PREVIOUS_ACTIONS.get().and_then(|actions| {
        FATAL_SIGNALS
            .iter()
            .position(|&s| s == signal)
            .map(|i| &actions.0[i])
    });
    // SAFETY: either a sigaction the kernel gave us, or SIG_DFL
    unsafe {
        match previous {
            Some(action) => {
                libc::sigaction(signal, action, ptr::null_mut());
            }
            None => {
                libc::signal(signal, libc::SIG_DFL);
            }
        }
    }
}

/// Give the calling thread a signal stack of our own, big enough to run the
/// crash path from. The memory is never freed.
pub fn install_alternate_stack() -> Result<(), CrashError> {
    let (ptr, size) = MmapRegion::map_noreserve(ALTERNATE_STACK_SIZE.max(libc::SIGSTKSZ))?.into_raw_parts();
    let stack = libc::stack_t {
        ss_sp: ptr.cast(),
        ss_flags: 0,
        ss_size: size,
    };
    // SAFETY: `stack` describes a mapping we just leaked
    if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
        let errno = last_errno();
        // SAFETY: nobody else has seen the region
        drop(unsafe { MmapRegion::from_raw_parts(ptr, size) });
        return Err(CrashError::AlternateStack { errno });
    }
    Ok(())
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

static BACKTRACE_SYMBOLS: BacktraceSymbols = BacktraceSymbols;
static GLOBAL_SYMBOLS: SymbolContext<'static> = SymbolContext::new(&BACKTRACE_SYMBOLS);
static GLOBAL: Lazy<CrashReporter> = Lazy::new(|| {
    CrashReporter::new(
        CrashConfig::from_env(),
        &GLOBAL_SYMBOLS,
        &ProcDumpWriter,
        &StderrNotifier,
    )
});

/// The process's reporter: `backtrace` symbols, procfs dumps, stderr
/// notification, configured from the environment
pub fn global() -> &'static CrashReporter {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
    };

    use super::*;
    use crate::{
        profile_scope,
        profiler::{ProfileScope, MAX_OPEN_REGIONS},
        stack::tests::FakeSymbols,
    };

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<String>>,
    }

    impl CrashNotifier for RecordingNotifier {
        fn notify(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_owned());
        }
    }

    /// Records requests, refuses filtered dumps
    #[derive(Default)]
    struct PickyDumper {
        written: Mutex<Vec<(PathBuf, DumpKind, bool)>>,
    }

    impl DumpWriter for PickyDumper {
        fn write_dump(&self, path: &Path, kind: DumpKind, request: &DumpRequest<'_>) -> Result<(), DumpError> {
            if kind == DumpKind::Filtered {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope").into());
            }
            self.written
                .lock()
                .unwrap()
                .push((path.to_owned(), kind, request.fault.is_some()));
            Ok(())
        }
    }

    struct SlowDumper(AtomicBool);

    impl DumpWriter for SlowDumper {
        fn write_dump(&self, _: &Path, _: DumpKind, _: &DumpRequest<'_>) -> Result<(), DumpError> {
            thread::sleep(Duration::from_secs(2));
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn leak<T>(value: T) -> &'static T {
        Box::leak(Box::new(value))
    }

    fn fake_symbols() -> &'static SymbolContext<'static> {
        leak(SymbolContext::new(leak(FakeSymbols::default())))
    }

    fn config() -> CrashConfig {
        CrashConfig {
            dump_dir: Some(std::env::temp_dir()),
            worker_timeout: Duration::from_secs(30),
            ..CrashConfig::default()
        }
    }

    fn fault() -> FaultContext {
        FaultContext {
            signal: libc::SIGSEGV,
            code: 1,
            address: 0x10,
            instruction_pointer: 0x1234,
            stack_pointer: 0,
            frame_pointer: 0,
            thread_id: 42,
        }
    }

    #[test]
    fn disabled_reporter_passes_through() {
        let dumper = leak(PickyDumper::default());
        let reporter = leak(CrashReporter::new(config(), fake_symbols(), dumper, leak(StderrNotifier)));
        assert!(!reporter.is_enabled());
        assert!(matches!(reporter.handle_fault(Some(fault())), CrashOutcome::PassedThrough));
        assert!(dumper.written.lock().unwrap().is_empty());
    }

    #[test]
    fn faults_are_reported_and_dumped() {
        let dumper = leak(PickyDumper::default());
        let notifier = leak(RecordingNotifier::default());
        let reporter = leak(CrashReporter::new(config(), fake_symbols(), dumper, notifier));
        reporter.set_enabled(true);

        let outcome = {
            profile_scope!("update");
            profile_scope!("physics");
            reporter.handle_fault(Some(fault()))
        };
        let report = match outcome {
            CrashOutcome::Reported(report) => report,
            other => panic!("expected a report, got {other:?}"),
        };
        assert_eq!(report.frames, [0x1234]);
        assert!(report.message.starts_with("Profiler stack:\nupdate\nphysics\n"));
        assert!(report.message.contains("Crash callstack:\n\tfake.rs(52):\tfn_1234\n"));
        assert!(report.message.contains("Code: SIGSEGV (11, si_code 1)"));
        assert!(report.message.contains("Address: 0x10"));
        assert_eq!(*notifier.messages.lock().unwrap(), [report.message.clone()]);

        // One dump failing doesn't stop the other
        assert!(report.minidump.is_err());
        assert_eq!(
            report.fulldump.unwrap(),
            std::env::temp_dir().join("fulldump.dmp")
        );
        let written = dumper.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].1, DumpKind::Full);
        assert!(written[0].2);
    }

    #[test]
    fn manual_dumps_skip_the_notification() {
        let dumper = leak(PickyDumper::default());
        let notifier = leak(RecordingNotifier::default());
        let reporter = leak(CrashReporter::new(config(), fake_symbols(), dumper, notifier));

        let CrashOutcome::Reported(report) = reporter.write_dumps_now() else {
            panic!("expected a report");
        };
        assert!(report.frames.is_empty());
        assert!(!report.message.contains("Crash callstack"));
        assert!(notifier.messages.lock().unwrap().is_empty());
        let written = dumper.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert!(!written[0].2);
    }

    #[test]
    fn a_stuck_worker_is_abandoned() {
        let dumper = leak(SlowDumper(AtomicBool::new(false)));
        let config = CrashConfig {
            worker_timeout: Duration::from_millis(50),
            ..config()
        };
        let reporter = leak(CrashReporter::new(config, fake_symbols(), dumper, leak(StderrNotifier)));
        reporter.set_enabled(true);

        let outcome = {
            profile_scope!("load_level");
            reporter.handle_fault(Some(fault()))
        };
        let partial_message = match outcome {
            CrashOutcome::Abandoned { partial_message } => partial_message,
            other => panic!("expected the worker to be abandoned, got {other:?}"),
        };
        assert!(partial_message.starts_with("Profiler stack:\nload_level\n"));
        assert!(partial_message.contains("Code: SIGSEGV"));
        assert!(!dumper.0.load(Ordering::SeqCst));
    }

    #[test]
    fn deep_profiler_stacks_are_cut_short_in_both_messages() {
        let notifier = leak(RecordingNotifier::default());
        let reporter = leak(CrashReporter::new(config(), fake_symbols(), leak(PickyDumper::default()), notifier));
        reporter.set_enabled(true);

        let scopes: Vec<_> = (0..MAX_OPEN_REGIONS + 2)
            .map(|_| ProfileScope::new("deep"))
            .collect();
        let outcome = reporter.handle_fault(Some(fault()));
        let job = CrashJob {
            reporter,
            fault: Some(fault()),
            thread_id: 42,
            profile: profiler::snapshot(),
        };
        drop(scopes);

        let report = match outcome {
            CrashOutcome::Reported(report) => report,
            other => panic!("expected a report, got {other:?}"),
        };
        assert!(report.message.contains("deep\n... (2 more)\n\nCrash callstack:"));
        assert!(job.partial_message().contains("deep\n... (2 more)\n\nCode: SIGSEGV"));
    }

    #[test]
    fn dump_paths_default_to_the_working_directory() {
        let config = CrashConfig::default();
        assert_eq!(config.dump_path("minidump.dmp"), PathBuf::from("minidump.dmp"));
        assert_eq!(config.worker_timeout, Duration::from_secs(10));
    }
}
