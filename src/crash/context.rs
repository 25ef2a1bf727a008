use std::{ffi::c_void, mem};

use serde::Serialize;

use crate::os::{mem::read_own_word, thread::current_thread_id};

/// What a fault handler knows about the fault, copied out of the signal
/// frame so it can be handed to another thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FaultContext {
    pub signal: i32,
    /// `si_code`. Positive for faults raised by the CPU, `<= 0` for signals
    /// sent by `kill()`/`raise()`.
    pub code: i32,
    /// The address that faulted (for SIGSEGV/SIGBUS), otherwise usually the
    /// faulting instruction
    pub address: usize,
    pub instruction_pointer: usize,
    pub stack_pointer: usize,
    pub frame_pointer: usize,
    pub thread_id: u64,
}

impl FaultContext {
    /// # Safety
    ///
    /// `info` and `ucontext` must be the arguments of an `SA_SIGINFO` signal
    /// handler invocation (either may be null)
    pub unsafe fn from_signal(signal: i32, info: *const libc::siginfo_t, ucontext: *const c_void) -> Self {
        let (code, address) = match unsafe { info.as_ref() } {
            Some(info) => (info.si_code, unsafe { info.si_addr() } as usize),
            None => (0, 0),
        };
        let (instruction_pointer, stack_pointer, frame_pointer) =
            unsafe { registers(ucontext.cast()) };
        Self {
            signal,
            code,
            address,
            instruction_pointer,
            stack_pointer,
            frame_pointer,
            thread_id: current_thread_id(),
        }
    }

    pub fn signal_name(&self) -> &'static str {
        signal_name(self.signal)
    }
}

pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGBUS => "SIGBUS",
        libc::SIGILL => "SIGILL",
        libc::SIGFPE => "SIGFPE",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        _ => "unknown signal",
    }
}

/// `(pc, sp, fp)`, zeros if there is no context
#[cfg(target_arch = "x86_64")]
unsafe fn registers(ucontext: *const libc::ucontext_t) -> (usize, usize, usize) {
    let Some(uc) = (unsafe { ucontext.as_ref() }) else {
        return (0, 0, 0);
    };
    let gregs = &uc.uc_mcontext.gregs;
    (
        gregs[libc::REG_RIP as usize] as usize,
        gregs[libc::REG_RSP as usize] as usize,
        gregs[libc::REG_RBP as usize] as usize,
    )
}

#[cfg(target_arch = "aarch64")]
unsafe fn registers(ucontext: *const libc::ucontext_t) -> (usize, usize, usize) {
    let Some(uc) = (unsafe { ucontext.as_ref() }) else {
        return (0, 0, 0);
    };
    let mc = &uc.uc_mcontext;
    (mc.pc as usize, mc.sp as usize, mc.regs[29] as usize)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe fn registers(_: *const libc::ucontext_t) -> (usize, usize, usize) {
    (0, 0, 0)
}

/// Rebuild a call stack from a frame pointer chain, innermost first,
/// starting with `pc`. On both x86_64 and aarch64 a frame record is
/// `[previous fp, return address]`.
///
/// Every read goes through `process_vm_readv`, so a trashed chain ends the
/// walk instead of faulting again. The walk also stops when the chain stops
/// going up the stack. Returns the number of frames written.
pub fn walk_frames(pc: usize, fp: usize, out: &mut [usize]) -> usize {
    const WORD: usize = mem::size_of::<usize>();

    if out.is_empty() || pc == 0 {
        return 0;
    }
    out[0] = pc;
    let mut nr_frames = 1;
    let mut fp = fp;
    while nr_frames < out.len() && fp != 0 && fp % WORD == 0 {
        let Some(return_address) = read_own_word(fp + WORD) else {
            break;
        };
        let Some(previous_fp) = read_own_word(fp) else {
            break;
        };
        if return_address == 0 {
            break;
        }
        out[nr_frames] = return_address;
        nr_frames += 1;
        if previous_fp <= fp {
            break;
        }
        fp = previous_fp;
    }
    nr_frames
}

/// Load address of the module containing `address`, `None` if it isn't in
/// one
pub fn module_base(address: usize) -> Option<usize> {
    let mut info: libc::Dl_info = unsafe { mem::zeroed() };
    // SAFETY: dladdr only reads its own loader tables, any address is allowed
    let found = unsafe { libc::dladdr(address as *const c_void, &mut info) };
    (found != 0 && !info.dli_fbase.is_null()).then_some(info.dli_fbase as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_a_fake_chain() {
        // Three frame records, laid out like a real stack
        let mut stack = [0usize; 6];
        let base = stack.as_ptr() as usize;
        let word = mem::size_of::<usize>();
        stack[0] = base + 2 * word; // frame 0 -> frame 1
        stack[1] = 0x1111;
        stack[2] = base + 4 * word; // frame 1 -> frame 2
        stack[3] = 0x2222;
        stack[4] = 0; // end of chain
        stack[5] = 0x3333;

        let mut out = [0usize; 8];
        let n = walk_frames(0x1000, base, &mut out);
        assert_eq!(&out[..n], [0x1000, 0x1111, 0x2222, 0x3333]);

        let mut short = [0usize; 2];
        assert_eq!(walk_frames(0x1000, base, &mut short), 2);
        assert_eq!(short, [0x1000, 0x1111]);
    }

    #[test]
    fn bad_frame_pointers_end_the_walk() {
        let mut out = [0usize; 8];
        assert_eq!(walk_frames(0x1000, 0, &mut out), 1);
        assert_eq!(walk_frames(0x1000, 8, &mut out), 1);
        assert_eq!(walk_frames(0x1000, 0x1003, &mut out), 1);
        assert_eq!(walk_frames(0, 0, &mut out), 0);
    }

    #[test]
    fn code_has_a_module_base() {
        let here = walks_a_fake_chain as usize;
        let base = module_base(here).unwrap();
        assert!(base <= here);
        assert_eq!(module_base(0), None);
    }

    #[test]
    fn no_context_means_zero_registers() {
        let ctx = unsafe { FaultContext::from_signal(libc::SIGSEGV, std::ptr::null(), std::ptr::null()) };
        assert_eq!(ctx.signal_name(), "SIGSEGV");
        assert_eq!(
            (ctx.instruction_pointer, ctx.stack_pointer, ctx.frame_pointer),
            (0, 0, 0)
        );
        assert_eq!(ctx.thread_id, current_thread_id());
    }
}
