//! Hardware watchpoints: have the CPU trap on the next write to an address.
//!
//! There are four debug address registers, so four slots. Each slot watches
//! 1, 2, 4 or 8 bytes at an address aligned to that size. On Linux the
//! registers belong to the kernel, so a slot is armed through
//! `perf_event_open()` and a hit is delivered as `SIGTRAP`, which the crash
//! handler picks up like any other fault.

use std::{io, mem};

use thiserror::Error;

use crate::{lock::FutexMutex, os::thread::current_thread_id};

pub const SLOTS: usize = 4;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WatchpointError {
    #[error("watchpoint slot {0} doesn't exist, there are {SLOTS}")]
    InvalidSlot(usize),
    #[error("can't watch {0} bytes, only 1, 2, 4 or 8")]
    InvalidSize(usize),
    #[error("{address:#x} isn't aligned to the watched size {size}")]
    Misaligned { address: usize, size: usize },
    #[error("hardware watchpoints aren't available here")]
    Unsupported,
    #[error("perf_event_open() failed, errno = {errno}")]
    Os { errno: i32 },
}

pub fn validate(slot: usize, address: usize, size: usize) -> Result<(), WatchpointError> {
    if slot >= SLOTS {
        return Err(WatchpointError::InvalidSlot(slot));
    }
    if !matches!(size, 1 | 2 | 4 | 8) {
        return Err(WatchpointError::InvalidSize(size));
    }
    if address % size != 0 {
        return Err(WatchpointError::Misaligned { address, size });
    }
    Ok(())
}

/// The x86 debug control register. Per slot `n` there is a local-enable bit
/// at `2n`, a 2-bit R/W field at `16 + 4n` and a 2-bit LEN field at
/// `18 + 4n`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Dr7(pub u64);

impl Dr7 {
    /// R/W = 01, break on data writes
    const RW_WRITE: u64 = 0b01;

    /// The LEN encoding for a watched size. Note 8 bytes is `10`, not `11`.
    pub fn len_bits(size: usize) -> Result<u64, WatchpointError> {
        match size {
            1 => Ok(0b00),
            2 => Ok(0b01),
            8 => Ok(0b10),
            4 => Ok(0b11),
            _ => Err(WatchpointError::InvalidSize(size)),
        }
    }

    /// This register with `slot` watching writes of `size` bytes. Other slots
    /// are left alone.
    pub fn with_write_watch(self, slot: usize, size: usize) -> Result<Self, WatchpointError> {
        if slot >= SLOTS {
            return Err(WatchpointError::InvalidSlot(slot));
        }
        let len = Self::len_bits(size)?;
        let cleared = self.without(slot)?.0;
        Ok(Self(
            cleared
                | 1 << (slot * 2)
                | Self::RW_WRITE << (16 + slot * 4)
                | len << (18 + slot * 4),
        ))
    }

    /// This register with every bit of `slot` cleared
    pub fn without(self, slot: usize) -> Result<Self, WatchpointError> {
        if slot >= SLOTS {
            return Err(WatchpointError::InvalidSlot(slot));
        }
        Ok(Self(
            self.0 & !(0b11 << (slot * 2)) & !(0b1111 << (16 + slot * 4)),
        ))
    }

    pub fn is_enabled(self, slot: usize) -> bool {
        slot < SLOTS && self.0 & (1 << (slot * 2)) != 0
    }
}

// <linux/perf_event.h>, <linux/hw_breakpoint.h>
const PERF_TYPE_BREAKPOINT: u32 = 5;
const HW_BREAKPOINT_W: u32 = 2;
const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;
const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
const ATTR_EXCLUDE_HV: u64 = 1 << 6;
// <linux/fcntl.h>, <asm-generic/fcntl.h>
const F_SETSIG: libc::c_int = 10;
const F_GETSIG: libc::c_int = 11;
const F_SETOWN_EX: libc::c_int = 15;
const F_GETOWN_EX: libc::c_int = 16;
const F_OWNER_TID: libc::c_int = 0;

/// `struct f_owner_ex`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct OwnerEx {
    type_: libc::c_int,
    pid: libc::pid_t,
}

/// `struct perf_event_attr`, `PERF_ATTR_SIZE_VER5`
#[repr(C)]
#[derive(Default)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    bp_addr: u64,
    bp_len: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved: u16,
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn os_error(errno: i32) -> WatchpointError {
    match errno {
        libc::ENOENT | libc::ENODEV | libc::EOPNOTSUPP | libc::ENOSYS => {
            WatchpointError::Unsupported
        }
        errno => WatchpointError::Os { errno },
    }
}

/// Arm a write breakpoint for the calling thread, signalled as `SIGTRAP`.
/// Returns the event's fd.
fn open_breakpoint(address: usize, size: usize) -> Result<i32, WatchpointError> {
    let attr = PerfEventAttr {
        type_: PERF_TYPE_BREAKPOINT,
        size: mem::size_of::<PerfEventAttr>() as u32,
        sample_period: 1,
        wakeup_events: 1,
        flags: ATTR_EXCLUDE_KERNEL | ATTR_EXCLUDE_HV,
        bp_type: HW_BREAKPOINT_W,
        bp_addr: address as u64,
        bp_len: size as u64,
        ..Default::default()
    };
    // SAFETY: `attr` is a valid, fully initialized perf_event_attr
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            &attr as *const PerfEventAttr,
            0 as libc::pid_t,   // this thread
            -1 as libc::c_int, // any cpu
            -1 as libc::c_int, // no group
            PERF_FLAG_FD_CLOEXEC,
        )
    } as i32;
    if fd < 0 {
        return Err(os_error(last_errno()));
    }
    if let Err(errno) = signal_calling_thread(fd, libc::SIGTRAP) {
        unsafe { libc::close(fd) };
        return Err(WatchpointError::Os { errno });
    }
    Ok(fd)
}

/// Have activity on `fd` raise `signal` on the calling thread, and only
/// there, so the handler sees the context of the thread that did it
fn signal_calling_thread(fd: i32, signal: libc::c_int) -> Result<(), i32> {
    let owner = OwnerEx {
        type_: F_OWNER_TID,
        pid: current_thread_id() as libc::pid_t,
    };
    // SAFETY: `fd` is open, `owner` outlives the call
    let ok = unsafe {
        libc::fcntl(fd, libc::F_SETFL, libc::O_ASYNC) == 0
            && libc::fcntl(fd, F_SETSIG, signal) == 0
            && libc::fcntl(fd, F_SETOWN_EX, &owner as *const OwnerEx) == 0
    };
    if ok {
        Ok(())
    } else {
        Err(last_errno())
    }
}

/// The four slots, and the debug-control value they amount to
pub struct Watchpoints {
    state: FutexMutex<WatchpointState>,
}

struct WatchpointState {
    fds: [i32; SLOTS],
    dr7: Dr7,
}

impl Watchpoints {
    pub const fn new() -> Self {
        Self {
            state: FutexMutex::new(WatchpointState {
                fds: [-1; SLOTS],
                dr7: Dr7(0),
            }),
        }
    }

    /// Watch `size` bytes at `address` for writes. Replaces whatever was in
    /// `slot`.
    pub fn set(&self, slot: usize, address: usize, size: usize) -> Result<(), WatchpointError> {
        validate(slot, address, size)?;
        let fd = open_breakpoint(address, size)?;
        let mut state = self.state.lock();
        let old = mem::replace(&mut state.fds[slot], fd);
        if old >= 0 {
            unsafe { libc::close(old) };
        }
        state.dr7 = state.dr7.with_write_watch(slot, size)?;
        Ok(())
    }

    pub fn clear(&self, slot: usize) -> Result<(), WatchpointError> {
        if slot >= SLOTS {
            return Err(WatchpointError::InvalidSlot(slot));
        }
        let mut state = self.state.lock();
        let fd = mem::replace(&mut state.fds[slot], -1);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
        state.dr7 = state.dr7.without(slot)?;
        Ok(())
    }

    pub fn dr7(&self) -> Dr7 {
        self.state.lock().dr7
    }
}

static WATCHPOINTS: Watchpoints = Watchpoints::new();

/// Arm `slot` of the process-wide [`Watchpoints`]. The breakpoint only fires
/// for writes made by the calling thread.
pub fn set_hardware_watchpoint(slot: usize, address: usize, size: usize) -> Result<(), WatchpointError> {
    WATCHPOINTS.set(slot, address, size).inspect_err(|e| {
        log::warn!("could not watch {size} bytes at {address:#x} in slot {slot}: {e}");
    })
}

pub fn clear_hardware_watchpoint(slot: usize) -> Result<(), WatchpointError> {
    WATCHPOINTS.clear(slot)
}

impl Default for Watchpoints {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Watchpoints {
    fn drop(&mut self) {
        for &fd in self.state.get_mut().fds.iter().filter(|&&fd| fd >= 0) {
            unsafe { libc::close(fd) };
        }
    }
}
