//! Floating-point exception traps. Unmasking an exception in MXCSR turns the
//! offending instruction into a `SIGFPE`, which the crash handler then picks
//! up like any other fault.

/// Invalid operation
pub const MXCSR_IM: u32 = 1 << 7;
/// Denormal operand
pub const MXCSR_DM: u32 = 1 << 8;
/// Divide by zero
pub const MXCSR_ZM: u32 = 1 << 9;
/// Overflow
pub const MXCSR_OM: u32 = 1 << 10;

/// The exceptions we trap on. Inexact (and underflow) stay masked, they fire
/// all the time in perfectly healthy code.
pub const TRAPPED_EXCEPTIONS: u32 = MXCSR_IM | MXCSR_DM | MXCSR_ZM | MXCSR_OM;

/// Compute the new control word, `true` unmasks (traps), `false` masks.
pub const fn mxcsr_with_traps(mxcsr: u32, enable: bool) -> u32 {
    if enable {
        mxcsr & !TRAPPED_EXCEPTIONS
    } else {
        mxcsr | TRAPPED_EXCEPTIONS
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn read_mxcsr() -> u32 {
    use std::arch::asm;

    let mut mxcsr: u32 = 0;
    // SAFETY: stmxcsr only writes the 4 bytes we point it at
    unsafe {
        asm! {
            "stmxcsr [{dst}]",
            dst = in(reg) &mut mxcsr as *mut u32,
            options(nostack, preserves_flags),
        }
    }
    mxcsr
}

/// # Safety
///
/// Changes how every subsequent SSE instruction on this thread behaves.
/// Unmasking exceptions means code that relied on quiet NaN/inf results will
/// now fault.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub unsafe fn write_mxcsr(mxcsr: u32) {
    use std::arch::asm;

    unsafe {
        asm! {
            "ldmxcsr [{src}]",
            src = in(reg) &mxcsr as *const u32,
            options(nostack, preserves_flags, readonly),
        }
    }
}

/// Trap (or stop trapping) on floating point overflow, divide by zero,
/// invalid operations and denormals, for the calling thread. Returns `false`
/// on architectures where we don't know how to do this.
pub fn enable_floating_point_traps(enable: bool) -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        let mxcsr = mxcsr_with_traps(read_mxcsr(), enable);
        // SAFETY: the caller asked for exactly this
        unsafe { write_mxcsr(mxcsr) };
        true
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        log::warn!("floating point traps are not supported on this architecture");
        _ = enable;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traps_mask_and_unmask_only_the_trapped_bits() {
        // Power-on default: everything masked
        let default = 0x1f80;
        let trapping = mxcsr_with_traps(default, true);
        assert_eq!(trapping & TRAPPED_EXCEPTIONS, 0);
        // inexact and underflow stay masked
        assert_eq!(trapping & (1 << 12), 1 << 12);
        assert_eq!(trapping & (1 << 11), 1 << 11);
        assert_eq!(mxcsr_with_traps(trapping, false), default);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn enabling_and_disabling_restores_control_word() {
        let before = read_mxcsr();
        assert!(enable_floating_point_traps(true));
        assert_eq!(read_mxcsr() & TRAPPED_EXCEPTIONS, 0);
        assert!(enable_floating_point_traps(false));
        assert_eq!(read_mxcsr() & TRAPPED_EXCEPTIONS, TRAPPED_EXCEPTIONS);
        unsafe { write_mxcsr(before) };
    }
}
