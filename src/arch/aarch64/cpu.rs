//! CPU state helpers used during bring-up.

#[cfg(target_os = "none")]
use core::arch::asm;

/// Current exception level (0..3).
#[cfg(target_os = "none")]
#[inline]
pub fn current_el() -> u8 {
    let el: u64;
    // SAFETY: CurrentEL is a read-only register, readable at EL1+.
    unsafe { asm!("mrs {}, CurrentEL", out(reg) el, options(nomem, nostack)) };
    ((el >> 2) & 0x3) as u8
}

/// The live stack pointer.
#[cfg(target_os = "none")]
#[inline]
pub fn read_sp() -> usize {
    let sp: usize;
    // SAFETY: Moving SP into a general register has no side effects.
    unsafe { asm!("mov {}, sp", out(reg) sp, options(nomem, nostack)) };
    sp
}

/// The address of the instruction reading it. Close enough to "the PC
/// during bring-up" for sizing the transition window.
#[cfg(target_os = "none")]
#[inline]
pub fn read_pc() -> usize {
    let pc: usize;
    // SAFETY: ADR computes a PC-relative address, no side effects.
    unsafe { asm!("adr {}, .", out(reg) pc, options(nomem, nostack, preserves_flags)) };
    pc
}

/// Mask IRQ, FIQ, SError and debug exceptions.
#[cfg(target_os = "none")]
#[inline]
pub fn mask_exceptions() {
    // SAFETY: Setting DAIF mask bits is always permitted at EL1.
    unsafe { asm!("msr daifset, #0xf", options(nomem, nostack)) };
}

/// Unmask IRQs. Only called after virtual execution is confirmed.
///
/// # Safety
/// The vector table must be installed and executable.
#[cfg(target_os = "none")]
#[inline]
pub unsafe fn unmask_interrupts() {
    // SAFETY: Caller guarantees handlers are in place.
    unsafe { asm!("msr daifclr, #2", options(nomem, nostack)) };
}

/// Park the core in a low-power wait loop.
#[cfg(target_os = "none")]
pub fn halt() -> ! {
    loop {
        // SAFETY: WFE has no architectural side effects beyond waiting.
        unsafe { asm!("wfe", options(nomem, nostack)) };
    }
}

// Host stubs so layout construction and tests compile off-target.

#[cfg(not(target_os = "none"))]
pub fn current_el() -> u8 {
    1
}

#[cfg(not(target_os = "none"))]
pub fn read_sp() -> usize {
    0
}

#[cfg(not(target_os = "none"))]
pub fn read_pc() -> usize {
    0
}

#[cfg(not(target_os = "none"))]
pub fn mask_exceptions() {}

#[cfg(not(target_os = "none"))]
pub unsafe fn unmask_interrupts() {}

#[cfg(not(target_os = "none"))]
pub fn halt() -> ! {
    unreachable!("halt is only meaningful on the real machine")
}
