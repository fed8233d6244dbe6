//! Cache, TLB and barrier maintenance.
//!
//! Every page-table write in this kernel follows the same discipline: clean
//! the cache line holding the descriptor, write, clean again, invalidate the
//! TLB by VA in the inner-shareable domain, then DSB. The helpers here are
//! the primitive steps of that discipline.
//!
//! On non-bare-metal builds (host `cargo test`) these are no-ops so the
//! table-walking logic can be exercised off-target.

#[cfg(target_os = "none")]
use core::arch::asm;

/// Data cache line size assumed for Cortex-A class cores and QEMU's virt
/// machine.
pub const DCACHE_LINE: usize = 64;

/// Full-system data synchronization barrier.
#[cfg(target_os = "none")]
#[inline(always)]
pub fn dsb_sy() {
    // SAFETY: Barrier instruction, no memory or register operands.
    unsafe { asm!("dsb sy", options(nostack, preserves_flags)) }
}

/// Inner-shareable data synchronization barrier.
#[cfg(target_os = "none")]
#[inline(always)]
pub fn dsb_ish() {
    // SAFETY: Barrier instruction, no memory or register operands.
    unsafe { asm!("dsb ish", options(nostack, preserves_flags)) }
}

/// Instruction synchronization barrier.
#[cfg(target_os = "none")]
#[inline(always)]
pub fn isb() {
    // SAFETY: Barrier instruction, no memory or register operands.
    unsafe { asm!("isb", options(nostack, preserves_flags)) }
}

/// Clean the data cache line containing `addr` to the point of coherency.
#[cfg(target_os = "none")]
#[inline]
pub fn clean_line(addr: usize) {
    let line = addr & !(DCACHE_LINE - 1);
    // SAFETY: DC CVAC is permitted at EL1 for any address; a clean of an
    // unmapped line is a no-op once the MMU is on, and pre-MMU all
    // addresses are physical.
    unsafe { asm!("dc cvac, {}", in(reg) line, options(nostack, preserves_flags)) }
}

/// Clean every data cache line in `[start, start + len)`.
#[cfg(target_os = "none")]
pub fn clean_range(start: usize, len: usize) {
    let end = start + len;
    let mut addr = start & !(DCACHE_LINE - 1);
    while addr < end {
        clean_line(addr);
        addr += DCACHE_LINE;
    }
    dsb_ish();
}

/// Invalidate the entire instruction cache.
#[cfg(target_os = "none")]
#[inline]
pub fn invalidate_icache() {
    // SAFETY: IC IALLU followed by barriers, the architectural sequence for
    // making freshly written code fetchable.
    unsafe {
        asm!("dsb ish", "ic iallu", "dsb ish", "isb", options(nostack, preserves_flags));
    }
}

/// Invalidate any TLB entry for the page containing `va`, inner-shareable.
#[cfg(target_os = "none")]
#[inline]
pub fn tlb_invalidate_page(va: usize) {
    let page = (va >> 12) as u64;
    // SAFETY: TLBI VAAE1IS takes VA[55:12] in bits [43:0]; invalidating is
    // always safe, at worst it costs a re-walk.
    unsafe { asm!("tlbi vaae1is, {}", in(reg) page, options(nostack, preserves_flags)) }
}

/// Invalidate all stage-1 EL1 TLB entries on this core.
#[cfg(target_os = "none")]
#[inline]
pub fn tlb_invalidate_all_local() {
    // SAFETY: See tlb_invalidate_page.
    unsafe { asm!("tlbi vmalle1", options(nostack, preserves_flags)) }
}

/// Invalidate all stage-1 EL1 TLB entries in the inner-shareable domain.
#[cfg(target_os = "none")]
#[inline]
pub fn tlb_invalidate_all() {
    // SAFETY: See tlb_invalidate_page.
    unsafe { asm!("tlbi vmalle1is", options(nostack, preserves_flags)) }
}

// Host stubs: keep the mapper and walker logic runnable under plain
// `cargo test`, where there is no cache to maintain.

#[cfg(not(target_os = "none"))]
#[inline(always)]
pub fn dsb_sy() {}

#[cfg(not(target_os = "none"))]
#[inline(always)]
pub fn dsb_ish() {}

#[cfg(not(target_os = "none"))]
#[inline(always)]
pub fn isb() {}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn clean_line(_addr: usize) {}

#[cfg(not(target_os = "none"))]
pub fn clean_range(_start: usize, _len: usize) {}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn invalidate_icache() {}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn tlb_invalidate_page(_va: usize) {}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn tlb_invalidate_all_local() {}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn tlb_invalidate_all() {}
