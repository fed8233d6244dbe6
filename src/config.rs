//! Compile-time configuration for the QEMU `virt` board.
//!
//! Everything here is a build-time constant: the virtual address width (48
//! bits by default, 39 with the `va39` feature), the high-half base derived
//! from it, the PL011 location, and the sizing knobs of the bring-up code.

/// Translation granule: 4 KiB pages everywhere.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Usable bits of a virtual address in each half.
#[cfg(not(feature = "va39"))]
pub const VA_BITS: u32 = 48;
#[cfg(feature = "va39")]
pub const VA_BITS: u32 = 39;

/// T0SZ/T1SZ value matching [`VA_BITS`] (16 for 48-bit, 25 for 39-bit).
pub const TXSZ: u64 = (64 - VA_BITS) as u64;

/// Base of the high half: all address bits above `VA_BITS` set.
///
/// A physical range is given a high-half alias by OR-ing this base onto it.
pub const HIGH_BASE: usize = !((1 << VA_BITS) - 1);

/// PL011 UART0 on the virt machine.
pub const UART_PHYS_BASE: usize = 0x0900_0000;
/// High-half alias of the UART page, used once the MMU is on.
pub const UART_VIRT_BASE: usize = HIGH_BASE | UART_PHYS_BASE;

/// RAM window on the virt machine. The kernel image is loaded at
/// `0x4008_0000` (see `linker.ld`); frames are served from the space between
/// the end of the image and `RAM_BASE + RAM_SIZE`.
pub const RAM_BASE: usize = 0x4000_0000;
pub const RAM_SIZE: usize = 128 * 1024 * 1024;

/// Capacity of the mapping registry. Overflow is logged, never fatal.
pub const MAX_REGIONS: usize = 64;

/// Padding added on each side of the MMU-transition code window.
pub const TRANSITION_PAD: usize = 64 * 1024;
/// Soft cap on the transition window; exceeding it is logged, not clipped.
pub const TRANSITION_CAP: usize = 1024 * 1024;

/// Identity-mapped window kept around the live stack pointer.
pub const STACK_PAD_BELOW: usize = 32 * 1024;
pub const STACK_PAD_ABOVE: usize = 16 * 1024;

/// Round down to the containing page boundary.
pub const fn page_floor(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Round up to the next page boundary.
pub const fn page_ceil(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
