//! PL011 UART driver for serial console output.
//!
//! The console exists before anything else in the kernel and keeps working
//! across the MMU transition, which is why the register base is a single
//! process-wide cell rather than a field frozen at construction: boot
//! starts on the physical MMIO address, and once virtual execution is
//! confirmed the continuation republishes the high-half alias through
//! [`rebase_to_virtual`]. Everyone reads the cell on every access and
//! observes the switch atomically.
//!
//! Two output paths share the hardware: the locked [`WRITER`] behind the
//! `print!`/`println!` macros, and the raw [`putc`]/[`puthex64`] path used
//! by early bring-up and fault reporting, where taking a lock is the wrong
//! idea.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;
use volatile::Volatile;

use crate::config;

/// Live base address of the PL011 register block.
static UART_BASE: AtomicUsize = AtomicUsize::new(config::UART_PHYS_BASE);

/// PL011 register bit definitions.
///
/// Reference: ARM PL011 TRM, DDI 0183.
mod pl011_flags {
    // Flag Register (FR) bits
    pub const FR_TXFF: u32 = 1 << 5; // Transmit FIFO full

    // Line Control Register (LCRH) bits
    pub const LCRH_FEN: u32 = 1 << 4; // FIFO enable
    pub const LCRH_WLEN_8BIT: u32 = 0b11 << 5; // 8-bit word length

    // Control Register (CR) bits
    pub const CR_UARTEN: u32 = 1 << 0; // UART enable
    pub const CR_TXE: u32 = 1 << 8; // Transmit enable

    // Interrupt Clear Register (ICR)
    pub const ICR_ALL: u32 = 0x7FF; // Clear all interrupts
}

/// PL011 register layout.
#[repr(C)]
struct Pl011Registers {
    dr: Volatile<u32>, // 0x00 - Data Register
    _rsv0: [u32; 5],
    fr: Volatile<u32>, // 0x18 - Flag Register
    _rsv1: [u32; 2],
    ibrd: Volatile<u32>, // 0x24 - Integer Baud Rate Divisor
    fbrd: Volatile<u32>, // 0x28 - Fractional Baud Rate Divisor
    lcrh: Volatile<u32>, // 0x2C - Line Control Register
    cr: Volatile<u32>,   // 0x30 - Control Register
    _rsv2: [u32; 1],
    imsc: Volatile<u32>, // 0x38 - Interrupt Mask Set/Clear
    _rsv3: [u32; 2],
    icr: Volatile<u32>, // 0x44 - Interrupt Clear Register
}

lazy_static! {
    /// The console writer behind `print!`/`println!`.
    pub static ref WRITER: Mutex<UartWriter> = Mutex::new(UartWriter::new());
}

/// Locked, formatted console output.
pub struct UartWriter {
    initialized: bool,
}

impl Default for UartWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl UartWriter {
    pub const fn new() -> Self {
        UartWriter { initialized: false }
    }

    fn registers(&mut self) -> &'static mut Pl011Registers {
        // SAFETY: The cell only ever holds the virt machine's PL011 base
        // (0x0900_0000) or its installed high-half alias; both map the
        // documented register block, and exclusive access is guaranteed by
        // the WRITER mutex.
        unsafe { &mut *(UART_BASE.load(Ordering::Relaxed) as *mut Pl011Registers) }
    }

    /// Configure 115200 8N1 with FIFOs on, from the virt machine's 24 MHz
    /// UART clock: divisor 24e6 / (16 * 115200) = 13.02, so IBRD = 13 and
    /// FBRD = round(0.02 * 64) = 1.
    pub fn init(&mut self) {
        let regs = self.registers();

        regs.cr.write(0);
        regs.imsc.write(0);
        regs.icr.write(pl011_flags::ICR_ALL);

        regs.ibrd.write(13);
        regs.fbrd.write(1);

        regs.lcrh
            .write(pl011_flags::LCRH_FEN | pl011_flags::LCRH_WLEN_8BIT);
        regs.cr.write(pl011_flags::CR_UARTEN | pl011_flags::CR_TXE);

        self.initialized = true;
    }

    /// Write a single byte, busy-waiting on FIFO space.
    pub fn write_byte(&mut self, byte: u8) {
        if !self.initialized {
            self.init();
        }

        let regs = self.registers();
        while (regs.fr.read() & pl011_flags::FR_TXFF) != 0 {}
        regs.dr.write(byte as u32);
    }

    /// Write a string, expanding `\n` to `\r\n`.
    pub fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}

impl fmt::Write for UartWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

/// The base address console output currently goes through.
pub fn base() -> usize {
    UART_BASE.load(Ordering::Relaxed)
}

/// Switch all console output to the high-half alias. Called exactly once,
/// by the post-MMU continuation, after it has proven the alias works.
pub fn rebase_to_virtual() {
    UART_BASE.store(config::UART_VIRT_BASE, Ordering::Release);
}

/// Raw single-byte output through the live base: no lock, no state. This
/// is the path for bring-up phase tags and for reporting from contexts
/// where the writer lock may already be held.
#[cfg(target_os = "none")]
pub fn putc(byte: u8) {
    let base = UART_BASE.load(Ordering::Relaxed);
    // SAFETY: Same register-block argument as UartWriter::registers; raw
    // loads/stores of DR and FR are tolerant of concurrent writers, at
    // worst interleaving characters.
    unsafe {
        let fr = (base + 0x18) as *const u32;
        let dr = base as *mut u32;
        while fr.read_volatile() & pl011_flags::FR_TXFF != 0 {}
        dr.write_volatile(byte as u32);
    }
}

#[cfg(not(target_os = "none"))]
pub fn putc(_byte: u8) {}

/// Raw string output via [`putc`], expanding `\n` to `\r\n`.
pub fn puts(s: &str) {
    for byte in s.bytes() {
        if byte == b'\n' {
            putc(b'\r');
        }
        putc(byte);
    }
}

/// Raw `0x`-prefixed, zero-padded hex dump of a 64-bit value.
pub fn puthex64(value: u64) {
    puts("0x");
    for shift in (0..16).rev() {
        let nibble = ((value >> (shift * 4)) & 0xF) as u8;
        putc(match nibble {
            0..=9 => b'0' + nibble,
            _ => b'a' + nibble - 10,
        });
    }
}

/// Check that a PL011 register block answers at `base`, and emit one
/// character through it. Used by the continuation to prove the virtual
/// alias resolves before the console is rebased onto it.
#[cfg(target_os = "none")]
pub fn probe(base: usize) -> bool {
    // SAFETY: Caller passes an address that is mapped (identity or alias)
    // to the PL011 block; a wrong mapping faults to the vector table,
    // which is exactly the failure report this probe exists to trigger.
    unsafe {
        let fr = (base + 0x18) as *const u32;
        let dr = base as *mut u32;

        // An open-bus read pattern means the mapping routed nowhere useful.
        if fr.read_volatile() == u32::MAX {
            return false;
        }
        while fr.read_volatile() & pl011_flags::FR_TXFF != 0 {}
        dr.write_volatile(u32::from(b'.'));
    }
    true
}
