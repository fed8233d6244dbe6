//! EL1 exception vectors and handlers.
//!
//! The vector table lives in `exceptions.s`; each stub saves the full
//! register file and funnels into one of the handlers below. During
//! bring-up every exception is fatal, but the syndrome dump these handlers
//! produce is the only diagnostic for a bad mapping after translation is
//! switched on, so the decode here is deliberately thorough.
//!
//! VBAR_EL1 must be programmed (and the vector page executable) before the
//! MMU is enabled; the enable path cross-checks both.

#[cfg(target_os = "none")]
use crate::println;

#[cfg(target_os = "none")]
use core::arch::asm;

#[cfg(target_os = "none")]
core::arch::global_asm!(include_str!("exceptions.s"));

#[cfg(target_os = "none")]
unsafe extern "C" {
    /// 2 KiB-aligned table defined in exceptions.s. Only its address is
    /// ever taken.
    static exception_vector_table: u64;
}

/// Register file captured by the assembly stubs. Field order matches the
/// SAVE_CONTEXT macro in exceptions.s exactly.
#[repr(C)]
pub struct ExceptionContext {
    /// x0..x30.
    pub gpr: [u64; 31],
    pub elr_el1: u64,
    pub spsr_el1: u64,
}

/// Which of the four vector slots fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionKind {
    Synchronous,
    Irq,
    Fiq,
    SError,
}

impl ExceptionKind {
    pub fn from_u64(value: u64) -> Self {
        match value {
            1 => ExceptionKind::Irq,
            2 => ExceptionKind::Fiq,
            3 => ExceptionKind::SError,
            _ => ExceptionKind::Synchronous,
        }
    }
}

/// Decoded ESR_EL1.
#[derive(Clone, Copy, Debug)]
pub struct Syndrome {
    /// Exception class, bits \[31:26\].
    pub ec: u32,
    /// Instruction-specific syndrome, bits \[24:0\].
    pub iss: u32,
}

impl Syndrome {
    pub fn from_raw(esr: u64) -> Self {
        Self {
            ec: ((esr >> 26) & 0x3F) as u32,
            iss: (esr & 0x1FF_FFFF) as u32,
        }
    }

    #[cfg(target_os = "none")]
    pub fn read() -> Self {
        let esr: u64;
        // SAFETY: ESR_EL1 is a read-only syndrome register.
        unsafe { asm!("mrs {}, esr_el1", out(reg) esr, options(nomem, nostack)) };
        Self::from_raw(esr)
    }

    /// Human-readable exception class.
    ///
    /// Reference: ARM ARM, ESR_ELx.EC encoding table.
    pub fn class_str(&self) -> &'static str {
        match self.ec {
            0x00 => "Unknown reason",
            0x01 => "Trapped WFI/WFE",
            0x07 => "Trapped FP/SIMD",
            0x0E => "Illegal Execution State",
            0x15 => "SVC instruction",
            0x18 => "Trapped MSR/MRS/System instruction",
            0x20 => "Instruction Abort (lower EL)",
            0x21 => "Instruction Abort (same EL)",
            0x22 => "PC alignment fault",
            0x24 => "Data Abort (lower EL)",
            0x25 => "Data Abort (same EL)",
            0x26 => "SP alignment fault",
            0x2C => "Trapped FP exception",
            0x2F => "SError",
            0x30..=0x35 => "Breakpoint/step/watchpoint",
            0x3C => "BRK instruction",
            _ => "Reserved/Unknown",
        }
    }
}

/// Faulting address register, meaningful for aborts.
#[cfg(target_os = "none")]
fn read_far() -> u64 {
    let far: u64;
    // SAFETY: FAR_EL1 is a read-only fault-address register.
    unsafe { asm!("mrs {}, far_el1", out(reg) far, options(nomem, nostack)) };
    far
}

#[cfg(target_os = "none")]
fn report(ctx: &ExceptionContext, kind: ExceptionKind, origin: &str) -> ! {
    let syndrome = Syndrome::read();
    let far = read_far();

    println!();
    println!("!!! EXCEPTION: {:?} from {} !!!", kind, origin);
    println!(
        "class {:#04x} ({}), ISS {:#09x}",
        syndrome.ec,
        syndrome.class_str(),
        syndrome.iss
    );
    println!("ELR  {:#018x}", ctx.elr_el1);
    println!("FAR  {:#018x}", far);
    println!("SPSR {:#018x}", ctx.spsr_el1);
    for pair in (0..30).step_by(2) {
        println!(
            " x{:<2} {:#018x}  x{:<2} {:#018x}",
            pair,
            ctx.gpr[pair],
            pair + 1,
            ctx.gpr[pair + 1]
        );
    }
    println!(" x30 {:#018x}", ctx.gpr[30]);

    panic!("unhandled exception");
}

// The four handler entry points named by exceptions.s. `kind` is the
// vector-slot index (0 = sync, 1 = IRQ, 2 = FIQ, 3 = SError).

#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
extern "C" fn exception_current_el_sp0(ctx: &mut ExceptionContext, kind: u64) {
    report(ctx, ExceptionKind::from_u64(kind), "current EL, SP0");
}

#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
extern "C" fn exception_current_el_spx(ctx: &mut ExceptionContext, kind: u64) {
    report(ctx, ExceptionKind::from_u64(kind), "current EL, SPx");
}

#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
extern "C" fn exception_lower_el_aarch64(ctx: &mut ExceptionContext, kind: u64) {
    report(ctx, ExceptionKind::from_u64(kind), "lower EL, AArch64");
}

#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
extern "C" fn exception_lower_el_aarch32(ctx: &mut ExceptionContext, kind: u64) {
    report(ctx, ExceptionKind::from_u64(kind), "lower EL, AArch32");
}

/// Address of the vector table symbol.
#[cfg(target_os = "none")]
pub fn vector_table_addr() -> usize {
    // SAFETY: Only the symbol's address is taken, never its contents.
    unsafe { &exception_vector_table as *const u64 as usize }
}

#[cfg(not(target_os = "none"))]
pub fn vector_table_addr() -> usize {
    0
}

/// Program VBAR_EL1 with the vector table.
#[cfg(target_os = "none")]
pub fn init() {
    let vbar = vector_table_addr();
    // SAFETY: The table is 2 KiB-aligned (enforced in exceptions.s) and
    // lives in kernel text; the ISB makes it visible immediately.
    unsafe {
        asm!("msr vbar_el1, {}", "isb", in(reg) vbar, options(nomem, nostack));
    }
}

#[cfg(not(target_os = "none"))]
pub fn init() {}

/// The value currently programmed into VBAR_EL1.
#[cfg(target_os = "none")]
pub fn vector_base() -> usize {
    let vbar: usize;
    // SAFETY: VBAR_EL1 readback has no side effects.
    unsafe { asm!("mrs {}, vbar_el1", out(reg) vbar, options(nomem, nostack)) };
    vbar
}

#[cfg(not(target_os = "none"))]
pub fn vector_base() -> usize {
    0
}
