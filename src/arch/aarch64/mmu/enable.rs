//! The one-shot MMU enable sequence.
//!
//! There is exactly one way in: [`enable`] always runs the full set of
//! pre-checks before anything is written to a system register, and refuses
//! to touch SCTLR_EL1 if a required mapping is absent. The register dance
//! itself lives in `mmu_on.s`, a single audited assembly region reached
//! through a typed `extern "C"` contract, because the instant the M-bit is
//! written nothing outside that identity-mapped region may be fetched.
//!
//! Stage markers `1`..`7` go straight to the physical UART from inside the
//! assembly; they are the only post-mortem for a hang mid-sequence and must
//! not be removed.

use core::convert::Infallible;

use crate::config;
use crate::println;

#[cfg(target_os = "none")]
use super::descriptor::mair;
use super::verify::{self, VerifyError};
use super::{KernelLayout, Vmm};

#[cfg(target_os = "none")]
core::arch::global_asm!(include_str!("mmu_on.s"));

#[cfg(target_os = "none")]
unsafe extern "C" {
    /// The audited enable region. Inputs: the two L0 physical bases, the
    /// MAIR and TCR values, the physical continuation address and the
    /// physical UART base for stage markers. Clobbers general-purpose
    /// registers only; never returns.
    fn mmu_enable_trampoline(
        ttbr0: usize,
        ttbr1: usize,
        mair: u64,
        tcr: u64,
        continuation: usize,
        uart: usize,
    ) -> !;
}

/// Routine that receives control with translation on. It must live inside
/// the transition window and rebase the UART before doing anything chatty.
pub type Continuation = unsafe extern "C" fn() -> !;

/// Physical address of the enable region, for layout construction.
#[cfg(target_os = "none")]
pub fn enable_entry() -> usize {
    mmu_enable_trampoline as usize
}

#[cfg(not(target_os = "none"))]
pub fn enable_entry() -> usize {
    0
}

/// TCR_EL1 for 4 KiB granules on both halves, inner-shareable write-back
/// table walks, 40-bit intermediate physical addresses and top-byte-ignore.
///
/// Note the granule encodings differ between halves: TG0 = 0b00 is 4 KiB
/// for TTBR0, TG1 = 0b10 is 4 KiB for TTBR1.
pub const fn tcr_value() -> u64 {
    (config::TXSZ)            // T0SZ
        | (0b01 << 8)         // IRGN0: walk inner write-back
        | (0b01 << 10)        // ORGN0: walk outer write-back
        | (0b11 << 12)        // SH0: inner shareable
        | (0b00 << 14)        // TG0: 4 KiB
        | (config::TXSZ << 16) // T1SZ
        | (0b01 << 24)        // IRGN1
        | (0b01 << 26)        // ORGN1
        | (0b11 << 28)        // SH1
        | (0b10 << 30)        // TG1: 4 KiB
        | (0b010 << 32)       // IPS: 40-bit
        | (1 << 37)           // TBI0
        | (1 << 38)           // TBI1
}

/// Reasons the enable sequence refuses to run. All of them leave the MMU
/// off; there is no retry path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnableError {
    /// A translation-table base is not 4 KiB-aligned.
    MisalignedRoot { which: &'static str, addr: usize },
    /// VBAR_EL1 was never programmed.
    VectorBaseUnset,
    /// VBAR_EL1 points outside the page the vectors were installed on.
    VectorBaseMismatch { programmed: usize, installed: usize },
    /// A critical mapping failed verification.
    Verify(VerifyError),
}

impl From<VerifyError> for EnableError {
    fn from(error: VerifyError) -> Self {
        EnableError::Verify(error)
    }
}

/// Everything that must hold before SCTLR_EL1.M may be set, checked
/// against an explicit `vbar` value so the logic is testable off-target:
/// aligned roots, vectors installed where VBAR_EL1 points, and every
/// critical address resolving with the right permissions.
pub fn pre_enable_checks(vmm: &Vmm, layout: &KernelLayout, vbar: usize) -> Result<(), EnableError> {
    if vmm.ttbr0_base() % config::PAGE_SIZE != 0 {
        return Err(EnableError::MisalignedRoot {
            which: "ttbr0",
            addr: vmm.ttbr0_base(),
        });
    }
    if vmm.ttbr1_base() % config::PAGE_SIZE != 0 {
        return Err(EnableError::MisalignedRoot {
            which: "ttbr1",
            addr: vmm.ttbr1_base(),
        });
    }

    let installed = match vmm.vector_page() {
        Some(page) => page,
        None => return Err(EnableError::VectorBaseUnset),
    };
    if vbar == 0 {
        return Err(EnableError::VectorBaseUnset);
    }
    if config::page_floor(vbar) != installed {
        return Err(EnableError::VectorBaseMismatch {
            programmed: vbar,
            installed,
        });
    }

    let report = verify::verify(vmm, &vmm.critical_spots(layout))?;
    println!(
        "[vm] verified {} critical mappings ({} repaired)",
        report.checked, report.repaired
    );
    Ok(())
}

/// Run the pre-checks and, if they hold, hand the machine to the assembly
/// region. On success control re-emerges in `continuation` with the MMU,
/// data cache and instruction cache on; on check failure nothing has been
/// written and the error says why.
///
/// # Safety
/// The caller must have installed the identity mappings `continuation` and
/// the current stack depend on; interrupts must be masked.
pub unsafe fn enable(
    vmm: &Vmm,
    layout: &KernelLayout,
    continuation: Continuation,
) -> Result<Infallible, EnableError> {
    let vbar = crate::arch::aarch64::exceptions::vector_base();
    pre_enable_checks(vmm, layout, vbar)?;

    println!("MMU:START");

    // SAFETY: Pre-checks passed, so the trampoline, continuation, stack,
    // UART and vectors are all mapped as the sequence requires. The caller
    // upholds the rest.
    unsafe { fire(vmm, continuation) }
}

#[cfg(target_os = "none")]
unsafe fn fire(vmm: &Vmm, continuation: Continuation) -> ! {
    // SAFETY: Only reached through enable() with its pre-checks green.
    unsafe {
        mmu_enable_trampoline(
            vmm.ttbr0_base(),
            vmm.ttbr1_base(),
            mair::value(),
            tcr_value(),
            continuation as usize,
            config::UART_PHYS_BASE,
        )
    }
}

#[cfg(not(target_os = "none"))]
unsafe fn fire(_vmm: &Vmm, _continuation: Continuation) -> ! {
    unreachable!("the MMU exists only on the real machine")
}

/// Post-enable register read-backs, for boot diagnostics.
#[cfg(target_os = "none")]
pub mod state {
    use core::arch::asm;

    macro_rules! sysreg_read {
        ($name:ident, $reg:literal) => {
            pub fn $name() -> u64 {
                let value: u64;
                // SAFETY: Read-only access to an EL1 system register.
                unsafe { asm!(concat!("mrs {}, ", $reg), out(reg) value, options(nomem, nostack)) };
                value
            }
        };
    }

    sysreg_read!(sctlr, "sctlr_el1");
    sysreg_read!(ttbr0, "ttbr0_el1");
    sysreg_read!(ttbr1, "ttbr1_el1");
    sysreg_read!(tcr, "tcr_el1");
    sysreg_read!(mair, "mair_el1");

    /// SCTLR_EL1.M.
    pub fn mmu_enabled() -> bool {
        sctlr() & 1 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::aarch64::mmu::descriptor::PageFlags;
    use crate::mm::frames::testing::HeapFrames;

    fn layout() -> KernelLayout {
        KernelLayout {
            text_start: 0x4008_0000,
            text_end: 0x4009_0000,
            rodata_start: 0x400a_0000,
            rodata_end: 0x400a_4000,
            data_start: 0x400a_4000,
            data_end: 0x400a_8000,
            bss_start: 0x400a_8000,
            bss_end: 0x400a_c000,
            vector_base: 0x4008_0800,
            enable_entry: 0x4008_5000,
            continuation_entry: 0x4008_6000,
            boot_pc: 0x4008_5800,
            boot_sp: 0x400c_0000,
        }
    }

    #[test]
    fn tcr_encodes_the_configured_address_width() {
        let tcr = tcr_value();
        assert_eq!(tcr & 0x3F, config::TXSZ);
        assert_eq!((tcr >> 16) & 0x3F, config::TXSZ);
        #[cfg(not(feature = "va39"))]
        assert_eq!(config::TXSZ, 16);
        #[cfg(feature = "va39")]
        assert_eq!(config::TXSZ, 25);
    }

    #[test]
    fn tcr_granule_and_walk_attributes() {
        let tcr = tcr_value();
        assert_eq!((tcr >> 14) & 0b11, 0b00, "TG0 must be 4 KiB");
        assert_eq!((tcr >> 30) & 0b11, 0b10, "TG1 must be 4 KiB");
        assert_eq!((tcr >> 12) & 0b11, 0b11, "SH0 inner shareable");
        assert_eq!((tcr >> 28) & 0b11, 0b11, "SH1 inner shareable");
        assert_eq!((tcr >> 32) & 0b111, 0b010, "IPS 40-bit");
        assert_eq!((tcr >> 37) & 0b11, 0b11, "TBI0/TBI1 enabled");
    }

    #[test]
    fn checks_refuse_a_missing_vector_base() {
        let mut pool = HeapFrames::new();
        let mut vmm = Vmm::new(&mut pool).unwrap();
        let layout = layout();
        vmm.install_sections(&layout, &mut pool);

        // Vectors installed but VBAR never programmed.
        assert_eq!(
            pre_enable_checks(&vmm, &layout, 0),
            Err(EnableError::VectorBaseUnset)
        );

        // VBAR programmed somewhere else entirely.
        assert_eq!(
            pre_enable_checks(&vmm, &layout, 0x4100_0800),
            Err(EnableError::VectorBaseMismatch {
                programmed: 0x4100_0800,
                installed: 0x4008_0000,
            })
        );
    }

    #[test]
    fn checks_refuse_unverifiable_mappings() {
        let mut pool = HeapFrames::new();
        let mut vmm = Vmm::new(&mut pool).unwrap();
        let layout = layout();

        // Install everything, then deliberately break the continuation
        // page by remapping it non-executable.
        vmm.install_sections(&layout, &mut pool);
        vmm.map_range(
            0x4008_6000,
            0x4008_7000,
            0x4008_6000,
            PageFlags::KERNEL_DATA,
            &mut pool,
        )
        .unwrap();

        assert!(matches!(
            pre_enable_checks(&vmm, &layout, layout.vector_base),
            Err(EnableError::Verify(VerifyError::NotExecutable {
                name: "continuation",
                ..
            }))
        ));
    }

    #[test]
    fn checks_pass_on_a_complete_install() {
        let mut pool = HeapFrames::new();
        let mut vmm = Vmm::new(&mut pool).unwrap();
        let layout = layout();
        let report = vmm.install_sections(&layout, &mut pool);
        assert_eq!(report.skipped, 0);

        assert_eq!(pre_enable_checks(&vmm, &layout, layout.vector_base), Ok(()));
    }
}
