//! Pre-enable verification of the mappings the CPU cannot live without.
//!
//! Before the M-bit is written, every address the enable sequence touches
//! (program counter, stack, UART, vector table, the trampoline itself) must
//! resolve through valid descriptors with the access flag set, and code
//! addresses must be executable at EL1. A failure here aborts the enable;
//! the only in-place repair is clearing PXN on the vector-table leaf.

use crate::println;

use super::descriptor::PageFlags;
use super::map;
use super::table::{self, Level, Lookup};
use super::Vmm;

/// One address whose mapping is load-bearing for the enable sequence.
#[derive(Clone, Copy, Debug)]
pub struct CriticalSpot {
    pub name: &'static str,
    pub va: usize,
    /// The CPU will fetch instructions here; PXN must be clear.
    pub executable: bool,
    /// Clear PXN in place instead of failing. Set only for the vector
    /// table, whose leaf is the one descriptor worth fixing up.
    pub repair_exec: bool,
}

impl CriticalSpot {
    pub const fn data(name: &'static str, va: usize) -> Self {
        Self {
            name,
            va,
            executable: false,
            repair_exec: false,
        }
    }

    pub const fn code(name: &'static str, va: usize) -> Self {
        Self {
            name,
            va,
            executable: true,
            repair_exec: false,
        }
    }
}

/// Verification failures. None of these are repaired automatically.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyError {
    /// Some descriptor on the path to `va` is invalid.
    Unmapped {
        name: &'static str,
        va: usize,
        level: Level,
    },
    /// The leaf is live but its access flag is clear, which would fault on
    /// first use.
    NoAccessFlag { name: &'static str, va: usize },
    /// A fetch address is mapped PXN and may not be repaired.
    NotExecutable { name: &'static str, va: usize },
}

/// Summary of a successful verification pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub checked: usize,
    pub repaired: usize,
}

/// Walk each critical address and confirm it is safe to enable translation.
pub fn verify(vmm: &Vmm, spots: &[CriticalSpot]) -> Result<VerifyReport, VerifyError> {
    let mut report = VerifyReport::default();

    for spot in spots {
        let root = vmm.root_for(spot.va);
        let pte = match table::lookup(root, spot.va) {
            Lookup::Unmapped { level } => {
                return Err(VerifyError::Unmapped {
                    name: spot.name,
                    va: spot.va,
                    level,
                });
            }
            Lookup::Leaf(pte) => pte,
        };

        if !pte.flags().contains(PageFlags::AF) {
            return Err(VerifyError::NoAccessFlag {
                name: spot.name,
                va: spot.va,
            });
        }

        if spot.executable && pte.flags().contains(PageFlags::PXN) {
            if !spot.repair_exec {
                return Err(VerifyError::NotExecutable {
                    name: spot.name,
                    va: spot.va,
                });
            }

            // Repair exactly this leaf, with the mapper's write discipline.
            let slot = table::leaf_slot(root, spot.va)
                .expect("leaf_slot must succeed after a successful lookup");
            let fixed = super::descriptor::Pte::from_raw(pte.raw() & !PageFlags::PXN.bits());
            // SAFETY: `slot` is the live L3 descriptor for `spot.va`.
            unsafe { map::write_leaf(slot, spot.va, fixed) };
            report.repaired += 1;
            println!("[vm] cleared PXN on {} at {:#x}", spot.name, spot.va);
        }

        report.checked += 1;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::aarch64::mmu::descriptor::Pte;
    use crate::arch::aarch64::mmu::table::live_pte;
    use crate::config;
    use crate::mm::frames::testing::HeapFrames;

    fn vmm_with(pool: &mut HeapFrames) -> Vmm {
        Vmm::new(pool).expect("root allocation")
    }

    #[test]
    fn missing_mapping_is_reported_with_its_level() {
        let mut pool = HeapFrames::new();
        let vmm = vmm_with(&mut pool);

        let spots = [CriticalSpot::code("vectors", 0x4008_0000)];
        match verify(&vmm, &spots) {
            Err(VerifyError::Unmapped { name, va, .. }) => {
                assert_eq!(name, "vectors");
                assert_eq!(va, 0x4008_0000);
            }
            other => panic!("expected Unmapped, got {other:?}"),
        }
    }

    #[test]
    fn executable_spot_with_pxn_fails_without_repair() {
        let mut pool = HeapFrames::new();
        let mut vmm = vmm_with(&mut pool);

        vmm.map_range(
            0x4008_0000,
            0x4008_1000,
            0x4008_0000,
            PageFlags::KERNEL_DATA,
            &mut pool,
        )
        .unwrap();

        let spots = [CriticalSpot::code("pc", 0x4008_0000)];
        assert_eq!(
            verify(&vmm, &spots),
            Err(VerifyError::NotExecutable {
                name: "pc",
                va: 0x4008_0000
            })
        );
    }

    #[test]
    fn repairable_spot_gets_pxn_cleared_and_nothing_else_changes() {
        let mut pool = HeapFrames::new();
        let mut vmm = vmm_with(&mut pool);

        // Vector page wrongly installed non-executable, neighbour correct.
        vmm.map_range(
            0x4008_0000,
            0x4008_2000,
            0x4008_0000,
            PageFlags::KERNEL_RODATA,
            &mut pool,
        )
        .unwrap();

        let before_neighbour = live_pte(vmm.root_for(0x4008_1000), 0x4008_1000);

        let spots = [CriticalSpot {
            name: "vectors",
            va: 0x4008_0000,
            executable: true,
            repair_exec: true,
        }];
        let report = verify(&vmm, &spots).unwrap();
        assert_eq!(report, VerifyReport { checked: 1, repaired: 1 });

        let repaired = live_pte(vmm.root_for(0x4008_0000), 0x4008_0000);
        assert!(!repaired.flags().contains(PageFlags::PXN));
        assert_eq!(
            repaired.raw() | PageFlags::PXN.bits(),
            Pte::page(0x4008_0000, PageFlags::KERNEL_RODATA).raw()
        );

        // The neighbouring descriptor is untouched.
        let after_neighbour = live_pte(vmm.root_for(0x4008_1000), 0x4008_1000);
        assert_eq!(before_neighbour, after_neighbour);

        // A second pass has nothing left to repair.
        let report = verify(&vmm, &spots).unwrap();
        assert_eq!(report, VerifyReport { checked: 1, repaired: 0 });
    }

    #[test]
    fn access_flag_must_be_set() {
        let mut pool = HeapFrames::new();
        let mut vmm = vmm_with(&mut pool);

        let no_af = PageFlags::KERNEL_DATA.difference(PageFlags::AF);
        vmm.map_range(0x4009_0000, 0x4009_1000, 0x4009_0000, no_af, &mut pool)
            .unwrap();

        let spots = [CriticalSpot::data("sp", 0x4009_0000)];
        assert_eq!(
            verify(&vmm, &spots),
            Err(VerifyError::NoAccessFlag {
                name: "sp",
                va: 0x4009_0000
            })
        );
    }

    #[test]
    fn clean_spots_verify_without_repairs() {
        let mut pool = HeapFrames::new();
        let mut vmm = vmm_with(&mut pool);

        vmm.map_range(
            0x4008_0000,
            0x4008_1000,
            0x4008_0000,
            PageFlags::KERNEL_CODE,
            &mut pool,
        )
        .unwrap();
        vmm.install_uart(&mut pool).unwrap();

        let spots = [
            CriticalSpot::code("pc", 0x4008_0000),
            CriticalSpot::data("uart-virt", config::UART_VIRT_BASE),
            CriticalSpot::data("uart-phys", config::UART_PHYS_BASE),
        ];
        let report = verify(&vmm, &spots).unwrap();
        assert_eq!(report, VerifyReport { checked: 3, repaired: 0 });
    }
}
