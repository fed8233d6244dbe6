//! Virtual-memory bring-up.
//!
//! This module owns the transition from physical to virtual addressing:
//! building both translation trees, installing the kernel's sections, the
//! UART (identity and high-half alias), the exception vectors and the code
//! window that must stay fetchable while the MMU comes up, then verifying
//! the lot and flipping SCTLR_EL1.M.
//!
//! All state lives in one [`Vmm`] value that is threaded explicitly through
//! every operation; nothing here hides behind module globals. The only
//! process-wide cell in the whole story is the UART base pointer, which the
//! post-enable continuation has to publish (see `drivers::uart`).

pub mod descriptor;
pub mod enable;
pub mod map;
pub mod regions;
pub mod table;
pub mod verify;

use crate::arch::aarch64::cache;
use crate::config;
use crate::mm::frames::FrameAlloc;
use crate::println;

use descriptor::{PageFlags, Pte};
use map::MapError;
use regions::{Region, RegionLog};
use table::PageTable;
use verify::CriticalSpot;

pub use enable::{EnableError, enable, enable_entry};
pub use verify::{VerifyError, VerifyReport};

/// Addresses of everything the installer must map, gathered from the linker
/// script and live registers on the real machine and synthesized in tests.
///
/// All values are physical; nothing virtual exists yet when this is built.
#[derive(Clone, Copy, Debug)]
pub struct KernelLayout {
    pub text_start: usize,
    pub text_end: usize,
    pub rodata_start: usize,
    pub rodata_end: usize,
    pub data_start: usize,
    pub data_end: usize,
    pub bss_start: usize,
    pub bss_end: usize,
    /// Base of the exception vector table (2 KiB-aligned, inside .text).
    pub vector_base: usize,
    /// Entry of the MMU-enable trampoline.
    pub enable_entry: usize,
    /// Entry of the post-enable continuation routine.
    pub continuation_entry: usize,
    /// Program counter near the point of enable.
    pub boot_pc: usize,
    /// Live stack pointer during bring-up.
    pub boot_sp: usize,
}

#[cfg(target_os = "none")]
unsafe extern "C" {
    static __text_start: u8;
    static __text_end: u8;
    static __rodata_start: u8;
    static __rodata_end: u8;
    static __data_start: u8;
    static __data_end: u8;
    static __bss_start: u8;
    static __bss_end: u8;
}

impl KernelLayout {
    /// Collect the layout from linker symbols and the live PC/SP.
    #[cfg(target_os = "none")]
    pub fn from_linker(enable_entry: usize, continuation_entry: usize) -> Self {
        use crate::arch::aarch64::cpu;
        use core::ptr::addr_of;

        // SAFETY: Linker-script symbols; only their addresses are taken.
        unsafe {
            Self {
                text_start: addr_of!(__text_start) as usize,
                text_end: addr_of!(__text_end) as usize,
                rodata_start: addr_of!(__rodata_start) as usize,
                rodata_end: addr_of!(__rodata_end) as usize,
                data_start: addr_of!(__data_start) as usize,
                data_end: addr_of!(__data_end) as usize,
                bss_start: addr_of!(__bss_start) as usize,
                bss_end: addr_of!(__bss_end) as usize,
                vector_base: crate::arch::aarch64::exceptions::vector_table_addr(),
                enable_entry,
                continuation_entry,
                boot_pc: cpu::read_pc(),
                boot_sp: cpu::read_sp(),
            }
        }
    }
}

/// Identity window that must stay fetchable across the instant translation
/// turns on: the smallest page-aligned span covering the enable trampoline,
/// the continuation and the current PC, padded generously on both sides.
///
/// The pad is deliberately oversized; if the three addresses are so far
/// apart that the window blows past [`config::TRANSITION_CAP`], the full
/// span is kept anyway and the size is logged, because clipping could evict
/// one of the three addresses from the window.
pub fn transition_window(enable_entry: usize, continuation_entry: usize, pc: usize) -> (usize, usize) {
    let lo = enable_entry.min(continuation_entry).min(pc);
    let hi = enable_entry.max(continuation_entry).max(pc);

    let lo = config::page_floor(lo).saturating_sub(config::TRANSITION_PAD);
    let hi = config::page_floor(hi) + config::PAGE_SIZE + config::TRANSITION_PAD;

    if hi - lo > config::TRANSITION_CAP {
        println!(
            "[vm] transition window {:#x}..{:#x} exceeds the {} KiB cap; keeping the full span",
            lo,
            hi,
            config::TRANSITION_CAP / 1024
        );
    }
    (lo, hi)
}

/// The whole virtual-memory bring-up state: both translation trees, the
/// region log and the saved vector-table page.
pub struct Vmm {
    /// Physical base of the L0 table walked for low-half addresses (TTBR0).
    low_root: usize,
    /// Physical base of the L0 table walked for high-half addresses (TTBR1).
    high_root: usize,
    pub regions: RegionLog,
    /// Page holding the installed exception vectors, recorded so the enable
    /// path can cross-check VBAR_EL1 against it.
    vector_page: Option<usize>,
}

/// Result of one full section-install pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Mapping operations that completed.
    pub installed: usize,
    /// Operations logged and skipped (allocator exhaustion etc.).
    pub skipped: usize,
}

impl Vmm {
    /// Allocate and clean both root tables. `None` means the frame
    /// allocator could not even provide two frames, which is fatal for
    /// bring-up and left to the caller to report.
    pub fn new(alloc: &mut dyn FrameAlloc) -> Option<Self> {
        let low = alloc.alloc_frame()?;
        let high = alloc.alloc_frame()?;
        cache::clean_range(low.addr(), config::PAGE_SIZE);
        cache::clean_range(high.addr(), config::PAGE_SIZE);
        Some(Self {
            low_root: low.addr(),
            high_root: high.addr(),
            regions: RegionLog::new(),
            vector_page: None,
        })
    }

    /// Physical base for TTBR0_EL1.
    pub fn ttbr0_base(&self) -> usize {
        self.low_root
    }

    /// Physical base for TTBR1_EL1.
    pub fn ttbr1_base(&self) -> usize {
        self.high_root
    }

    /// Page holding the exception vectors, once installed.
    pub fn vector_page(&self) -> Option<usize> {
        self.vector_page
    }

    /// Root table governing `va`: high half above the kernel base, low half
    /// below it.
    pub fn root_for(&self, va: usize) -> *mut PageTable {
        if va >= config::HIGH_BASE {
            self.high_root as *mut PageTable
        } else {
            self.low_root as *mut PageTable
        }
    }

    /// Map `[va_start, va_end)` onto `pa_start..`, overwriting existing
    /// leaves. The range must sit entirely in one half, and pages whose
    /// physical frame is the UART are refused (the UART has a dedicated
    /// install path).
    pub fn map_range(
        &mut self,
        va_start: usize,
        va_end: usize,
        pa_start: usize,
        flags: PageFlags,
        alloc: &mut dyn FrameAlloc,
    ) -> Result<usize, MapError> {
        self.check_one_half(va_start, va_end)?;
        map::map_range_in(
            self.root_for(va_start),
            va_start,
            va_end,
            pa_start,
            flags,
            alloc,
            true,
            false,
        )
    }

    /// Like [`Vmm::map_range`] but leaves already-live leaves untouched.
    /// Used for the transition and stack windows, which may overlap kernel
    /// sections that already carry more precise attributes.
    pub fn fill_range(
        &mut self,
        va_start: usize,
        va_end: usize,
        pa_start: usize,
        flags: PageFlags,
        alloc: &mut dyn FrameAlloc,
    ) -> Result<usize, MapError> {
        self.check_one_half(va_start, va_end)?;
        map::map_range_in(
            self.root_for(va_start),
            va_start,
            va_end,
            pa_start,
            flags,
            alloc,
            true,
            true,
        )
    }

    fn check_one_half(&self, va_start: usize, va_end: usize) -> Result<(), MapError> {
        if va_start < va_end && (va_start >= config::HIGH_BASE) != (va_end - 1 >= config::HIGH_BASE)
        {
            return Err(MapError::StraddlesHalves { va_start, va_end });
        }
        Ok(())
    }

    /// Install the UART MMIO page exactly twice: identity at its physical
    /// address and aliased into the high half, with identical Device-nGnRE
    /// attributes so the two aliases can never disagree.
    pub fn install_uart(&mut self, alloc: &mut dyn FrameAlloc) -> Result<(), MapError> {
        let pa = config::UART_PHYS_BASE;
        let virt = config::UART_VIRT_BASE;

        map::map_page(self.root_for(pa), pa, pa, PageFlags::DEVICE, alloc)?;
        self.regions.register(Region {
            virt_start: pa,
            virt_end: pa + config::PAGE_SIZE,
            phys_start: pa,
            flags: PageFlags::DEVICE,
            name: "uart-ident",
        });

        map::map_page(self.root_for(virt), virt, pa, PageFlags::DEVICE, alloc)?;
        self.regions.register(Region {
            virt_start: virt,
            virt_end: virt + config::PAGE_SIZE,
            phys_start: pa,
            flags: PageFlags::DEVICE,
            name: "uart-virt",
        });
        Ok(())
    }

    /// One region install: map (replace or fill), register, or log and
    /// count the skip. Bring-up continues past individual failures; the
    /// verifier decides later whether anything vital is missing.
    fn install_region(
        &mut self,
        report: &mut InstallReport,
        name: &'static str,
        va_start: usize,
        va_end: usize,
        pa_start: usize,
        flags: PageFlags,
        fill: bool,
        alloc: &mut dyn FrameAlloc,
    ) {
        if va_start >= va_end {
            return;
        }
        let result = if fill {
            self.fill_range(va_start, va_end, pa_start, flags, alloc)
        } else {
            self.map_range(va_start, va_end, pa_start, flags, alloc)
        };
        match result {
            Ok(_) => {
                self.regions.register(Region {
                    virt_start: va_start,
                    virt_end: va_end,
                    phys_start: pa_start,
                    flags,
                    name,
                });
                report.installed += 1;
            }
            Err(error) => {
                println!("[vm] {} skipped: {:?}", name, error);
                report.skipped += 1;
            }
        }
    }

    /// Install everything the enable sequence depends on:
    ///
    /// 1. UART, identity and high alias (dedicated path);
    /// 2. kernel sections from the linker layout, identity-mapped with
    ///    per-section attributes;
    /// 3. the vector-table page, executable, remembered for the VBAR check;
    /// 4. the transition window around {enable entry, continuation, PC},
    ///    identity plus high alias;
    /// 5. a window around the live stack pointer, identity plus high alias;
    /// 6. the two root tables themselves, so post-enable table maintenance
    ///    cannot fault.
    pub fn install_sections(
        &mut self,
        layout: &KernelLayout,
        alloc: &mut dyn FrameAlloc,
    ) -> InstallReport {
        let mut report = InstallReport::default();

        if let Err(error) = self.install_uart(alloc) {
            println!("[vm] uart install skipped: {:?}", error);
            report.skipped += 1;
        } else {
            report.installed += 1;
        }

        self.install_region(
            &mut report,
            ".text",
            layout.text_start,
            layout.text_end,
            layout.text_start,
            PageFlags::KERNEL_CODE,
            false,
            alloc,
        );
        self.install_region(
            &mut report,
            ".rodata",
            layout.rodata_start,
            layout.rodata_end,
            layout.rodata_start,
            PageFlags::KERNEL_RODATA,
            false,
            alloc,
        );
        self.install_region(
            &mut report,
            ".data",
            layout.data_start,
            layout.data_end,
            layout.data_start,
            PageFlags::KERNEL_DATA,
            false,
            alloc,
        );
        self.install_region(
            &mut report,
            ".bss",
            layout.bss_start,
            layout.bss_end,
            layout.bss_start,
            PageFlags::KERNEL_DATA,
            false,
            alloc,
        );

        let vector_page = config::page_floor(layout.vector_base);
        self.install_region(
            &mut report,
            "vectors",
            vector_page,
            vector_page + config::PAGE_SIZE,
            vector_page,
            PageFlags::KERNEL_CODE,
            false,
            alloc,
        );
        self.vector_page = Some(vector_page);

        let (window_lo, window_hi) = transition_window(
            layout.enable_entry,
            layout.continuation_entry,
            layout.boot_pc,
        );
        self.install_region(
            &mut report,
            "transition",
            window_lo,
            window_hi,
            window_lo,
            PageFlags::KERNEL_CODE,
            true,
            alloc,
        );
        self.install_region(
            &mut report,
            "transition-hi",
            config::HIGH_BASE | window_lo,
            config::HIGH_BASE | window_hi,
            window_lo,
            PageFlags::KERNEL_CODE,
            true,
            alloc,
        );

        let stack_lo = config::page_floor(layout.boot_sp.saturating_sub(config::STACK_PAD_BELOW));
        let stack_hi = config::page_ceil(layout.boot_sp + config::STACK_PAD_ABOVE);
        self.install_region(
            &mut report,
            "stack",
            stack_lo,
            stack_hi,
            stack_lo,
            PageFlags::KERNEL_DATA,
            true,
            alloc,
        );
        self.install_region(
            &mut report,
            "stack-hi",
            config::HIGH_BASE | stack_lo,
            config::HIGH_BASE | stack_hi,
            stack_lo,
            PageFlags::KERNEL_DATA,
            true,
            alloc,
        );

        let (ttbr0, ttbr1) = (self.low_root, self.high_root);
        self.install_region(
            &mut report,
            "ttbr0-root",
            ttbr0,
            ttbr0 + config::PAGE_SIZE,
            ttbr0,
            PageFlags::KERNEL_DATA,
            true,
            alloc,
        );
        self.install_region(
            &mut report,
            "ttbr1-root",
            ttbr1,
            ttbr1 + config::PAGE_SIZE,
            ttbr1,
            PageFlags::KERNEL_DATA,
            true,
            alloc,
        );

        report
    }

    /// The addresses whose mappings must hold at the instant the M-bit is
    /// written. Only the vector-table entry is repairable.
    pub fn critical_spots(&self, layout: &KernelLayout) -> [CriticalSpot; 7] {
        [
            CriticalSpot {
                name: "vectors",
                va: self
                    .vector_page
                    .unwrap_or(config::page_floor(layout.vector_base)),
                executable: true,
                repair_exec: true,
            },
            CriticalSpot::data("uart-virt", config::UART_VIRT_BASE),
            CriticalSpot::data("uart-phys", config::UART_PHYS_BASE),
            CriticalSpot::code("pc", layout.boot_pc),
            CriticalSpot::data("sp", layout.boot_sp),
            CriticalSpot::code("mmu-enable", layout.enable_entry),
            CriticalSpot::code("continuation", layout.continuation_entry),
        ]
    }

    /// The live L3 entry for `va` (all-zero when unmapped).
    pub fn live_pte(&self, va: usize) -> Pte {
        table::live_pte(self.root_for(va), va)
    }

    /// Re-walk the first page of every registered region and report
    /// disagreement between the record and the live tables. Purely
    /// diagnostic; the result gates nothing.
    pub fn audit(&self) -> AuditReport {
        let mut report = AuditReport::default();
        for region in self.regions.iter() {
            report.checked += 1;
            let pte = self.live_pte(region.virt_start);
            let ok = pte.is_valid()
                && pte.output_address() == region.phys_start
                && pte.flags().attr_index() == region.flags.attr_index()
                && pte.flags().access_permission() == region.flags.access_permission()
                && pte.flags().contains(PageFlags::PXN) == region.flags.contains(PageFlags::PXN)
                && pte.flags().contains(PageFlags::UXN) == region.flags.contains(PageFlags::UXN);
            if !ok {
                report.mismatched += 1;
                println!(
                    "[vm] audit mismatch: {} at {:#x}: recorded {:#x}, live {:#x}",
                    region.name,
                    region.virt_start,
                    Pte::page(region.phys_start, region.flags).raw(),
                    pte.raw()
                );
            }
        }
        report
    }
}

/// Outcome of [`Vmm::audit`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub checked: usize,
    pub mismatched: usize,
}
