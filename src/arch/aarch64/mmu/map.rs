//! Leaf-entry installation with the cache/TLB maintenance discipline.
//!
//! Every descriptor write follows the same ordering: clean the line, write,
//! clean again, invalidate the page's TLB entry inner-shareable, DSB. A
//! concurrent table walk therefore observes either the old entry (and its
//! invalidation) or the fully committed new one, never a torn value. After
//! a whole range is installed, one broadcast invalidation and an ISB close
//! it out.

use crate::arch::aarch64::cache;
use crate::config;
use crate::mm::frames::FrameAlloc;
use crate::println;

use super::descriptor::{PageFlags, Pte};
use super::table::{self, Level, PageTable, WalkError};

/// Ways a mapping request can be refused. Refusals are logged by the caller
/// and never fatal during bring-up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual or physical start not on a page boundary.
    Unaligned { va: usize, pa: usize },
    /// The virtual range crosses the TTBR0/TTBR1 boundary.
    StraddlesHalves { va_start: usize, va_end: usize },
    /// The descending walk failed (allocator exhausted or corrupt table).
    Walk(WalkError),
}

impl From<WalkError> for MapError {
    fn from(error: WalkError) -> Self {
        MapError::Walk(error)
    }
}

/// Commit one leaf descriptor with the full write discipline.
///
/// # Safety
/// `slot` must point at the L3 descriptor governing `va`.
pub(crate) unsafe fn write_leaf(slot: *mut Pte, va: usize, pte: Pte) {
    cache::clean_line(slot as usize);
    // SAFETY: Caller guarantees `slot` is the live descriptor for `va`.
    unsafe { slot.write_volatile(pte) };
    cache::clean_line(slot as usize);
    cache::tlb_invalidate_page(va);
    cache::dsb_ish();
}

/// Map a single page `va -> pa` under `root`.
pub(crate) fn map_page(
    root: *mut PageTable,
    va: usize,
    pa: usize,
    flags: PageFlags,
    alloc: &mut dyn FrameAlloc,
) -> Result<(), MapError> {
    if va % config::PAGE_SIZE != 0 || pa % config::PAGE_SIZE != 0 {
        return Err(MapError::Unaligned { va, pa });
    }
    let l3 = table::walk_create(root, va, alloc)?;
    // SAFETY: walk_create returned the L3 table governing `va`.
    unsafe {
        let slot = table::entry_ptr(l3, Level::L3.index(va));
        write_leaf(slot, va, Pte::page(pa, flags));
    }
    Ok(())
}

/// Map `[va_start, va_end)` onto the physical range starting at `pa_start`,
/// page by page, under a single root.
///
/// With `guard_uart` set (every generic caller), pages whose physical frame
/// is the UART MMIO frame are skipped: the UART is installed exactly twice
/// by its dedicated path, and letting a generic mapping reach it would
/// create aliases with mismatched attributes.
///
/// With `keep_existing` set, pages that already have a live leaf keep it
/// untouched; only holes are filled. The transition and stack windows use
/// this so they never downgrade the attributes of a kernel section they
/// overlap.
///
/// Returns the number of leaf entries written.
pub(crate) fn map_range_in(
    root: *mut PageTable,
    va_start: usize,
    va_end: usize,
    pa_start: usize,
    flags: PageFlags,
    alloc: &mut dyn FrameAlloc,
    guard_uart: bool,
    keep_existing: bool,
) -> Result<usize, MapError> {
    if va_start % config::PAGE_SIZE != 0 || pa_start % config::PAGE_SIZE != 0 {
        return Err(MapError::Unaligned {
            va: va_start,
            pa: pa_start,
        });
    }

    let mut written = 0;
    let mut result = Ok(());
    let mut offset = 0;
    while va_start + offset < va_end {
        let va = va_start + offset;
        let pa = pa_start + offset;
        offset += config::PAGE_SIZE;

        if guard_uart && pa == config::UART_PHYS_BASE {
            println!(
                "[vm] skip: UART frame {:#x} only mapped via its dedicated path",
                pa
            );
            continue;
        }

        if keep_existing && table::live_pte(root, va).is_valid() {
            continue;
        }

        if let Err(error) = map_page(root, va, pa, flags, alloc) {
            result = Err(error);
            break;
        }
        written += 1;
    }

    // Close the range out even if it was cut short, so any entries already
    // written are globally visible.
    cache::tlb_invalidate_all();
    cache::isb();

    result.map(|()| written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::aarch64::mmu::table::live_pte;
    use crate::mm::frames::testing::HeapFrames;

    fn fresh_root(pool: &mut HeapFrames) -> *mut PageTable {
        pool.alloc_frame().unwrap().addr() as *mut PageTable
    }

    #[test]
    fn range_maps_every_page_with_offset_arithmetic() {
        let mut pool = HeapFrames::new();
        let root = fresh_root(&mut pool);

        let written = map_range_in(
            root,
            0x20_0000,
            0x20_4000,
            0x4400_0000,
            PageFlags::KERNEL_DATA,
            &mut pool,
            true,
            false,
        )
        .unwrap();
        assert_eq!(written, 4);

        for page in 0..4 {
            let pte = live_pte(root, 0x20_0000 + page * config::PAGE_SIZE);
            assert!(pte.is_valid());
            assert_eq!(pte.output_address(), 0x4400_0000 + page * config::PAGE_SIZE);
            assert_eq!(pte.flags(), PageFlags::KERNEL_DATA);
        }
    }

    #[test]
    fn unaligned_requests_are_refused() {
        let mut pool = HeapFrames::new();
        let root = fresh_root(&mut pool);

        assert!(matches!(
            map_page(root, 0x20_0800, 0x4400_0000, PageFlags::KERNEL_DATA, &mut pool),
            Err(MapError::Unaligned { .. })
        ));
        assert!(matches!(
            map_range_in(
                root,
                0x20_0000,
                0x20_1000,
                0x4400_0123,
                PageFlags::KERNEL_DATA,
                &mut pool,
                true,
                false,
            ),
            Err(MapError::Unaligned { .. })
        ));
    }

    #[test]
    fn guarded_range_skips_the_uart_frame() {
        let mut pool = HeapFrames::new();
        let root = fresh_root(&mut pool);

        let lo = config::UART_PHYS_BASE - config::PAGE_SIZE;
        let hi = config::UART_PHYS_BASE + 2 * config::PAGE_SIZE;
        let written = map_range_in(
            root,
            lo,
            hi,
            lo,
            PageFlags::KERNEL_DATA,
            &mut pool,
            true,
            false,
        )
        .unwrap();

        // Three pages in the range, one of them refused.
        assert_eq!(written, 2);
        assert_eq!(live_pte(root, config::UART_PHYS_BASE), Pte::INVALID);
        assert!(live_pte(root, lo).is_valid());
        assert!(live_pte(root, config::UART_PHYS_BASE + config::PAGE_SIZE).is_valid());
    }

    #[test]
    fn unguarded_page_map_reaches_the_uart_frame() {
        let mut pool = HeapFrames::new();
        let root = fresh_root(&mut pool);

        map_page(
            root,
            config::UART_PHYS_BASE,
            config::UART_PHYS_BASE,
            PageFlags::DEVICE,
            &mut pool,
        )
        .unwrap();
        let pte = live_pte(root, config::UART_PHYS_BASE);
        assert_eq!(pte.output_address(), config::UART_PHYS_BASE);
        assert_eq!(pte.flags(), PageFlags::DEVICE);
    }

    #[test]
    fn fill_mode_leaves_live_leaves_alone() {
        let mut pool = HeapFrames::new();
        let root = fresh_root(&mut pool);

        // One page pre-mapped with precise attributes.
        map_page(root, 0x20_1000, 0x20_1000, PageFlags::KERNEL_RODATA, &mut pool).unwrap();

        let written = map_range_in(
            root,
            0x20_0000,
            0x20_3000,
            0x20_0000,
            PageFlags::KERNEL_CODE,
            &mut pool,
            true,
            true,
        )
        .unwrap();

        // Only the two holes were filled; the pre-mapped page kept its
        // attributes.
        assert_eq!(written, 2);
        assert_eq!(live_pte(root, 0x20_1000).flags(), PageFlags::KERNEL_RODATA);
        assert_eq!(live_pte(root, 0x20_0000).flags(), PageFlags::KERNEL_CODE);
        assert_eq!(live_pte(root, 0x20_2000).flags(), PageFlags::KERNEL_CODE);
    }

    #[test]
    fn exhaustion_mid_range_surfaces_a_walk_error() {
        let mut pool = HeapFrames::new();
        let root = fresh_root(&mut pool);

        // Build the path for the first half of the range, then starve the
        // allocator before the walk crosses into the next 2 MiB region.
        let written = map_range_in(
            root,
            0x1f_e000,
            0x20_0000,
            0x4400_0000,
            PageFlags::KERNEL_DATA,
            &mut pool,
            true,
            false,
        )
        .unwrap();
        assert_eq!(written, 2);

        let mut starved = HeapFrames::with_limit(0);
        assert!(matches!(
            map_range_in(
                root,
                0x1f_e000,
                0x20_2000,
                0x4400_0000,
                PageFlags::KERNEL_DATA,
                &mut starved,
                true,
                false,
            ),
            Err(MapError::Walk(WalkError::OutOfFrames { .. }))
        ));
    }
}
