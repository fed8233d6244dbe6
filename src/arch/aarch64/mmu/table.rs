//! Translation tables and table walks.
//!
//! Four levels (L0..L3) of 512-entry tables translate a 48-bit virtual
//! address with a 4 KiB granule; each level consumes 9 bits. In the 39-bit
//! configuration the hardware starts the walk at L1, and so does the code
//! here. Tables live in frames handed out by the allocator and are reached
//! through raw pointers, because during bring-up physical and virtual
//! addresses coincide.

use crate::arch::aarch64::cache;
use crate::mm::frames::FrameAlloc;

use super::descriptor::{DecodeError, Descriptor, Pte};

/// Entries per 4 KiB table.
pub const ENTRIES: usize = 512;

/// One level of the translation hierarchy, carrying its index shift.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    L0,
    L1,
    L2,
    L3,
}

impl Level {
    /// Bit position of this level's 9-bit index within a virtual address.
    pub const fn shift(self) -> u32 {
        match self {
            Level::L0 => 39,
            Level::L1 => 30,
            Level::L2 => 21,
            Level::L3 => 12,
        }
    }

    /// Index of `va` within a table of this level.
    pub const fn index(self, va: usize) -> usize {
        (va >> self.shift()) & (ENTRIES - 1)
    }

    pub const fn next(self) -> Option<Level> {
        match self {
            Level::L0 => Some(Level::L1),
            Level::L1 => Some(Level::L2),
            Level::L2 => Some(Level::L3),
            Level::L3 => None,
        }
    }
}

/// Level the hardware walk starts at for the configured address width.
#[cfg(not(feature = "va39"))]
pub const START_LEVEL: Level = Level::L0;
#[cfg(feature = "va39")]
pub const START_LEVEL: Level = Level::L1;

/// The non-terminal levels of a walk, in descent order.
#[cfg(not(feature = "va39"))]
const fn walk_levels() -> &'static [Level] {
    &[Level::L0, Level::L1, Level::L2]
}

#[cfg(feature = "va39")]
const fn walk_levels() -> &'static [Level] {
    &[Level::L1, Level::L2]
}

/// A naturally aligned translation table: 512 descriptors, 4 KiB.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [Pte; ENTRIES],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [Pte::INVALID; ENTRIES],
        }
    }
}

/// Pointer to the descriptor slot `index` of `table`.
///
/// # Safety
/// `table` must point at a live, 4 KiB-aligned translation table and
/// `index` must be below [`ENTRIES`].
pub unsafe fn entry_ptr(table: *mut PageTable, index: usize) -> *mut Pte {
    debug_assert!(index < ENTRIES);
    // SAFETY: In-bounds projection per the caller's contract.
    unsafe { (table as *mut Pte).add(index) }
}

/// Volatile read of one descriptor. Tables are shared with the hardware
/// walker, so ordinary loads must not be reordered or elided.
///
/// # Safety
/// Same contract as [`entry_ptr`].
pub unsafe fn load_entry(table: *mut PageTable, index: usize) -> Pte {
    // SAFETY: Caller upholds the entry_ptr contract.
    unsafe { entry_ptr(table, index).read_volatile() }
}

/// Reasons a descending walk can stop short.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkError {
    /// The frame allocator is exhausted; the mapping is skipped.
    OutOfFrames { va: usize, level: Level },
    /// A descriptor this kernel never writes (block or reserved encoding).
    BadDescriptor { va: usize, error: DecodeError },
}

/// Descend from `root`, returning the L3 table that governs `va` and
/// allocating any missing intermediate tables along the way.
///
/// Each freshly published table descriptor is cache-cleaned and followed by
/// a DSB before the walk continues, so the hardware walker can never see a
/// pointer to a table that is not yet visible in memory.
pub fn walk_create(
    root: *mut PageTable,
    va: usize,
    alloc: &mut dyn FrameAlloc,
) -> Result<*mut PageTable, WalkError> {
    let mut table = root;
    for &level in walk_levels() {
        let index = level.index(va);
        // SAFETY: `table` is the root or a table descriptor target, both
        // valid tables; index is masked to 9 bits.
        let slot = unsafe { entry_ptr(table, index) };
        // SAFETY: Slot is a valid descriptor location.
        let pte = unsafe { slot.read_volatile() };

        table = match pte.decode(level) {
            Ok(Descriptor::Table(next)) => next as *mut PageTable,
            Ok(Descriptor::Invalid) => {
                let frame = alloc
                    .alloc_frame()
                    .ok_or(WalkError::OutOfFrames { va, level })?;
                // SAFETY: Slot is a valid descriptor location; the frame is
                // zeroed, so publishing it cannot expose stale mappings.
                unsafe { slot.write_volatile(Pte::table(frame.addr())) };
                cache::clean_line(slot as usize);
                cache::dsb_ish();
                frame.addr() as *mut PageTable
            }
            Ok(Descriptor::Page(..)) => unreachable!("decode returns pages only at L3"),
            Err(error) => return Err(WalkError::BadDescriptor { va, error }),
        };
    }
    Ok(table)
}

/// Outcome of a non-allocating walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// Some descriptor on the path is invalid (or unusable); `level` names
    /// the first one.
    Unmapped { level: Level },
    /// Every ancestor is valid and the L3 entry is live.
    Leaf(Pte),
}

/// Walk `root` without allocating and report the live leaf for `va`.
pub fn lookup(root: *mut PageTable, va: usize) -> Lookup {
    let mut table = root;
    for &level in walk_levels() {
        // SAFETY: Valid table per walk invariant; index masked.
        let pte = unsafe { load_entry(table, level.index(va)) };
        match pte.decode(level) {
            Ok(Descriptor::Table(next)) => table = next as *mut PageTable,
            _ => return Lookup::Unmapped { level },
        }
    }
    // SAFETY: Ancestors were all valid tables.
    let pte = unsafe { load_entry(table, Level::L3.index(va)) };
    if pte.is_valid() {
        Lookup::Leaf(pte)
    } else {
        Lookup::Unmapped { level: Level::L3 }
    }
}

/// The live L3 entry for `va`, or the all-zero entry when any ancestor is
/// invalid.
pub fn live_pte(root: *mut PageTable, va: usize) -> Pte {
    match lookup(root, va) {
        Lookup::Leaf(pte) => pte,
        Lookup::Unmapped { .. } => Pte::INVALID,
    }
}

/// Pointer to the L3 descriptor slot for `va`, if every ancestor is valid.
/// Used by the verifier to repair a leaf in place.
pub fn leaf_slot(root: *mut PageTable, va: usize) -> Option<*mut Pte> {
    let mut table = root;
    for &level in walk_levels() {
        // SAFETY: Valid table per walk invariant; index masked.
        let pte = unsafe { load_entry(table, level.index(va)) };
        match pte.decode(level) {
            Ok(Descriptor::Table(next)) => table = next as *mut PageTable,
            _ => return None,
        }
    }
    // SAFETY: Ancestors were all valid tables.
    Some(unsafe { entry_ptr(table, Level::L3.index(va)) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::aarch64::mmu::descriptor::PageFlags;
    use crate::mm::frames::testing::HeapFrames;

    fn fresh_root(pool: &mut HeapFrames) -> *mut PageTable {
        pool.alloc_frame().unwrap().addr() as *mut PageTable
    }

    #[test]
    #[cfg(not(feature = "va39"))]
    fn walk_allocates_each_missing_level_once() {
        let mut pool = HeapFrames::new();
        let root = fresh_root(&mut pool);
        let baseline = pool.allocated();

        // First touch builds L1, L2 and L3.
        let l3_a = walk_create(root, 0x100_0000, &mut pool).unwrap();
        assert_eq!(pool.allocated() - baseline, 3);

        // A sibling page in the same 2 MiB region reuses all of them.
        let l3_b = walk_create(root, 0x100_1000, &mut pool).unwrap();
        assert_eq!(pool.allocated() - baseline, 3);
        assert_eq!(l3_a, l3_b);

        // A different 1 GiB region shares only the L1 table.
        let l3_c = walk_create(root, 0x4000_0000, &mut pool).unwrap();
        assert_eq!(pool.allocated() - baseline, 5);
        assert_ne!(l3_a, l3_c);
    }

    #[test]
    fn walk_surfaces_allocator_exhaustion() {
        // The root eats one frame, leaving one fewer than the walk needs.
        let mut pool = HeapFrames::with_limit(walk_levels().len());
        let root = fresh_root(&mut pool);
        assert!(matches!(
            walk_create(root, 0x100_0000, &mut pool),
            Err(WalkError::OutOfFrames { va: 0x100_0000, .. })
        ));
    }

    #[test]
    #[cfg(not(feature = "va39"))]
    fn walk_refuses_block_descriptors() {
        let mut pool = HeapFrames::new();
        let root = fresh_root(&mut pool);
        let _ = walk_create(root, 0x100_0000, &mut pool).unwrap();

        // Forge a block descriptor (valid, bit 1 clear) where a table
        // pointer should be.
        let l1_idx = Level::L1.index(0x100_0000);
        let l1 = match unsafe { load_entry(root, Level::L0.index(0x100_0000)) }
            .decode(Level::L0)
            .unwrap()
        {
            Descriptor::Table(pa) => pa as *mut PageTable,
            other => panic!("expected table, got {other:?}"),
        };
        unsafe {
            entry_ptr(l1, l1_idx).write_volatile(Pte::from_raw(0x4000_0000 | 1));
        }

        assert!(matches!(
            walk_create(root, 0x100_0000, &mut pool),
            Err(WalkError::BadDescriptor { .. })
        ));
        assert!(matches!(
            lookup(root, 0x100_0000),
            Lookup::Unmapped { level: Level::L1 }
        ));
    }

    #[test]
    fn lookup_reports_unmapped_under_invalid_ancestors() {
        let mut pool = HeapFrames::new();
        let root = fresh_root(&mut pool);

        assert_eq!(
            lookup(root, 0x100_0000),
            Lookup::Unmapped { level: START_LEVEL }
        );
        assert_eq!(live_pte(root, 0x100_0000), Pte::INVALID);

        // With ancestors built but no leaf written, the hole moves to L3.
        let _ = walk_create(root, 0x100_0000, &mut pool).unwrap();
        assert_eq!(
            lookup(root, 0x100_0000),
            Lookup::Unmapped { level: Level::L3 }
        );
        assert_eq!(live_pte(root, 0x100_0000), Pte::INVALID);
    }

    #[test]
    fn lookup_returns_the_written_leaf() {
        let mut pool = HeapFrames::new();
        let root = fresh_root(&mut pool);

        let l3 = walk_create(root, 0x100_0000, &mut pool).unwrap();
        let leaf = Pte::page(0x4400_0000, PageFlags::KERNEL_DATA);
        unsafe {
            entry_ptr(l3, Level::L3.index(0x100_0000)).write_volatile(leaf);
        }

        assert_eq!(lookup(root, 0x100_0000), Lookup::Leaf(leaf));
        assert_eq!(live_pte(root, 0x100_0000), leaf);
        assert_eq!(
            leaf_slot(root, 0x100_0000).unwrap() as usize,
            unsafe { entry_ptr(l3, Level::L3.index(0x100_0000)) } as usize
        );
    }

    #[test]
    fn level_indices_split_the_address() {
        let va = 0x0000_7FC0_1234_5000;
        assert_eq!(Level::L0.index(va), (va >> 39) & 0x1FF);
        assert_eq!(Level::L1.index(va), (va >> 30) & 0x1FF);
        assert_eq!(Level::L2.index(va), (va >> 21) & 0x1FF);
        assert_eq!(Level::L3.index(va), (va >> 12) & 0x1FF);

        // High-half addresses index identically: the sign bits sit above
        // the L0 field.
        let high = 0xFFFF_0000_0900_0000_usize;
        assert_eq!(Level::L0.index(high), 0);
        assert_eq!(Level::L3.index(high), (0x0900_0000 >> 12) & 0x1FF);
    }
}
