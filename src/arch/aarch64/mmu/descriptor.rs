//! Stage-1 translation descriptor encoding.
//!
//! A descriptor is a 64-bit word combining a 4 KiB-aligned output address
//! with attribute bits. Rather than pushing raw `u64`s around, reads go
//! through a single fallible decode into [`Descriptor`] and writes through a
//! single encode, so malformed encodings are caught at the boundary.
//!
//! Reference: ARM ARM Section D4.3, "VMSAv8-64 translation table format
//! descriptors".

use bitflags::bitflags;

use super::table::Level;

/// Output-address field of a descriptor (bits \[47:12\]).
pub const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// MAIR_EL1 layout.
///
/// The attribute-index field of a page descriptor selects one of these
/// slots, so the slot numbers here and the `ATTR_*` flags below must agree.
pub mod mair {
    /// Device-nGnRnE: strongly ordered MMIO.
    pub const SLOT_DEVICE_NGNRNE: u64 = 0;
    /// Normal memory, write-back, inner+outer read/write-allocate.
    pub const SLOT_NORMAL_WB: u64 = 1;
    /// Normal memory, non-cacheable.
    pub const SLOT_NORMAL_NC: u64 = 2;
    /// Device-nGnRE: MMIO that tolerates early write acknowledgement.
    pub const SLOT_DEVICE_NGNRE: u64 = 3;

    const ATTR_DEVICE_NGNRNE: u64 = 0x00;
    const ATTR_NORMAL_WB: u64 = 0xFF;
    const ATTR_NORMAL_NC: u64 = 0x44;
    const ATTR_DEVICE_NGNRE: u64 = 0x04;

    /// The value programmed into MAIR_EL1 before the MMU is enabled.
    pub const fn value() -> u64 {
        (ATTR_DEVICE_NGNRNE << (8 * SLOT_DEVICE_NGNRNE))
            | (ATTR_NORMAL_WB << (8 * SLOT_NORMAL_WB))
            | (ATTR_NORMAL_NC << (8 * SLOT_NORMAL_NC))
            | (ATTR_DEVICE_NGNRE << (8 * SLOT_DEVICE_NGNRE))
    }
}

bitflags! {
    /// Attribute bits of a stage-1 descriptor.
    ///
    /// `AP[2:1] = 0b00` (read-write, kernel only) and attribute index 0
    /// (Device-nGnRnE) are the all-zero encodings and therefore have no
    /// named flag.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// Descriptor is live (bit 0).
        const VALID          = 1 << 0;
        /// Bit 1: marks a page descriptor at L3, a table descriptor above.
        const PAGE           = 1 << 1;

        /// Attribute index 1: normal write-back memory.
        const ATTR_NORMAL_WB = 0b001 << 2;
        /// Attribute index 2: normal non-cacheable memory.
        const ATTR_NORMAL_NC = 0b010 << 2;
        /// Attribute index 3: Device-nGnRE MMIO.
        const ATTR_DEVICE    = 0b011 << 2;

        /// AP = 0b01: read-write at EL1 and EL0.
        const AP_RW_ALL      = 0b01 << 6;
        /// AP = 0b10: read-only at EL1, no EL0 access.
        const AP_RO_EL1      = 0b10 << 6;
        /// AP = 0b11: read-only at EL1 and EL0.
        const AP_RO_ALL      = 0b11 << 6;

        /// Outer shareable.
        const SH_OUTER       = 0b10 << 8;
        /// Inner shareable.
        const SH_INNER       = 0b11 << 8;

        /// Access flag; a clear AF faults on first use.
        const AF             = 1 << 10;
        /// Not global (ASID-tagged). Never set for kernel mappings.
        const NG             = 1 << 11;

        /// Privileged execute-never.
        const PXN            = 1 << 53;
        /// Unprivileged execute-never.
        const UXN            = 1 << 54;
    }
}

impl PageFlags {
    /// Kernel code: executable at EL1 only, read-only, normal write-back.
    pub const KERNEL_CODE: PageFlags = PageFlags::VALID
        .union(PageFlags::PAGE)
        .union(PageFlags::AF)
        .union(PageFlags::SH_INNER)
        .union(PageFlags::ATTR_NORMAL_WB)
        .union(PageFlags::AP_RO_EL1)
        .union(PageFlags::UXN);

    /// Kernel read-only data: like code but never executable.
    pub const KERNEL_RODATA: PageFlags = PageFlags::KERNEL_CODE.union(PageFlags::PXN);

    /// Kernel data, bss and stacks: read-write, never executable.
    pub const KERNEL_DATA: PageFlags = PageFlags::VALID
        .union(PageFlags::PAGE)
        .union(PageFlags::AF)
        .union(PageFlags::SH_INNER)
        .union(PageFlags::ATTR_NORMAL_WB)
        .union(PageFlags::PXN)
        .union(PageFlags::UXN);

    /// MMIO: Device-nGnRE, read-write at EL1, never executable.
    pub const DEVICE: PageFlags = PageFlags::VALID
        .union(PageFlags::PAGE)
        .union(PageFlags::AF)
        .union(PageFlags::ATTR_DEVICE)
        .union(PageFlags::PXN)
        .union(PageFlags::UXN);

    /// User task pages: read-write and executable at EL0.
    pub const USER_CODE: PageFlags = PageFlags::VALID
        .union(PageFlags::PAGE)
        .union(PageFlags::AF)
        .union(PageFlags::SH_INNER)
        .union(PageFlags::ATTR_NORMAL_WB)
        .union(PageFlags::AP_RW_ALL);

    /// Attribute-index field (bits \[4:2\]), an index into MAIR_EL1.
    pub const fn attr_index(self) -> u64 {
        (self.bits() >> 2) & 0b111
    }

    /// AP\[2:1\] field (bits \[7:6\]).
    pub const fn access_permission(self) -> u64 {
        (self.bits() >> 6) & 0b11
    }
}

/// Decoded view of one descriptor at a known level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Descriptor {
    /// Bit 0 clear: no mapping.
    Invalid,
    /// Pointer to the next-level table. Only legal at L0..L2.
    Table(usize),
    /// Terminal 4 KiB page mapping. Only legal at L3.
    Page(usize, PageFlags),
}

/// Encodings this kernel never produces and refuses to interpret.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// A block descriptor at L1/L2. The kernel maps 4 KiB pages
    /// exclusively, so a block here means corrupted tables.
    Block { level: Level },
    /// The reserved `0b01` encoding at L3.
    Reserved { level: Level },
}

/// A raw 64-bit translation table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    /// The all-zero, invalid entry.
    pub const INVALID: Pte = Pte(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 & PageFlags::VALID.bits() != 0
    }

    /// Output address (next-level table or mapped page).
    pub const fn output_address(self) -> usize {
        (self.0 & ADDR_MASK) as usize
    }

    /// Attribute bits with the output address masked off.
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_retain(self.0 & !ADDR_MASK)
    }

    /// Encode a table descriptor pointing at the next-level table.
    pub fn table(next_table: usize) -> Self {
        debug_assert_eq!(next_table % 4096, 0);
        Self(next_table as u64 | PageFlags::VALID.bits() | PageFlags::PAGE.bits())
    }

    /// Encode a terminal page descriptor.
    pub fn page(phys: usize, flags: PageFlags) -> Self {
        debug_assert_eq!(phys % 4096, 0);
        Self(phys as u64 & ADDR_MASK | flags.bits())
    }

    /// Interpret this entry as a descriptor of the given level.
    pub fn decode(self, level: Level) -> Result<Descriptor, DecodeError> {
        if !self.is_valid() {
            return Ok(Descriptor::Invalid);
        }
        let is_table_or_page = self.0 & PageFlags::PAGE.bits() != 0;
        match level {
            Level::L3 => {
                if is_table_or_page {
                    Ok(Descriptor::Page(self.output_address(), self.flags()))
                } else {
                    Err(DecodeError::Reserved { level })
                }
            }
            _ => {
                if is_table_or_page {
                    Ok(Descriptor::Table(self.output_address()))
                } else {
                    Err(DecodeError::Block { level })
                }
            }
        }
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pte({:#018x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mair_slots_line_up_with_attr_flags() {
        assert_eq!(mair::value(), 0x0444_FF00);
        assert_eq!(PageFlags::ATTR_NORMAL_WB.attr_index(), mair::SLOT_NORMAL_WB);
        assert_eq!(PageFlags::ATTR_NORMAL_NC.attr_index(), mair::SLOT_NORMAL_NC);
        assert_eq!(PageFlags::ATTR_DEVICE.attr_index(), mair::SLOT_DEVICE_NGNRE);
        assert_eq!(PageFlags::empty().attr_index(), mair::SLOT_DEVICE_NGNRNE);
    }

    #[test]
    fn kernel_code_is_el1_executable_read_only() {
        let f = PageFlags::KERNEL_CODE;
        assert!(!f.contains(PageFlags::PXN));
        assert!(f.contains(PageFlags::UXN));
        assert_eq!(f.access_permission(), 0b10);
        assert_eq!(f.attr_index(), mair::SLOT_NORMAL_WB);
    }

    #[test]
    fn data_and_rodata_are_never_executable() {
        assert!(PageFlags::KERNEL_RODATA.contains(PageFlags::PXN | PageFlags::UXN));
        assert!(PageFlags::KERNEL_DATA.contains(PageFlags::PXN | PageFlags::UXN));
        assert!(PageFlags::DEVICE.contains(PageFlags::PXN | PageFlags::UXN));
        // Data is read-write kernel-only: the all-zero AP encoding.
        assert_eq!(PageFlags::KERNEL_DATA.access_permission(), 0b00);
    }

    #[test]
    fn user_code_is_el0_executable() {
        let f = PageFlags::USER_CODE;
        assert!(!f.contains(PageFlags::PXN));
        assert!(!f.contains(PageFlags::UXN));
        assert_eq!(f.access_permission(), 0b01);
    }

    #[test]
    fn decode_invalid_is_invalid_at_every_level() {
        for level in [Level::L0, Level::L1, Level::L2, Level::L3] {
            assert_eq!(Pte::INVALID.decode(level), Ok(Descriptor::Invalid));
        }
    }

    #[test]
    fn decode_table_and_page() {
        let table = Pte::table(0x4100_0000);
        assert_eq!(table.decode(Level::L1), Ok(Descriptor::Table(0x4100_0000)));

        let page = Pte::page(0x0900_0000, PageFlags::DEVICE);
        match page.decode(Level::L3) {
            Ok(Descriptor::Page(pa, flags)) => {
                assert_eq!(pa, 0x0900_0000);
                assert_eq!(flags, PageFlags::DEVICE);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_blocks_and_reserved() {
        // Valid bit set, bit 1 clear.
        let block = Pte::from_raw(0x4000_0000 | 1);
        assert_eq!(
            block.decode(Level::L2),
            Err(DecodeError::Block { level: Level::L2 })
        );
        assert_eq!(
            block.decode(Level::L3),
            Err(DecodeError::Reserved { level: Level::L3 })
        );
    }

    #[test]
    fn output_address_masks_attributes() {
        let pte = Pte::page(0x4321_7000, PageFlags::KERNEL_DATA);
        assert_eq!(pte.output_address(), 0x4321_7000);
        assert_eq!(pte.flags(), PageFlags::KERNEL_DATA);
    }
}
