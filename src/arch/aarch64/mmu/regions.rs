//! Audit log of every installed mapping.
//!
//! A bounded, append-only record of (virtual range, physical base,
//! attributes, name) tuples. It exists purely for verification and boot
//! diagnostics; the enable path never consults it, and running out of slots
//! drops the record rather than failing the mapping.

use crate::config;
use crate::println;

use super::descriptor::PageFlags;

/// One installed region.
#[derive(Clone, Copy, Debug)]
pub struct Region {
    pub virt_start: usize,
    /// Exclusive end of the virtual range.
    pub virt_end: usize,
    pub phys_start: usize,
    pub flags: PageFlags,
    pub name: &'static str,
}

/// Append-only region log, bounded at compile time.
pub struct RegionLog {
    entries: [Option<Region>; config::MAX_REGIONS],
    len: usize,
    dropped: usize,
}

impl RegionLog {
    pub const fn new() -> Self {
        Self {
            entries: [None; config::MAX_REGIONS],
            len: 0,
            dropped: 0,
        }
    }

    /// Record a region. On overflow the record is dropped with a diagnostic;
    /// registration never fails the mapping it describes.
    pub fn register(&mut self, region: Region) {
        if self.len == self.entries.len() {
            self.dropped += 1;
            println!(
                "[vm] region log full, dropping {} {:#x}..{:#x}",
                region.name, region.virt_start, region.virt_end
            );
            return;
        }
        self.entries[self.len] = Some(region);
        self.len += 1;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.entries[..self.len].iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Records refused because the log was full.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Print every recorded region.
    pub fn dump(&self) {
        for region in self.iter() {
            println!(
                "[vm]   {:<12} {:#018x}..{:#018x} -> {:#010x} attr{} {}{}{}",
                region.name,
                region.virt_start,
                region.virt_end,
                region.phys_start,
                region.flags.attr_index(),
                if region.flags.contains(PageFlags::PXN) { "-" } else { "x" },
                match region.flags.access_permission() {
                    0b00 => "rw",
                    0b01 => "RW",
                    0b10 => "ro",
                    _ => "RO",
                },
                if region.flags.contains(PageFlags::UXN) { "" } else { "u" },
            );
        }
        if self.dropped > 0 {
            println!("[vm]   ({} records dropped)", self.dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(name: &'static str, base: usize) -> Region {
        Region {
            virt_start: base,
            virt_end: base + config::PAGE_SIZE,
            phys_start: base,
            flags: PageFlags::KERNEL_DATA,
            name,
        }
    }

    #[test]
    fn registers_in_order() {
        let mut log = RegionLog::new();
        log.register(region("a", 0x1000));
        log.register(region("b", 0x2000));

        let names: Vec<&str> = log.iter().map(|r| r.name).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(log.len(), 2);
        assert_eq!(log.dropped(), 0);
    }

    #[test]
    fn overflow_drops_without_failing() {
        let mut log = RegionLog::new();
        for i in 0..config::MAX_REGIONS {
            log.register(region("fill", i * config::PAGE_SIZE));
        }
        log.register(region("extra", 0xdead_0000));
        log.register(region("extra2", 0xbeef_0000));

        assert_eq!(log.len(), config::MAX_REGIONS);
        assert_eq!(log.dropped(), 2);
        assert!(log.iter().all(|r| r.name == "fill"));
    }
}
