//! C1: Boot Memory-Map Importer.
//!
//! Copies the firmware-provided memory map into an owned, stable-address
//! array and sizes the [`crate::mm::page`] table to cover all of physical
//! memory, grounded on `original_source/kernel/src/mm/mem_init.c`'s
//! `early_mem_init` (that file also allocates the `Page` table; here the
//! sizing/import step is split from the allocation step, which lives in
//! [`crate::mm::early`]).

use crate::{error::MmError, mm::addr::PAGE_SIZE, sync::OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionType {
    Usable,
    Reserved,
    BootloaderReclaimable,
    KernelModules,
    Framebuffer,
    AcpiReclaimable,
    AcpiNvs,
    Bad,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryMapEntry {
    pub start: u64,
    pub length: u64,
    pub ty: MemoryRegionType,
}

impl MemoryMapEntry {
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

pub const MAX_ENTRIES: usize = 256;

pub struct MemoryMap {
    entries: [MemoryMapEntry; MAX_ENTRIES],
    count: usize,
}

impl MemoryMap {
    pub fn entries(&self) -> &[MemoryMapEntry] {
        &self.entries[..self.count]
    }

    pub fn entries_mut(&mut self) -> &mut [MemoryMapEntry] {
        &mut self.entries[..self.count]
    }

    /// Highest end address across every entry; used to size the `Page` table.
    pub fn highest_end(&self) -> u64 {
        self.entries().iter().map(MemoryMapEntry::end).max().unwrap_or(0)
    }

    pub fn total_usable_bytes(&self) -> u64 {
        self.entries()
            .iter()
            .filter(|e| e.ty == MemoryRegionType::Usable)
            .map(|e| e.length)
            .sum()
    }

    /// Appends a new entry, as produced when [`crate::mm::early::exit`] splits
    /// a usable region around a carved-out reservation.
    ///
    /// # Errors
    /// [`MmError::InvariantViolation`] if the table is already full.
    pub fn push(&mut self, entry: MemoryMapEntry) -> Result<(), MmError> {
        if self.count >= MAX_ENTRIES {
            return Err(MmError::InvariantViolation {
                what: "memory map entry table is full",
            });
        }
        self.entries[self.count] = entry;
        self.count += 1;
        Ok(())
    }

    /// Page-aligns every usable entry's start upward, shrinking `length`
    /// accordingly, and returns the number of bytes cut off. Mirrors
    /// `early_mem_exit`'s sanity pass in the source.
    pub fn align_usable_entries(&mut self) -> u64 {
        let mut consumed = 0u64;
        for entry in self.entries_mut() {
            if entry.ty != MemoryRegionType::Usable {
                continue;
            }
            let aligned = (entry.start + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            let cut = aligned - entry.start;
            if cut >= entry.length {
                entry.length = 0;
            } else {
                entry.length -= cut;
            }
            entry.start = aligned;
            consumed += cut;
        }
        consumed
    }
}

static MEMORY_MAP: OnceLock<spin::Mutex<MemoryMap>> = OnceLock::new();

/// Imports up to `count` raw `(start, length, type)` tuples (as produced by
/// `arch::x86_64::boot::BootData`) into the owned [`MemoryMap`].
///
/// # Errors
/// Returns [`MmError::ConfigurationFault`] if the firmware supplied zero
/// entries or more entries than [`MAX_ENTRIES`].
pub fn import(raw: &[(u64, u64, MemoryRegionType)]) -> Result<(), MmError> {
    if raw.is_empty() {
        return Err(MmError::ConfigurationFault {
            reason: "firmware memory map is empty",
        });
    }
    if raw.len() > MAX_ENTRIES {
        return Err(MmError::ConfigurationFault {
            reason: "firmware memory map exceeds MAX_ENTRIES",
        });
    }

    let mut entries = [MemoryMapEntry {
        start: 0,
        length: 0,
        ty: MemoryRegionType::Bad,
    }; MAX_ENTRIES];
    for (i, (start, length, ty)) in raw.iter().enumerate() {
        entries[i] = MemoryMapEntry {
            start: *start,
            length: *length,
            ty: *ty,
        };
    }

    let map = MemoryMap {
        entries,
        count: raw.len(),
    };
    MEMORY_MAP
        .set(spin::Mutex::new(map))
        .map_err(|_| MmError::InvariantViolation {
            what: "memmap::import called more than once",
        })
}

pub fn with_map<R>(f: impl FnOnce(&mut MemoryMap) -> R) -> R {
    let lock = MEMORY_MAP.get().expect("memmap::import not yet called");
    f(&mut lock.lock())
}

/// Drops any previously imported map so a test can call [`import`] again.
/// Nothing in the running kernel calls this.
#[cfg(all(test, not(target_os = "none")))]
pub fn reset_for_test() {
    MEMORY_MAP.take();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn sample() -> MemoryMap {
        let mut entries = [MemoryMapEntry {
            start: 0,
            length: 0,
            ty: MemoryRegionType::Bad,
        }; MAX_ENTRIES];
        entries[0] = MemoryMapEntry {
            start: 0,
            length: 0x10_0000,
            ty: MemoryRegionType::Reserved,
        };
        entries[1] = MemoryMapEntry {
            start: 0x10_0000,
            length: 511 * 0x10_0000,
            ty: MemoryRegionType::Usable,
        };
        MemoryMap { entries, count: 2 }
    }

    #[test]
    fn highest_end_is_max_of_entry_ends() {
        let map = sample();
        assert_eq!(map.highest_end(), 512 * 0x10_0000);
    }

    #[test]
    fn align_usable_entries_cuts_subpage_remainder() {
        let mut map = sample();
        map.entries_mut()[1].start += 37;
        map.entries_mut()[1].length -= 37;
        let cut = map.align_usable_entries();
        assert_eq!(cut, PAGE_SIZE - 37);
        assert_eq!(map.entries()[1].start % PAGE_SIZE, 0);
    }
}
