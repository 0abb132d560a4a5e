//! 64-bit x86-64 page-table entry encoding.
//!
//! Grounded on `original_source/kernel/include/mmu.h`'s bit layout and
//! `arch/x86-64/mmu.c`'s entry-building helpers.

use bitflags::bitflags;

use crate::mm::addr::PhysAddr;

bitflags! {
    /// Permission bits a caller may request for a leaf mapping. Mirrors
    /// `map_range`'s `access_flags ⊆ {WRITE, USER, NX}`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u64 {
        const WRITE = 1 << 0;
        const USER  = 1 << 1;
        const NX    = 1 << 2;
    }
}

/// Memory type for a mapping, encoded into `{PWT, PCD, PAT}` assuming the
/// architectural reset PAT layout (never reprogrammed — see
/// [`super::mapper::assert_pat_reset_layout`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    WriteBack,
    WriteThrough,
    Uncacheable,
    WriteCombining,
    WriteProtect,
}

impl CacheType {
    /// `(pwt, pcd, pat)` per the fixed PAT0..PAT7 reset layout.
    const fn bits(self) -> (bool, bool, bool) {
        match self {
            CacheType::WriteBack => (false, false, false),
            CacheType::WriteThrough => (false, false, true),
            CacheType::Uncacheable => (true, false, true),
            CacheType::WriteCombining => (false, true, true),
            CacheType::WriteProtect => (false, true, false),
        }
    }
}

const BIT_PRESENT: u64 = 1 << 0;
const BIT_WRITE: u64 = 1 << 1;
const BIT_USER: u64 = 1 << 2;
const BIT_PWT: u64 = 1 << 3;
const BIT_PCD: u64 = 1 << 4;
const BIT_ACCESSED: u64 = 1 << 5;
const BIT_DIRTY: u64 = 1 << 6;
/// Bit 7: `PS` on level-2/3 entries (terminates the walk early), `PAT` on a
/// level-1 (4 KiB) leaf entry. The two meanings never apply to the same
/// entry since `PS` is only consulted above level 1.
const BIT_PS_OR_PAT4K: u64 = 1 << 7;
const BIT_GLOBAL: u64 = 1 << 8;
/// `PAT` bit position for a 2 MiB/1 GiB (huge) leaf entry.
const BIT_PAT_HUGE: u64 = 1 << 12;
const BIT_NX: u64 = 1 << 63;
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
/// Address mask for a 2 MiB leaf: bits 21..51. Excludes bit 12 (`PAT` on a
/// huge leaf) and the reserved low bits below the 2 MiB boundary.
const ADDR_MASK_2M: u64 = 0x000f_ffff_ffe0_0000;
/// Address mask for a 1 GiB leaf: bits 30..51.
const ADDR_MASK_1G: u64 = 0x000f_ffff_c000_0000;

/// One slot in a [`super::table::PageTable`].
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    pub const EMPTY: Self = Self(0);

    pub fn is_present(&self) -> bool {
        self.0 & BIT_PRESENT != 0
    }

    pub fn is_huge(&self) -> bool {
        self.0 & BIT_PS_OR_PAT4K != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & BIT_WRITE != 0
    }

    pub fn is_user(&self) -> bool {
        self.0 & BIT_USER != 0
    }

    pub fn is_nx(&self) -> bool {
        self.0 & BIT_NX != 0
    }

    /// Physical address field for a table entry or a 4 KiB leaf. Not valid
    /// for a 2 MiB/1 GiB leaf: bit 12 of a huge leaf holds `PAT`, not an
    /// address bit — use [`Self::addr_2m`]/[`Self::addr_1g`] there instead.
    pub fn addr(&self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    /// Physical address field for a 2 MiB leaf entry.
    pub fn addr_2m(&self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK_2M)
    }

    /// Physical address field for a 1 GiB leaf entry.
    pub fn addr_1g(&self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK_1G)
    }

    /// An always-present, always-writable entry pointing at an intermediate
    /// table. Per the walking discipline, intermediates are always
    /// `PRESENT | WRITE` — the leaf entry's own flags are the real
    /// permission gate.
    pub fn table(phys: PhysAddr) -> Self {
        Self((phys.0 & ADDR_MASK) | BIT_PRESENT | BIT_WRITE)
    }

    /// A 4 KiB leaf entry.
    pub fn leaf_4k(phys: PhysAddr, access: AccessFlags, cache: CacheType) -> Self {
        Self(leaf_bits(phys, access, cache, false))
    }

    /// A 2 MiB or 1 GiB leaf entry (`PS` set, `PAT` at bit 12).
    pub fn leaf_huge(phys: PhysAddr, access: AccessFlags, cache: CacheType) -> Self {
        Self(leaf_bits(phys, access, cache, true) | BIT_PS_OR_PAT4K)
    }
}

fn leaf_bits(phys: PhysAddr, access: AccessFlags, cache: CacheType, huge: bool) -> u64 {
    let (pwt, pcd, pat) = cache.bits();
    let mut bits = (phys.0 & ADDR_MASK) | BIT_PRESENT | BIT_ACCESSED;
    if access.contains(AccessFlags::WRITE) {
        bits |= BIT_WRITE;
    }
    if access.contains(AccessFlags::USER) {
        bits |= BIT_USER;
    }
    if access.contains(AccessFlags::NX) {
        bits |= BIT_NX;
    }
    if pwt {
        bits |= BIT_PWT;
    }
    if pcd {
        bits |= BIT_PCD;
    }
    if pat {
        bits |= if huge { BIT_PAT_HUGE } else { BIT_PS_OR_PAT4K };
    }
    bits
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn cache_type_bit_table_matches_spec() {
        assert_eq!(CacheType::WriteBack.bits(), (false, false, false));
        assert_eq!(CacheType::WriteThrough.bits(), (false, false, true));
        assert_eq!(CacheType::Uncacheable.bits(), (true, false, true));
        assert_eq!(CacheType::WriteCombining.bits(), (false, true, true));
        assert_eq!(CacheType::WriteProtect.bits(), (false, true, false));
    }

    #[test]
    fn leaf_4k_roundtrips_address_and_flags() {
        let phys = PhysAddr::new(0x1234_5000);
        let e = PageTableEntry::leaf_4k(phys, AccessFlags::WRITE, CacheType::WriteBack);
        assert_eq!(e.addr(), phys);
        assert!(e.is_present());
        assert!(e.is_writable());
        assert!(!e.is_nx());
        assert!(!e.is_huge());
    }

    #[test]
    fn huge_leaf_sets_ps_and_pat_bit_twelve() {
        let phys = PhysAddr::new(0x4000_0000);
        let e = PageTableEntry::leaf_huge(phys, AccessFlags::NX, CacheType::WriteCombining);
        assert!(e.is_huge());
        assert_eq!(e.0 & BIT_PAT_HUGE, BIT_PAT_HUGE);
        assert!(e.is_nx());
    }

    #[test]
    fn huge_leaf_addr_excludes_pat_bit() {
        let phys_2m = PhysAddr::new(0x8000_0000);
        let e2m = PageTableEntry::leaf_huge(phys_2m, AccessFlags::WRITE, CacheType::WriteCombining);
        assert_eq!(e2m.0 & BIT_PAT_HUGE, BIT_PAT_HUGE);
        assert_eq!(e2m.addr_2m(), phys_2m);

        let phys_1g = PhysAddr::new(0x4_0000_0000);
        let e1g = PageTableEntry::leaf_huge(phys_1g, AccessFlags::WRITE, CacheType::Uncacheable);
        assert_eq!(e1g.0 & BIT_PAT_HUGE, BIT_PAT_HUGE);
        assert_eq!(e1g.addr_1g(), phys_1g);
    }

    #[test]
    fn table_entry_is_always_present_and_writable() {
        let e = PageTableEntry::table(PhysAddr::new(0x2000));
        assert!(e.is_present());
        assert!(e.is_writable());
        assert!(!e.is_huge());
    }
}
