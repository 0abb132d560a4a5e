//! C5: page-table mutation and address translation.
//!
//! Grounded on `original_source/kernel/src/arch/x86-64/mmu.c`: largest-granule
//! range mapping, on-demand intermediate table allocation from the buddy
//! allocator, and a full TLB reload after any batch of changes.

use crate::{
    error::MmError,
    mm::{
        addr::{PhysAddr, PAGE_SIZE},
        buddy, page,
        paging::{
            entry::{AccessFlags, CacheType, PageTableEntry},
            table::{PageTable, VaIndices},
        },
    },
};

const SZ_4K: u64 = PAGE_SIZE;
const SZ_2M: u64 = 2 * 1024 * 1024;
const SZ_1G: u64 = 1024 * 1024 * 1024;

/// One address space's root table. The kernel owns exactly one, globally
/// (`super::KERNEL_CTX`).
#[derive(Clone, Copy)]
pub struct AddressSpaceContext {
    pub root_table_phys: PhysAddr,
}

/// The deepest present entry found for a virtual address, and how many
/// levels below the root it terminates at: 1 → 1 GiB, 2 → 2 MiB, 3 → 4 KiB.
pub struct WalkResult {
    pub entry: PageTableEntry,
    pub depth: u8,
}

fn assert_page_aligned(val: u64, what: &'static str) {
    assert_eq!(val % SZ_4K, 0, "page-table mapper: {what} is not 4 KiB aligned (UNALIGNED_REQUEST)");
}

/// Probes `CPUID.01H:EDX[16]` and assumes the architectural reset PAT
/// layout without reprogramming `IA32_PAT`.
pub fn assert_pat_reset_layout() -> Result<(), MmError> {
    if crate::arch::x86_64::cpu_has_pat() {
        Ok(())
    } else {
        Err(MmError::ConfigurationFault {
            reason: "CPU does not support PAT; reset layout assumption invalid",
        })
    }
}

fn ensure_table(table_phys: PhysAddr, idx: usize) -> Result<PhysAddr, MmError> {
    // SAFETY: `table_phys` names a live table owned by this address space;
    // no other reference to it is outstanding during this call.
    let table = unsafe { PageTable::at_mut(table_phys) };
    let e = table.get(idx);
    if e.is_present() {
        if e.is_huge() {
            return Err(MmError::InvariantViolation {
                what: "page-table mapper: existing huge mapping blocks descent to a finer granule",
            });
        }
        return Ok(e.addr());
    }
    let new_table = buddy::page_alloc_zeroed(0)?;
    let new_phys = page::page_to_phys(new_table);
    table.set(idx, PageTableEntry::table(new_phys));
    Ok(new_phys)
}

fn map_one_4k(ctx: &AddressSpaceContext, va: u64, pa: u64, access: AccessFlags, cache: CacheType) -> Result<(), MmError> {
    let idx = VaIndices::split(va);
    let l3 = ensure_table(ctx.root_table_phys, idx.l4)?;
    let l2 = ensure_table(l3, idx.l3)?;
    let l1 = ensure_table(l2, idx.l2)?;
    // SAFETY: `l1` was just created or located by `ensure_table` and is
    // exclusively owned by this address space.
    let table = unsafe { PageTable::at_mut(l1) };
    table.set(idx.l1, PageTableEntry::leaf_4k(PhysAddr::new(pa), access, cache));
    Ok(())
}

fn map_one_2m(ctx: &AddressSpaceContext, va: u64, pa: u64, access: AccessFlags, cache: CacheType) -> Result<(), MmError> {
    let idx = VaIndices::split(va);
    let l3 = ensure_table(ctx.root_table_phys, idx.l4)?;
    let l2 = ensure_table(l3, idx.l3)?;
    // SAFETY: as in `map_one_4k`.
    let table = unsafe { PageTable::at_mut(l2) };
    table.set(idx.l2, PageTableEntry::leaf_huge(PhysAddr::new(pa), access, cache));
    Ok(())
}

fn map_one_1g(ctx: &AddressSpaceContext, va: u64, pa: u64, access: AccessFlags, cache: CacheType) -> Result<(), MmError> {
    let idx = VaIndices::split(va);
    let l3 = ensure_table(ctx.root_table_phys, idx.l4)?;
    // SAFETY: as in `map_one_4k`.
    let table = unsafe { PageTable::at_mut(l3) };
    table.set(idx.l3, PageTableEntry::leaf_huge(PhysAddr::new(pa), access, cache));
    Ok(())
}

/// Maps `[va, va+pa_len)` to physical `[pa, pa+pa_len)` using the largest
/// granule both `va` and `pa` are aligned for at each step (a huge leaf
/// needs the physical address aligned too, not just the virtual one),
/// allocating intermediate tables on demand. Flushes the whole TLB once on
/// return.
pub fn map_range(
    ctx: &AddressSpaceContext,
    vbase: u64,
    pbase: u64,
    len: u64,
    access: AccessFlags,
    cache: CacheType,
) -> Result<(), MmError> {
    assert_page_aligned(vbase, "map_range vbase");
    assert_page_aligned(pbase, "map_range pbase");
    assert_page_aligned(len, "map_range len");

    let mut v = vbase;
    let mut p = pbase;
    let mut remaining = len;

    // A huge granule is only legal when both va and pa share its alignment;
    // a va that happens to be 2 MiB/1 GiB aligned against a pa that isn't
    // (e.g. an unaligned va-pa delta) must still fall back to 4 KiB steps.
    while remaining > 0 && !(v % SZ_2M == 0 && p % SZ_2M == 0) {
        map_one_4k(ctx, v, p, access, cache)?;
        v += SZ_4K;
        p += SZ_4K;
        remaining -= SZ_4K;
    }
    while remaining >= SZ_2M && !(v % SZ_1G == 0 && p % SZ_1G == 0) {
        map_one_2m(ctx, v, p, access, cache)?;
        v += SZ_2M;
        p += SZ_2M;
        remaining -= SZ_2M;
    }
    while remaining >= SZ_1G && p % SZ_1G == 0 {
        map_one_1g(ctx, v, p, access, cache)?;
        v += SZ_1G;
        p += SZ_1G;
        remaining -= SZ_1G;
    }
    while remaining >= SZ_2M && p % SZ_2M == 0 {
        map_one_2m(ctx, v, p, access, cache)?;
        v += SZ_2M;
        p += SZ_2M;
        remaining -= SZ_2M;
    }
    while remaining > 0 {
        map_one_4k(ctx, v, p, access, cache)?;
        v += SZ_4K;
        p += SZ_4K;
        remaining -= SZ_4K;
    }

    crate::arch::x86_64::tlb_flush_all();
    Ok(())
}

/// Maps one 4 KiB page.
pub fn map_single_4k(ctx: &AddressSpaceContext, va: u64, pa: u64, access: AccessFlags, cache: CacheType) -> Result<(), MmError> {
    assert_page_aligned(va, "map_single_4k va");
    assert_page_aligned(pa, "map_single_4k pa");
    map_one_4k(ctx, va, pa, access, cache)?;
    crate::arch::x86_64::tlb_flush_all();
    Ok(())
}

/// Maps one 2 MiB page.
pub fn map_single_2m(ctx: &AddressSpaceContext, va: u64, pa: u64, access: AccessFlags, cache: CacheType) -> Result<(), MmError> {
    assert_eq!(va % SZ_2M, 0, "map_single_2m: va not 2 MiB aligned (UNALIGNED_REQUEST)");
    assert_eq!(pa % SZ_2M, 0, "map_single_2m: pa not 2 MiB aligned (UNALIGNED_REQUEST)");
    map_one_2m(ctx, va, pa, access, cache)?;
    crate::arch::x86_64::tlb_flush_all();
    Ok(())
}

/// Maps one 1 GiB page.
pub fn map_single_1g(ctx: &AddressSpaceContext, va: u64, pa: u64, access: AccessFlags, cache: CacheType) -> Result<(), MmError> {
    assert_eq!(va % SZ_1G, 0, "map_single_1g: va not 1 GiB aligned (UNALIGNED_REQUEST)");
    assert_eq!(pa % SZ_1G, 0, "map_single_1g: pa not 1 GiB aligned (UNALIGNED_REQUEST)");
    map_one_1g(ctx, va, pa, access, cache)?;
    crate::arch::x86_64::tlb_flush_all();
    Ok(())
}

fn locate_leaf(ctx: &AddressSpaceContext, va: u64) -> Option<(PhysAddr, usize, u8)> {
    let idx = VaIndices::split(va);
    // SAFETY: the root table is live for the kernel's whole lifetime and
    // walks never race a concurrent mutation of an intermediate entry this
    // function itself isn't holding (single global page-table lock at the
    // caller, per the documented lock-nesting order).
    let l4 = unsafe { PageTable::at(ctx.root_table_phys) };
    let e4 = l4.get(idx.l4);
    if !e4.is_present() {
        return None;
    }
    let l3 = unsafe { PageTable::at(e4.addr()) };
    let e3 = l3.get(idx.l3);
    if !e3.is_present() {
        return None;
    }
    if e3.is_huge() {
        return Some((e4.addr(), idx.l3, 1));
    }
    let l2 = unsafe { PageTable::at(e3.addr()) };
    let e2 = l2.get(idx.l2);
    if !e2.is_present() {
        return None;
    }
    if e2.is_huge() {
        return Some((e3.addr(), idx.l2, 2));
    }
    let l1 = unsafe { PageTable::at(e2.addr()) };
    let e1 = l1.get(idx.l1);
    if !e1.is_present() {
        return None;
    }
    Some((e2.addr(), idx.l1, 3))
}

/// Returns the deepest present entry for `va`, or `None` if any level along
/// the walk is absent.
pub fn walk(ctx: &AddressSpaceContext, va: u64) -> Option<WalkResult> {
    let (table_phys, idx, depth) = locate_leaf(ctx, va)?;
    // SAFETY: `locate_leaf` only returns a location it just read as present.
    let table = unsafe { PageTable::at(table_phys) };
    Some(WalkResult {
        entry: table.get(idx),
        depth,
    })
}

/// Translates `va` to its physical address, or `0` if unmapped (no legal
/// kernel mapping has physical address 0, so this is caller-distinguishable
/// from a real translation).
pub fn virt_to_phys(ctx: &AddressSpaceContext, va: u64) -> u64 {
    match walk(ctx, va) {
        None => 0,
        Some(w) => {
            let (base, low_mask) = match w.depth {
                1 => (w.entry.addr_1g().0, SZ_1G - 1),
                2 => (w.entry.addr_2m().0, SZ_2M - 1),
                _ => (w.entry.addr().0, SZ_4K - 1),
            };
            base | (va & low_mask)
        }
    }
}

/// Clears the leaf entry mapping `va`. A `va` with no current mapping is a
/// no-op (idempotent repeated unmap). `free_backing` additionally returns
/// the physical frame to the buddy allocator and is only supported for 4
/// KiB leaves (huge-page frames were never handed out as single buddy
/// blocks, since [`crate::mm::buddy::MAX_ORDER`] caps at 4 MiB).
pub fn unmap(ctx: &AddressSpaceContext, va: u64, free_backing: bool) {
    assert_page_aligned(va, "unmap va");
    let Some((table_phys, idx, depth)) = locate_leaf(ctx, va) else {
        return;
    };
    // SAFETY: `table_phys` was just read as the live table holding this
    // entry.
    let table = unsafe { PageTable::at_mut(table_phys) };
    let entry = table.get(idx);
    table.set(idx, PageTableEntry::EMPTY);

    if free_backing {
        assert_eq!(depth, 3, "unmap: free_backing is only supported for 4 KiB leaves");
        buddy::page_free(page::phys_to_page(entry.addr()), 0);
    }
    crate::arch::x86_64::tlb_flush_all();
}

/// Installs `ctx.root_table_phys` into the architectural page-table base
/// register.
///
/// # Safety
/// `ctx` must describe a fully-populated address space mapping at least the
/// currently executing code's identity, or the CPU will fault on the next
/// instruction fetch.
pub unsafe fn set_ctx(ctx: &AddressSpaceContext) {
    unsafe { crate::arch::x86_64::write_cr3(ctx.root_table_phys.0) };
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::{addr::set_hhdm_offset_for_test, memmap, memmap::MemoryRegionType};

    fn fresh_arena(pages: usize) -> (alloc::vec::Vec<page::Page>, alloc::vec::Vec<u8>) {
        memmap::reset_for_test();
        page::reset_for_test();
        crate::mm::early::reset_for_test();
        let mut backing: alloc::vec::Vec<u8> = alloc::vec![0u8; pages * PAGE_SIZE as usize];
        set_hhdm_offset_for_test(backing.as_mut_ptr() as u64);
        let mut table: alloc::vec::Vec<page::Page> =
            (0..pages).map(|_| unsafe { core::mem::zeroed() }).collect();
        unsafe { page::init(table.as_mut_ptr(), table.len()) };
        memmap::import(&[(0, (pages as u64) * PAGE_SIZE, MemoryRegionType::Usable)]).unwrap();
        buddy::init(pages).unwrap();
        (table, backing)
    }

    fn fresh_ctx() -> AddressSpaceContext {
        let root = buddy::page_alloc_zeroed(0).unwrap();
        AddressSpaceContext {
            root_table_phys: page::page_to_phys(root),
        }
    }

    #[test]
    fn map_then_translate_is_identity_over_offset() {
        let _arena = fresh_arena(4096);
        let ctx = fresh_ctx();
        let vbase = 0xffff_8000_0000_0000u64;
        map_range(&ctx, vbase, 0, 4 * SZ_2M, AccessFlags::WRITE, CacheType::WriteBack).unwrap();
        for off in [0u64, SZ_4K, SZ_2M, SZ_2M + SZ_4K] {
            assert_eq!(virt_to_phys(&ctx, vbase + off), off);
        }
    }

    #[test]
    fn unmap_is_idempotent() {
        let _arena = fresh_arena(64);
        let ctx = fresh_ctx();
        let va = 0xffff_8000_0000_0000u64;
        map_single_4k(&ctx, va, 0, AccessFlags::WRITE, CacheType::WriteBack).unwrap();
        unmap(&ctx, va, false);
        unmap(&ctx, va, false);
        assert_eq!(virt_to_phys(&ctx, va), 0);
    }

    #[test]
    fn walk_depth_matches_granule() {
        let _arena = fresh_arena(4096);
        let ctx = fresh_ctx();
        let va = 0xffff_8000_0000_0000u64;
        map_single_2m(&ctx, va, 0, AccessFlags::WRITE, CacheType::WriteBack).unwrap();
        assert_eq!(walk(&ctx, va).unwrap().depth, 2);
    }
}
