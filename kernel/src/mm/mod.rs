//! Kernel memory management: the bootstrap allocator, buddy page allocator,
//! slab/heap allocator, and 4-level page-table mapper, wired together by
//! [`init`] in boot order.

pub mod addr;
pub mod buddy;
pub mod early;
pub mod memmap;
pub mod page;
pub mod paging;
pub mod slab;

use crate::{arch::x86_64::boot::BootData, error::MmError};

/// Runs the full C1 → C2 → C3 → C5 boot sequence and leaves the kernel ready
/// to use `kalloc`/`kfree` (C4) and the global page-table context.
///
/// The struct-page table and every page-table page the mapper allocates are
/// both drawn from the buddy allocator's uniform order-0 blocks, so C3 must
/// be live before C5's bootstrap runs; this reorders the two relative to the
/// control-flow sketch that has C5 bootstrap the address space before C3
/// takes ownership of RAM, trading that ordering for a single table-page
/// allocation path instead of a second one-shot path through C2 — see
/// DESIGN.md.
pub fn init(boot: &BootData) -> Result<(), MmError> {
    addr::set_hhdm_offset(boot.hhdm_offset);
    memmap::import(&boot.entries[..boot.entry_count])?;
    log::info!("memory map imported: {} bytes usable", memmap::with_map(|m| m.total_usable_bytes()));

    let highest = memmap::with_map(|m| m.highest_end());
    let pages_count = (highest / addr::PAGE_SIZE) as usize;

    let table_bytes = (pages_count * core::mem::size_of::<page::Page>()) as u64;
    let table_phys = early::alloc_zeroed(table_bytes, 16)?;
    // SAFETY: the bytes just reserved by `early::alloc_zeroed` are exclusively
    // owned here and sized for exactly `pages_count` entries.
    unsafe {
        page::init(table_phys.to_virt().as_mut_ptr::<page::Page>(), pages_count);
    }

    buddy::init(pages_count)?;
    log::info!("buddy allocator live: {:?}", buddy::stat_memory());

    paging::init(boot)?;
    log::info!("slab caches ready (lazy growth)");

    Ok(())
}
