//! C5: the 4-level x86-64 page-table mapper and the kernel's one global
//! address-space context.

pub mod entry;
pub mod mapper;
pub mod table;

pub use entry::{AccessFlags, CacheType};
pub use mapper::{map_range, map_single_1g, map_single_2m, map_single_4k, unmap, virt_to_phys, walk, AddressSpaceContext, WalkResult};

use crate::{
    arch::x86_64::boot::BootData,
    error::MmError,
    mm::{addr::PAGE_SIZE, buddy, early, memmap, memmap::MemoryRegionType, page},
    sync::OnceLock,
};

/// The kernel's single global address space. Installed once by [`init`].
pub static KERNEL_CTX: OnceLock<AddressSpaceContext> = OnceLock::new();

pub fn kernel_ctx() -> &'static AddressSpaceContext {
    KERNEL_CTX.get().expect("mm::paging::init not yet called")
}

/// Local APIC MMIO window; mapped UC per the initial-address-space recipe.
const LAPIC_BASE: u64 = 0xFEE0_0000;
const LAPIC_SIZE: u64 = PAGE_SIZE;

extern "C" {
    static __text_start: u8;
    static __text_end: u8;
    static __rodata_start: u8;
    static __rodata_end: u8;
    static __data_start: u8;
    static __data_end: u8;
}

fn linker_range(start: &'static u8, end: &'static u8) -> (u64, u64) {
    let s = start as *const u8 as u64;
    let e = end as *const u8 as u64;
    (s, e - s)
}

/// Builds and installs the initial kernel address space: LAPIC window,
/// bootstrap-allocator records, the direct map over USABLE and
/// BOOTLOADER_RECLAIMABLE memory, the framebuffer, and kernel text/rodata/data
/// from linker symbols. Runs after C3 has taken ownership of RAM, per this
/// crate's boot sequence (C1 → C2 → C3 → C5 → C4, reordered from the
/// literal spec text — see DESIGN.md); every table page C5 allocates,
/// including its own root, comes uniformly from C3's buddy allocator.
pub fn init(boot: &BootData) -> Result<(), MmError> {
    mapper::assert_pat_reset_layout()?;

    let root_page = buddy::page_alloc_zeroed(0)?;
    let ctx = AddressSpaceContext {
        root_table_phys: page::page_to_phys(root_page),
    };

    map_range(&ctx, LAPIC_BASE, LAPIC_BASE, LAPIC_SIZE, AccessFlags::WRITE, CacheType::Uncacheable)?;

    for (phys, len) in early::reservations_snapshot() {
        let start = phys.align_down(PAGE_SIZE);
        let end = (phys.0 + len).next_multiple_of(PAGE_SIZE);
        let va = start.to_virt().0;
        map_range(&ctx, va, start.0, end - start.0, AccessFlags::WRITE | AccessFlags::NX, CacheType::WriteBack)?;
    }

    memmap::with_map(|map| -> Result<(), MmError> {
        for e in map.entries() {
            match e.ty {
                MemoryRegionType::Usable | MemoryRegionType::BootloaderReclaimable => {
                    let len = e.length - (e.length % PAGE_SIZE);
                    if len == 0 {
                        continue;
                    }
                    let va = boot.hhdm_offset + e.start;
                    map_range(&ctx, va, e.start, len, AccessFlags::WRITE | AccessFlags::NX, CacheType::WriteBack)?;
                }
                MemoryRegionType::Framebuffer => {
                    let len = e.length.next_multiple_of(PAGE_SIZE);
                    if len == 0 {
                        continue;
                    }
                    let va = boot.hhdm_offset + e.start;
                    map_range(&ctx, va, e.start, len, AccessFlags::WRITE | AccessFlags::NX, CacheType::WriteCombining)?;
                }
                _ => {}
            }
        }
        Ok(())
    })?;

    // SAFETY: these reference the linker-provided section boundary symbols,
    // which are valid for the whole kernel lifetime (no object behind them,
    // only their addresses are read).
    let (text_va, text_len) = unsafe { linker_range(&__text_start, &__text_end) };
    let (rodata_va, rodata_len) = unsafe { linker_range(&__rodata_start, &__rodata_end) };
    let (data_va, data_len) = unsafe { linker_range(&__data_start, &__data_end) };
    // Section boundary symbols are not page-aligned (only their starts are);
    // round each length up so `map_range`'s alignment precondition holds. The
    // slack bytes this covers belong to the next section's alignment gap.
    let text_len = text_len.next_multiple_of(PAGE_SIZE);
    let rodata_len = rodata_len.next_multiple_of(PAGE_SIZE);
    let data_len = data_len.next_multiple_of(PAGE_SIZE);
    let text_pa = text_va - boot.kernel_virtual_base + boot.kernel_physical_base;
    let rodata_pa = rodata_va - boot.kernel_virtual_base + boot.kernel_physical_base;
    let data_pa = data_va - boot.kernel_virtual_base + boot.kernel_physical_base;

    map_range(&ctx, text_va, text_pa, text_len, AccessFlags::empty(), CacheType::WriteBack)?;
    map_range(&ctx, rodata_va, rodata_pa, rodata_len, AccessFlags::NX, CacheType::WriteBack)?;
    map_range(&ctx, data_va, data_pa, data_len, AccessFlags::WRITE | AccessFlags::NX, CacheType::WriteBack)?;

    // SAFETY: `ctx` maps the running kernel's own text/data and the
    // currently executing instruction stream, so switching CR3 is sound.
    unsafe { mapper::set_ctx(&ctx) };

    KERNEL_CTX
        .set(ctx)
        .unwrap_or_else(|_| panic!("mm::paging::init called more than once"));
    log::info!("kernel address space installed");
    Ok(())
}
