//! Limine boot protocol glue: request declarations and the ELF entry point.
//!
//! Grounded on `oro-bootloader-limine`'s request-declaration idiom: every
//! request this kernel needs is a `#[used] static`, Limine fills in its
//! response before jumping to [`kernel_entry`], and [`BootData::collect`]
//! turns the raw responses into the plain Rust values C1 (`mm::memmap`)
//! consumes.

use limine::{
    memory_map::EntryType,
    request::{HhdmRequest, KernelAddressRequest, MemoryMapRequest},
    BaseRevision,
};

use crate::mm::memmap::MemoryRegionType;

#[used]
#[link_section = ".requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[link_section = ".requests"]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
static MEMMAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static KERNEL_ADDRESS_REQUEST: KernelAddressRequest = KernelAddressRequest::new();

/// Firmware-provided state needed before any other subsystem can start.
pub struct BootData {
    pub hhdm_offset: u64,
    pub kernel_virtual_base: u64,
    pub kernel_physical_base: u64,
    pub entries: [(u64, u64, MemoryRegionType); MAX_BOOT_ENTRIES],
    pub entry_count: usize,
}

/// Limine does not bound the memory-map entry count; this is a generous
/// static cap so `BootData` stays allocation-free (the allocators don't
/// exist yet when this runs). `mm::memmap::import` copies entries out of
/// this array into its own owned storage before this value is dropped.
pub const MAX_BOOT_ENTRIES: usize = 256;

impl BootData {
    fn collect() -> Self {
        let hhdm = HHDM_REQUEST
            .get_response()
            .expect("limine: hhdm request not answered");
        let mmap = MEMMAP_REQUEST
            .get_response()
            .expect("limine: memory map request not answered");
        let kaddr = KERNEL_ADDRESS_REQUEST
            .get_response()
            .expect("limine: kernel address request not answered");

        let mut entries = [(0u64, 0u64, MemoryRegionType::Bad); MAX_BOOT_ENTRIES];
        let mut count = 0;
        for region in mmap.entries() {
            if count >= MAX_BOOT_ENTRIES {
                break;
            }
            let ty = match region.entry_type {
                EntryType::USABLE => MemoryRegionType::Usable,
                EntryType::RESERVED => MemoryRegionType::Reserved,
                EntryType::ACPI_RECLAIMABLE => MemoryRegionType::AcpiReclaimable,
                EntryType::ACPI_NVS => MemoryRegionType::AcpiNvs,
                EntryType::BAD_MEMORY => MemoryRegionType::Bad,
                EntryType::BOOTLOADER_RECLAIMABLE => MemoryRegionType::BootloaderReclaimable,
                EntryType::KERNEL_AND_MODULES => MemoryRegionType::KernelModules,
                EntryType::FRAMEBUFFER => MemoryRegionType::Framebuffer,
                _ => MemoryRegionType::Reserved,
            };
            entries[count] = (region.base, region.length, ty);
            count += 1;
        }

        Self {
            hhdm_offset: hhdm.offset(),
            kernel_virtual_base: kaddr.virtual_base(),
            kernel_physical_base: kaddr.physical_base(),
            entries,
            entry_count: count,
        }
    }
}

/// The kernel's ELF entry point, named by `link.ld`'s `ENTRY(kernel_entry)`.
///
/// # Safety
/// Called exactly once by Limine with the CPU in long mode, a valid stack,
/// and no kernel state initialized yet.
#[no_mangle]
pub extern "C" fn kernel_entry() -> ! {
    assert!(BASE_REVISION.is_supported(), "limine base revision unsupported");
    crate::logger::init();
    let boot = BootData::collect();
    crate::kernel_main(boot)
}
