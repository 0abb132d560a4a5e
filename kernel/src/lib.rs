//! Lattice kernel: memory-management core.
//!
//! Boots via Limine on x86-64 and brings up, in order, the bootstrap
//! allocator, the buddy page allocator, the 4-level page-table mapper, and
//! the slab/heap allocator (see [`mm`]). Everything above `mm` in a full
//! kernel — scheduling, capabilities, IPC — is out of scope for this core;
//! see SPEC_FULL.md's Non-goals.

#![no_std]
#![cfg_attr(target_os = "none", no_main)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod error;
pub mod logger;
pub mod mm;
pub mod serial;
pub mod sync;

/// On bare metal the slab allocator (C4) backs every `alloc`/`Box`/`Vec` in
/// the kernel. On the host test target, `std`'s allocator is used instead so
/// `#[test]` code can allocate before `mm::init` has ever run.
#[cfg(target_os = "none")]
#[global_allocator]
static HEAP: mm::slab::KernelHeap = mm::slab::KernelHeap;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static HEAP: std::alloc::System = std::alloc::System;

/// Runs after [`arch::x86_64::boot::kernel_entry`] has collected the Limine
/// responses. Brings up memory management and then idles; a full kernel
/// would hand off to a scheduler here.
pub fn kernel_main(boot: arch::x86_64::boot::BootData) -> ! {
    log::info!("lattice-kernel booting");
    mm::init(&boot).unwrap_or_else(|e| {
        log::error!("mm::init failed: {e}");
        panic!("mm::init failed: {e}");
    });
    log::info!("memory management online");

    arch::x86_64::halt();
}

#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("panic: {info}");
    arch::x86_64::halt();
}

/// Heap allocation failure is unrecoverable in a `no_std` kernel.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    log::error!("allocation error: {layout:?}");
    panic!("allocation error: {layout:?}");
}
