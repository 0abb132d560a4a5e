//! Binary entry point. All real logic, including the panic handler and the
//! Limine-facing `kernel_entry`, lives in the library crate; this binary
//! exists only so the linker has something to produce for the bare-metal
//! target.
#![no_std]
#![cfg_attr(target_os = "none", no_main)]

use lattice_kernel as _;

#[cfg(not(target_os = "none"))]
fn main() {}
