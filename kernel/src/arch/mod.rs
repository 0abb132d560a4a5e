//! Architecture support. x86-64 only; see SPEC_FULL.md Non-goals.

pub mod x86_64;

pub use x86_64::*;
