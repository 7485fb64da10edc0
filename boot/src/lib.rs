//! Ember stage-0 loader.
//!
//! Loads a statically linked ELF64 kernel at its fixed physical addresses,
//! collects what the kernel needs to know about the platform into one
//! [`bootinfo::BootInfo`] block, leaves UEFI boot services and jumps.
//!
//! The core components only see the capability traits in [`firmware`], so
//! the whole flow runs on the host against the fakes in `testing`. Real
//! firmware bindings live in `efi` and are only built for UEFI targets.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod acpi;
pub mod config;
pub mod elf;
pub mod error;
pub mod firmware;
pub mod handoff;
pub mod loader;
pub mod memmap;
pub mod platform;

#[cfg(target_os = "uefi")]
pub mod efi;
#[cfg(target_os = "uefi")]
pub mod ui;

#[cfg(test)]
mod testing;

pub use error::BootError;
