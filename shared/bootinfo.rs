#![no_std]

//! Ember hand-off ABI.
//!
//! Everything in here is `#[repr(C)]` and shared verbatim between the stage-0
//! loader and the kernel. The kernel entry point receives `BOOT_MAGIC` in the
//! first argument register and a physical pointer to [`BootInfo`] in the
//! second. All pointers are physical addresses; firmware identity-maps memory
//! so the kernel can read them before it installs its own page tables.

/// First argument handed to the kernel entry point: `"EMBERBOO"`.
pub const BOOT_MAGIC: u64 = 0x454D_4245_5242_4F4F;

/// Passed from bootloader ➞ kernel (always repr(C) ⇒ stable ABI).
///
/// The block is one contiguous, kernel-owned allocation:
/// `[BootInfo][MemoryRegion; memory_map.capacity][cmdline bytes]`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    pub cmdline: CommandLine,

    /// Physical address of the copied ACPI RSDP. Zero if firmware published none.
    pub acpi_root_pointer: u64,

    pub framebuffer: Framebuffer,

    pub memory_map: MemoryMap,
}

/// Raw command line given to the loader. Not NUL-terminated.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandLine {
    pub length: u32,
    pub _reserved: u32,
    /// Physical address of the first byte, inside the boot info block.
    pub bytes: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framebuffer {
    pub width: u32,
    pub height: u32,
    pub base: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMap {
    /// Number of valid entries.
    pub count: u32,
    /// Number of slots reserved behind `entries`.
    pub capacity: u32,
    /// Physical address of `[MemoryRegion; capacity]`.
    pub entries: u64,
}

/// Firmware-agnostic, coalesced physical memory range.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u64,
    pub len:   u64,
    pub ty:    MemoryRegionType,
    pub _reserved: u32,
}

impl MemoryRegion {
    pub const fn new(start: u64, len: u64, ty: MemoryRegionType) -> Self {
        Self { start, len, ty, _reserved: 0 }
    }

    #[inline]
    pub const fn end(&self) -> u64 {
        self.start + self.len
    }

    /// `None` when the region runs up to the very top of the address space.
    #[inline]
    pub const fn checked_end(&self) -> Option<u64> {
        self.start.checked_add(self.len)
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionType {
    Usable          = 1,
    Reserved        = 2,
    AcpiReclaimable = 3,
    AcpiNvs         = 4,
    BadMemory       = 0xFFFF_FFFF,
}

const _: () = assert!(core::mem::size_of::<BootInfo>() == 56);
const _: () = assert!(core::mem::size_of::<MemoryRegion>() == 24);
const _: () = assert!(core::mem::align_of::<BootInfo>() == 8);
