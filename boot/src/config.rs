//! Loader configuration.
//!
//! Parsing a config file or load options is not this loader's job; the boot
//! menu is compiled in.

/// UEFI page granularity
pub const PAGE_SIZE: usize = 4096;

/// Extra descriptors reserved on top of the reported memory map size. The
/// allocations made to hold the map perturb the map itself.
pub const MMAP_SLACK_DESCRIPTORS: usize = 64;

/// How many times ExitBootServices is presented with a freshly captured map
/// key before the loader gives up and halts.
pub const EXIT_BOOT_SERVICES_ATTEMPTS: usize = 2;

/// One bootable kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootEntry {
    pub name: &'static str,
    /// Path on the loader's own volume, `\`-separated.
    pub path: &'static str,
    pub cmdline: &'static str,
}

/// Tried in order; each entry is a fresh boot attempt.
pub const BOOT_ENTRIES: &[BootEntry] = &[
    BootEntry {
        name: "Ember",
        path: "\\EFI\\ember\\kernel.elf",
        cmdline: "console=fb loglevel=info",
    },
    BootEntry {
        name: "Ember (fallback)",
        path: "\\EFI\\ember\\kernel.old.elf",
        cmdline: "console=fb loglevel=debug",
    },
];

#[inline]
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}
