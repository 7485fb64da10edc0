//! Platform info assembly: builds the boot info block the kernel receives.
//!
//! The block is one contiguous run of kernel-owned pages:
//!
//! ```text
//!   +---------------------------+ 0
//!   | BootInfo                  | 56
//!   +---------------------------+ ENTRIES_OFFSET
//!   | MemoryRegion × capacity   | filled after ExitBootServices
//!   +---------------------------+ cmdline_offset
//!   | command line bytes        |
//!   +---------------------------+
//! ```
//!
//! The memory map slots are reserved here, before the map is captured, so
//! nothing has to be allocated once boot services are gone.

use core::mem::size_of;
use core::ptr::NonNull;

use bootinfo::{BootInfo, CommandLine, MemoryMap, MemoryRegion};

use crate::acpi::{self, RootPointer};
use crate::config::pages_for;
use crate::error::BootError;
use crate::firmware::{ConfigTables, FramebufferSource, PageClaim, PhysicalMemory};

pub const ENTRIES_OFFSET: usize = size_of::<BootInfo>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub capacity: usize,
    pub cmdline_offset: usize,
    pub cmdline_len: usize,
    pub size: usize,
}

impl BlockLayout {
    pub fn new(cmdline_len: usize, capacity: usize) -> Result<Self, BootError> {
        let too_big = BootError::ResourceExhausted("boot info block size overflows");
        let cmdline_offset = capacity
            .checked_mul(size_of::<MemoryRegion>())
            .and_then(|entries| entries.checked_add(ENTRIES_OFFSET))
            .ok_or(too_big)?;
        let size = cmdline_offset.checked_add(cmdline_len).ok_or(too_big)?;
        Ok(Self { capacity, cmdline_offset, cmdline_len, size })
    }
}

/// The assembled block. Owns its pages and the ACPI copy until dispatch.
#[derive(Debug)]
pub struct BootInfoBlock {
    claim: PageClaim,
    acpi: Option<RootPointer>,
    layout: BlockLayout,
    info: NonNull<BootInfo>,
    entries: NonNull<MemoryRegion>,
}

impl BootInfoBlock {
    /// Physical address handed to the kernel.
    #[inline]
    pub fn phys(&self) -> u64 {
        self.claim.base
    }

    #[inline]
    pub fn claim(&self) -> PageClaim {
        self.claim
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    pub fn info(&self) -> &BootInfo {
        // SAFETY: `info` points into pages owned by this block and was
        // initialised in `assemble`.
        unsafe { self.info.as_ref() }
    }

    pub fn cmdline(&self) -> &[u8] {
        // SAFETY: the command line was copied to `cmdline_offset` within the block.
        unsafe {
            let base = self.info.as_ptr().cast::<u8>().add(self.layout.cmdline_offset);
            core::slice::from_raw_parts(base, self.layout.cmdline_len)
        }
    }

    /// Entries written so far.
    pub fn memory_map(&self) -> &[MemoryRegion] {
        let count = self.info().memory_map.count as usize;
        // SAFETY: the first `count` slots were written by `set_memory_map`.
        unsafe { core::slice::from_raw_parts(self.entries.as_ptr(), count) }
    }

    /// Every reserved slot, for the normalizer to fill.
    pub fn entry_slots(&mut self) -> &mut [MemoryRegion] {
        // SAFETY: `capacity` slots were zero-initialised inside the block, which
        // nothing else references.
        unsafe { core::slice::from_raw_parts_mut(self.entries.as_ptr(), self.layout.capacity) }
    }

    /// Record how many slots hold valid entries.
    pub fn set_memory_map_count(&mut self, count: usize) {
        let count = count.min(self.layout.capacity) as u32;
        // SAFETY: see `info`.
        unsafe { self.info.as_mut().memory_map.count = count };
    }

    /// Give the block and the ACPI copy back. Only valid before dispatch.
    pub fn release<M: PhysicalMemory>(self, mem: &mut M) {
        acpi::release_root_pointer(mem, self.acpi);
        if let Err(e) = mem.release(self.claim) {
            log::warn!("Could not release boot info block at {:#x}: {}", self.claim.base, e);
        }
    }
}

/// Build the boot info block: framebuffer, ACPI root pointer, command line,
/// and room for `map_capacity` memory map entries.
pub fn assemble<M, T, D>(
    mem: &mut M,
    tables: &T,
    display: &mut D,
    cmdline: &[u8],
    map_capacity: usize,
) -> Result<BootInfoBlock, BootError>
where
    M: PhysicalMemory,
    T: ConfigTables,
    D: FramebufferSource,
{
    let cmdline_len = u32::try_from(cmdline.len())
        .map_err(|_| BootError::ResourceExhausted("command line too long"))?;
    let layout = BlockLayout::new(cmdline.len(), map_capacity)?;

    let framebuffer = display.framebuffer()?;
    log::info!(
        "Framebuffer {}x{} at {:#x}",
        framebuffer.width,
        framebuffer.height,
        framebuffer.base
    );

    let root = acpi::copy_root_pointer(mem, &tables.config_tables())?;

    let claim = match mem.claim_any(pages_for(layout.size)) {
        Ok(claim) => claim,
        Err(e) => {
            acpi::release_root_pointer(mem, root);
            return Err(e);
        }
    };

    // SAFETY: `claim` covers `layout.size` bytes and was claimed just above.
    let block = unsafe { mem.slice_mut(claim.base, layout.size) };
    block.fill(0);
    block[layout.cmdline_offset..].copy_from_slice(cmdline);

    let info = BootInfo {
        cmdline: CommandLine {
            length: cmdline_len,
            _reserved: 0,
            bytes: claim.base + layout.cmdline_offset as u64,
        },
        acpi_root_pointer: root.map_or(0, |r| r.address()),
        framebuffer,
        memory_map: MemoryMap {
            count: 0,
            capacity: layout.capacity as u32,
            entries: claim.base + ENTRIES_OFFSET as u64,
        },
    };

    let base = block.as_mut_ptr();
    // SAFETY: claims are page aligned, so the block start satisfies BootInfo's
    // alignment, and ENTRIES_OFFSET (56) keeps MemoryRegion 8-byte aligned.
    let (info_ptr, entries) = unsafe {
        let info_ptr = base.cast::<BootInfo>();
        info_ptr.write(info);
        (
            NonNull::new_unchecked(info_ptr),
            NonNull::new_unchecked(base.add(ENTRIES_OFFSET).cast::<MemoryRegion>()),
        )
    };

    log::info!(
        "Boot info block at {:#x}: {} bytes, {} map slots, cmdline {} bytes",
        claim.base,
        layout.size,
        layout.capacity,
        cmdline_len
    );

    Ok(BootInfoBlock { claim, acpi: root, layout, info: info_ptr, entries })
}
