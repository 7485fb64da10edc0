//! Capabilities the loader needs from its environment.
//!
//! Nothing in the core reaches for a global system table. Each component is
//! handed exactly the capability it uses, so the boot flow can be driven
//! against real firmware (`crate::efi`) or against in-memory fakes.

use alloc::vec::Vec;

use bootinfo::Framebuffer;
use r_efi::efi::Guid;

use crate::config::PAGE_SIZE;
use crate::error::BootError;

/// A run of physical pages owned by this boot attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageClaim {
    pub base: u64,
    pub pages: usize,
}

impl PageClaim {
    #[inline]
    pub fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages == 0
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.base + self.len() as u64
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// Physical page allocator. Every claim is made from a memory class the
/// firmware never reclaims and never reports as usable to the kernel.
pub trait PhysicalMemory {
    /// Claim exactly `[base, base + pages * PAGE_SIZE)`. Fails with
    /// `AddressConflict` instead of relocating when any page is taken.
    fn claim_at(&mut self, base: u64, pages: usize) -> Result<PageClaim, BootError>;

    fn claim_any(&mut self, pages: usize) -> Result<PageClaim, BootError>;

    fn release(&mut self, claim: PageClaim) -> Result<(), BootError>;

    /// Writable view of physical memory.
    ///
    /// # Safety
    /// `[base, base + len)` must lie inside pages claimed through `self`, and no
    /// other live reference may cover the same bytes.
    unsafe fn slice_mut(&mut self, base: u64, len: usize) -> &mut [u8];
}

/// Read-only, seekable byte stream (an opened kernel file). Closed on drop.
pub trait ImageSource {
    fn set_position(&mut self, offset: u64) -> Result<(), BootError>;

    /// Reads up to `buf.len()` bytes; `Ok(0)` means end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BootError>;

    fn read_exact(&mut self, mut buf: &mut [u8]) -> Result<(), BootError> {
        while !buf.is_empty() {
            match self.read(buf)? {
                0 => return Err(BootError::MalformedImage("unexpected end of file")),
                n => buf = &mut buf[n..],
            }
        }
        Ok(())
    }
}

/// Filesystem collaborator: path → stream.
pub trait Volume {
    type File: ImageSource;

    fn open(&mut self, path: &str) -> Result<Self::File, BootError>;
}

/// One firmware configuration table entry.
#[derive(Debug, Clone, Copy)]
pub struct ConfigTable {
    pub guid: Guid,
    pub address: *const u8,
}

/// Firmware configuration table enumeration, in firmware order.
pub trait ConfigTables {
    fn config_tables(&self) -> Vec<ConfigTable>;
}

/// Display collaborator. Mode selection already happened; this only reports it.
pub trait FramebufferSource {
    fn framebuffer(&mut self) -> Result<Framebuffer, BootError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapSize {
    pub map_size: usize,
    pub descriptor_size: usize,
}

/// Opaque token tying a captured map to one ExitBootServices call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapKey(pub usize);

/// Result of a successful GetMemoryMap into a caller-provided buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedMap {
    /// Bytes written into the buffer.
    pub len: usize,
    /// Firmware-reported stride; may exceed `size_of::<MemoryDescriptor>()`.
    pub descriptor_size: usize,
    pub key: MapKey,
}

impl CapturedMap {
    #[inline]
    pub fn descriptor_count(&self) -> usize {
        if self.descriptor_size == 0 {
            0
        } else {
            self.len / self.descriptor_size
        }
    }
}

pub trait MemoryMapSource {
    fn memory_map_size(&mut self) -> Result<MapSize, BootError>;

    /// Capture the current map into `buffer`. Must not allocate.
    fn capture_memory_map(&mut self, buffer: &PageClaim) -> Result<CapturedMap, BootError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitFailure {
    /// The map changed since the key was captured.
    StaleKey,
    Status(usize),
}

/// ExitBootServices refused the key. The firmware handle comes back so the
/// caller can re-capture and try again.
pub struct ExitRejected<F> {
    pub firmware: F,
    pub reason: ExitFailure,
}

/// Boot-services side of the firmware. Consumed by the exit call: once it
/// succeeds only a [`Machine`] is left.
pub trait Firmware: PhysicalMemory + MemoryMapSource + Sized {
    type Machine: Machine;

    fn exit_boot_services(self, key: MapKey) -> Result<Self::Machine, ExitRejected<Self>>;

    /// Stop the CPU. Used when the fence itself fails.
    fn halt(self) -> !;
}

/// What is left of the platform after boot services are gone.
pub trait Machine {
    fn disable_interrupts(&mut self);

    /// Jump to the kernel. Never returns.
    ///
    /// # Safety
    /// `entry` must be the entry point of a completely loaded kernel and `info`
    /// the physical address of a fully populated boot info block.
    unsafe fn enter_kernel(self, entry: u64, magic: u64, info: u64) -> !;
}
