//! Ember Handoff Orchestrator: one boot attempt, firmware to kernel.
//!
//! Each stage of an attempt is its own type. A transition consumes the
//! previous stage and yields the next, so stages can be neither skipped nor
//! repeated:
//!
//! ```text
//!   BootAttempt ──load_image──▶ ImageLoaded ──assemble_info──▶ InfoAssembled
//!        ▲                                                          │
//!        └──── Aborted::restart ◀──── any failure            capture_map
//!                                                                   ▼
//!   ReadyToDispatch ◀──normalize_memory_map── ServicesExited ◀── MapCaptured
//!        │                                          exit_boot_services
//!     dispatch ──▶ kernel
//! ```
//!
//! # The fence
//! Up to and including `MapCaptured`, a failure yields [`Aborted`], which
//! hands the firmware back after releasing every page the attempt claimed.
//! A refused ExitBootServices yields [`FenceFailure`], which can only halt.
//! From `ServicesExited` on nothing can fail, nothing allocates and nothing
//! logs.
//!
//! # Map key
//! The key returned with the memory map is only valid while the map is
//! unchanged. Between capturing it and calling ExitBootServices the loader
//! performs no allocation, no free and no console output. If the firmware
//! still reports the key stale (an event fired in between), the map is
//! re-captured into the same buffer and the exit retried, up to
//! [`EXIT_BOOT_SERVICES_ATTEMPTS`] times.

use core::fmt;
use core::mem::size_of;
use core::ptr::NonNull;

use bootinfo::{BootInfo, MemoryRegion, BOOT_MAGIC};
use r_efi::efi::MemoryDescriptor;

use crate::config::{pages_for, EXIT_BOOT_SERVICES_ATTEMPTS, MMAP_SLACK_DESCRIPTORS};
use crate::error::BootError;
use crate::firmware::{
    CapturedMap, ConfigTables, ExitFailure, ExitRejected, Firmware, FramebufferSource, Machine,
    PageClaim, Volume,
};
use crate::loader::{self, LoadedImage};
use crate::memmap::{self, RawMemoryMap};
use crate::platform::{self, BootInfoBlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    Idle,
    ImageLoaded,
    InfoAssembled,
    MapCaptured,
    ServicesExited,
    Dispatched,
}

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::ImageLoaded => "image loaded",
            Self::InfoAssembled => "info assembled",
            Self::MapCaptured => "map captured",
            Self::ServicesExited => "services exited",
            Self::Dispatched => "dispatched",
        })
    }
}

/// An attempt that failed before the fence. Every page it claimed has been
/// released again; the firmware is handed back intact.
pub struct Aborted<F> {
    error: BootError,
    stage: BootStage,
    firmware: F,
}

impl<F> Aborted<F> {
    fn new(error: BootError, stage: BootStage, firmware: F) -> Self {
        log::error!("Boot attempt aborted after stage '{}': {}", stage, error);
        Self { error, stage, firmware }
    }

    #[inline]
    pub fn error(&self) -> BootError {
        self.error
    }

    /// Last stage the attempt completed.
    #[inline]
    pub fn stage(&self) -> BootStage {
        self.stage
    }

    /// Begin a fresh attempt on the same firmware.
    pub fn restart(self) -> BootAttempt<F> {
        BootAttempt { firmware: self.firmware }
    }

    pub fn into_firmware(self) -> F {
        self.firmware
    }
}

impl<F> fmt::Debug for Aborted<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aborted")
            .field("error", &self.error)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceError {
    /// ExitBootServices refused the key.
    Rejected(ExitFailure),
    /// The map could not be re-captured for another try.
    Recapture(BootError),
}

impl fmt::Display for FenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(ExitFailure::StaleKey) => {
                write!(f, "ExitBootServices kept rejecting the memory map key")
            }
            Self::Rejected(ExitFailure::Status(status)) => {
                write!(f, "ExitBootServices failed with status {:#x}", status)
            }
            Self::Recapture(e) => write!(f, "memory map re-capture failed: {}", e),
        }
    }
}

/// ExitBootServices failed. Firmware state is undefined from here; the only
/// way out is to stop.
pub struct FenceFailure<F> {
    firmware: F,
    reason: FenceError,
}

impl<F: Firmware> FenceFailure<F> {
    #[inline]
    pub fn reason(&self) -> FenceError {
        self.reason
    }

    pub fn halt(self) -> ! {
        self.firmware.halt()
    }
}

impl<F> fmt::Debug for FenceFailure<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceFailure").field("reason", &self.reason).finish_non_exhaustive()
    }
}

/// `Idle`: nothing claimed yet.
pub struct BootAttempt<F> {
    firmware: F,
}

impl<F: Firmware> BootAttempt<F> {
    pub fn new(firmware: F) -> Self {
        Self { firmware }
    }

    /// Give up before anything was claimed, e.g. when a device needed by the
    /// attempt cannot be opened.
    pub fn abort(self, error: BootError) -> Aborted<F> {
        Aborted::new(error, BootStage::Idle, self.firmware)
    }

    /// Open `path` on `volume` and load it as a fixed-address ELF64 kernel.
    pub fn load_image<V: Volume>(
        self,
        volume: &mut V,
        path: &str,
    ) -> Result<ImageLoaded<F>, Aborted<F>> {
        let mut firmware = self.firmware;
        log::info!("Loading kernel {}", path);

        // The file is closed when it goes out of scope, before anything else
        // touches the firmware.
        let loaded = volume
            .open(path)
            .and_then(|mut file| loader::load_elf(&mut file, &mut firmware));

        match loaded {
            Ok(image) => {
                log::info!(
                    "Kernel loaded: entry {:#x}, {} pages in {} ranges",
                    image.entry(),
                    image.loaded_pages(),
                    image.claims().len()
                );
                Ok(ImageLoaded { firmware, image })
            }
            Err(e) => Err(Aborted::new(e, BootStage::Idle, firmware)),
        }
    }
}

pub struct ImageLoaded<F> {
    firmware: F,
    image: LoadedImage,
}

impl<F: Firmware> ImageLoaded<F> {
    #[inline]
    pub fn image(&self) -> &LoadedImage {
        &self.image
    }

    /// Build the boot info block, with one map slot per current descriptor
    /// plus slack.
    pub fn assemble_info<T, D>(
        self,
        tables: &T,
        display: &mut D,
        cmdline: &[u8],
    ) -> Result<InfoAssembled<F>, Aborted<F>>
    where
        T: ConfigTables,
        D: FramebufferSource,
    {
        let Self { mut firmware, image } = self;

        let block = map_capacity(&mut firmware).and_then(|capacity| {
            platform::assemble(&mut firmware, tables, display, cmdline, capacity)
        });

        match block {
            Ok(block) => Ok(InfoAssembled { firmware, image, block }),
            Err(e) => {
                image.release(&mut firmware);
                Err(Aborted::new(e, BootStage::ImageLoaded, firmware))
            }
        }
    }
}

fn map_capacity<F: Firmware>(firmware: &mut F) -> Result<usize, BootError> {
    let size = firmware.memory_map_size()?;
    if size.descriptor_size == 0 {
        return Err(BootError::DeviceUnavailable("firmware reported zero descriptor size"));
    }
    let capacity = size.map_size.div_ceil(size.descriptor_size) + MMAP_SLACK_DESCRIPTORS;
    log::debug!(
        "Memory map: {} bytes at stride {}, reserving {} entries",
        size.map_size,
        size.descriptor_size,
        capacity
    );
    Ok(capacity)
}

pub struct InfoAssembled<F> {
    firmware: F,
    image: LoadedImage,
    block: BootInfoBlock,
}

impl<F: Firmware> InfoAssembled<F> {
    #[inline]
    pub fn boot_info(&self) -> &BootInfo {
        self.block.info()
    }

    /// Claim the descriptor buffer and capture the map and its key.
    ///
    /// The last firmware-visible side effect of a successful attempt before
    /// ExitBootServices.
    pub fn capture_map(self) -> Result<MapCaptured<F>, Aborted<F>> {
        let Self { mut firmware, image, block } = self;

        match capture(&mut firmware, &block) {
            Ok((buffer, map)) => Ok(MapCaptured {
                firmware,
                entry: image.into_entry(),
                block,
                buffer,
                map,
            }),
            Err(e) => {
                block.release(&mut firmware);
                image.release(&mut firmware);
                Err(Aborted::new(e, BootStage::InfoAssembled, firmware))
            }
        }
    }
}

/// Pre-claimed descriptor buffer. The host address is taken while boot
/// services still own the page tables.
struct MapBuffer {
    claim: PageClaim,
    bytes: NonNull<u8>,
}

fn capture<F: Firmware>(
    firmware: &mut F,
    block: &BootInfoBlock,
) -> Result<(MapBuffer, CapturedMap), BootError> {
    let size = firmware.memory_map_size()?;
    let len = MMAP_SLACK_DESCRIPTORS
        .checked_mul(size.descriptor_size)
        .and_then(|slack| slack.checked_add(size.map_size))
        .ok_or(BootError::ResourceExhausted("memory map size overflows"))?;

    let claim = firmware.claim_any(pages_for(len))?;
    // SAFETY: the claim was made just above and nothing else references it.
    let bytes = unsafe { NonNull::from(firmware.slice_mut(claim.base, claim.len())).cast::<u8>() };

    log::info!(
        "Capturing memory map into {:#x} ({} pages); console goes quiet until the kernel",
        claim.base,
        claim.pages
    );

    // No logging from here on: console output may allocate.
    let captured = firmware
        .capture_memory_map(&claim)
        .and_then(|map| check_captured(&map, block).map(|()| map));

    match captured {
        Ok(map) => Ok((MapBuffer { claim, bytes }, map)),
        Err(e) => {
            if let Err(release) = firmware.release(claim) {
                log::warn!("Could not release map buffer at {:#x}: {}", claim.base, release);
            }
            Err(e)
        }
    }
}

/// Everything that could make normalization fail is checked before the fence.
fn check_captured(map: &CapturedMap, block: &BootInfoBlock) -> Result<(), BootError> {
    if map.descriptor_size < size_of::<MemoryDescriptor>() {
        return Err(BootError::DeviceUnavailable("memory descriptor stride too small"));
    }
    if map.descriptor_count() > block.capacity() {
        return Err(BootError::ResourceExhausted("memory map outgrew the reserved entries"));
    }
    Ok(())
}

pub struct MapCaptured<F> {
    firmware: F,
    entry: u64,
    block: BootInfoBlock,
    buffer: MapBuffer,
    map: CapturedMap,
}

impl<F: Firmware> MapCaptured<F> {
    #[inline]
    pub fn map(&self) -> CapturedMap {
        self.map
    }

    /// Terminate boot services. On a stale key the map is re-captured into
    /// the same buffer and the exit retried.
    pub fn exit_boot_services(self) -> Result<ServicesExited<F::Machine>, FenceFailure<F>> {
        let Self { mut firmware, entry, block, buffer, mut map } = self;
        let mut attempt = 1;

        loop {
            match firmware.exit_boot_services(map.key) {
                Ok(machine) => return Ok(ServicesExited { machine, entry, block, buffer, map }),
                Err(ExitRejected { firmware: fw, reason }) => {
                    firmware = fw;
                    if reason != ExitFailure::StaleKey || attempt >= EXIT_BOOT_SERVICES_ATTEMPTS {
                        return Err(FenceFailure { firmware, reason: FenceError::Rejected(reason) });
                    }

                    let recaptured = firmware
                        .capture_memory_map(&buffer.claim)
                        .and_then(|m| check_captured(&m, &block).map(|()| m));
                    map = match recaptured {
                        Ok(m) => m,
                        Err(e) => {
                            return Err(FenceFailure { firmware, reason: FenceError::Recapture(e) })
                        }
                    };
                    attempt += 1;
                }
            }
        }
    }
}

/// Boot services are gone. Only the CPU and memory are left.
pub struct ServicesExited<M> {
    machine: M,
    entry: u64,
    block: BootInfoBlock,
    buffer: MapBuffer,
    map: CapturedMap,
}

impl<M: Machine> ServicesExited<M> {
    /// Mask interrupts and translate the captured map into the block's
    /// reserved entries.
    pub fn normalize_memory_map(self) -> ReadyToDispatch<M> {
        let Self { mut machine, entry, mut block, buffer, map } = self;
        machine.disable_interrupts();

        // SAFETY: the buffer pages stay claimed and hold the last capture,
        // `map.len` bytes of it.
        let bytes = unsafe { core::slice::from_raw_parts(buffer.bytes.as_ptr(), map.len) };
        let count = match RawMemoryMap::new(bytes, map.descriptor_size) {
            Ok(raw) => memmap::normalize(&raw, block.entry_slots()),
            Err(_) => 0,
        };
        block.set_memory_map_count(count);

        ReadyToDispatch { machine, entry, block }
    }
}

pub struct ReadyToDispatch<M> {
    machine: M,
    entry: u64,
    block: BootInfoBlock,
}

impl<M: Machine> ReadyToDispatch<M> {
    #[inline]
    pub fn entry(&self) -> u64 {
        self.entry
    }

    #[inline]
    pub fn boot_info(&self) -> &BootInfo {
        self.block.info()
    }

    #[inline]
    pub fn memory_map(&self) -> &[MemoryRegion] {
        self.block.memory_map()
    }

    #[inline]
    pub fn machine(&self) -> &M {
        &self.machine
    }

    /// Call the kernel entry with `BOOT_MAGIC` and the block's address.
    pub fn dispatch(self) -> ! {
        // SAFETY: `entry` comes from a fully loaded image and the block is
        // complete; both stay claimed as reserved memory.
        unsafe { self.machine.enter_kernel(self.entry, BOOT_MAGIC, self.block.phys()) }
    }
}
