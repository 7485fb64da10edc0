//! Firmware memory map → kernel memory map.
//!
//! The raw map is a byte buffer of `EFI_MEMORY_DESCRIPTOR`s laid out at the
//! stride the firmware reported, which may be larger than the struct this
//! crate knows about. Each descriptor is classified into the closed
//! [`MemoryRegionType`] set and adjacent ranges of the same class are merged.
//!
//! Runs after ExitBootServices: no allocation, no logging.

use core::mem::size_of;

use bootinfo::{MemoryRegion, MemoryRegionType};
use r_efi::efi;

use crate::config::PAGE_SIZE;
use crate::error::BootError;

/// Firmware memory type → kernel class. Anything unknown is `Reserved`.
pub fn classify(ty: u32) -> MemoryRegionType {
    match ty {
        efi::LOADER_CODE
        | efi::LOADER_DATA
        | efi::BOOT_SERVICES_CODE
        | efi::BOOT_SERVICES_DATA
        | efi::CONVENTIONAL_MEMORY => MemoryRegionType::Usable,
        efi::UNUSABLE_MEMORY => MemoryRegionType::BadMemory,
        efi::ACPI_RECLAIM_MEMORY => MemoryRegionType::AcpiReclaimable,
        efi::ACPI_MEMORY_NVS => MemoryRegionType::AcpiNvs,
        _ => MemoryRegionType::Reserved,
    }
}

/// A captured descriptor buffer, walked at the firmware's stride.
#[derive(Clone, Copy)]
pub struct RawMemoryMap<'a> {
    bytes: &'a [u8],
    stride: usize,
}

impl<'a> RawMemoryMap<'a> {
    pub fn new(bytes: &'a [u8], descriptor_size: usize) -> Result<Self, BootError> {
        if descriptor_size < size_of::<efi::MemoryDescriptor>() {
            return Err(BootError::DeviceUnavailable("memory descriptor stride too small"));
        }
        Ok(Self { bytes, stride: descriptor_size })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len() / self.stride
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn descriptors(&self) -> impl Iterator<Item = efi::MemoryDescriptor> + 'a {
        self.bytes.chunks_exact(self.stride).map(|chunk| {
            // SAFETY: `chunk` holds at least size_of::<MemoryDescriptor>() bytes
            // (checked in `new`); the buffer carries no alignment guarantee.
            unsafe { chunk.as_ptr().cast::<efi::MemoryDescriptor>().read_unaligned() }
        })
    }
}

/// Classify and coalesce `raw` into `out`, returning the number of entries
/// written. Output is cut short if `out` fills up; size it with one slot per
/// descriptor to avoid that.
pub fn normalize(raw: &RawMemoryMap<'_>, out: &mut [MemoryRegion]) -> usize {
    let mut count = 0;

    for desc in raw.descriptors() {
        let region = MemoryRegion::new(
            desc.physical_start,
            desc.number_of_pages.saturating_mul(PAGE_SIZE as u64),
            classify(desc.r#type),
        );
        if !push_region(out, &mut count, region) {
            break;
        }
    }

    count
}

/// Re-merge an already normalized map in place.
pub fn coalesce(regions: &mut [MemoryRegion]) -> usize {
    let mut count = 0;
    for i in 0..regions.len() {
        let region = regions[i];
        // `count <= i`, so the write never lands ahead of the read.
        push_region(regions, &mut count, region);
    }
    count
}

/// Extend the last entry when `region` continues it, else append.
/// Returns `false` when there is no room left.
fn push_region(out: &mut [MemoryRegion], count: &mut usize, region: MemoryRegion) -> bool {
    if let Some(last) = count.checked_sub(1).map(|i| &mut out[i]) {
        // Runs after ExitBootServices: no arithmetic here may panic.
        if last.ty == region.ty && last.checked_end() == Some(region.start) {
            if let Some(len) = last.len.checked_add(region.len) {
                last.len = len;
                return true;
            }
        }
    }

    match out.get_mut(*count) {
        Some(slot) => {
            *slot = region;
            *count += 1;
            true
        }
        None => false,
    }
}
