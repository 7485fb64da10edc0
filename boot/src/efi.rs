//! Real firmware behind the capability traits.
//!
//! Protocol access (files, graphics, page allocation) goes through the `uefi`
//! crate. GetMemoryMap and ExitBootServices go straight through the raw
//! `r-efi` boot services table: the loader needs the map key in hand, has to
//! capture into its own pre-claimed buffer and must not allocate in between.

use alloc::vec::Vec;
use bootinfo::Framebuffer;
use r_efi::efi as raw;
use uefi::prelude::*;
use uefi::proto::console::gop::{GraphicsOutput, PixelFormat};
use uefi::proto::media::file::{Directory, File, FileAttribute, FileMode, RegularFile};
use uefi::proto::media::fs::SimpleFileSystem;
use uefi::table::boot::{
    AllocateType, BootServices, MemoryType, OpenProtocolAttributes, OpenProtocolParams,
    ScopedProtocol,
};
use uefi::CStr16;

use crate::error::BootError;
use crate::firmware::{
    CapturedMap, ConfigTable, ConfigTables, ExitFailure, ExitRejected, Firmware,
    FramebufferSource, ImageSource, Machine, MapKey, MapSize, MemoryMapSource, PageClaim,
    PhysicalMemory, Volume,
};

/// Boot services, owned by the current boot attempt.
pub struct EfiFirmware {
    image: Handle,
    st: SystemTable<Boot>,
}

impl EfiFirmware {
    pub fn new(image: Handle, st: SystemTable<Boot>) -> Self {
        Self { image, st }
    }

    fn raw_boot_services(&self) -> *mut raw::BootServices {
        // SAFETY: `st` is a live system table while boot services run.
        unsafe { (*self.st.as_ptr().cast::<raw::SystemTable>()).boot_services }
    }
}

impl PhysicalMemory for EfiFirmware {
    fn claim_at(&mut self, base: u64, pages: usize) -> Result<PageClaim, BootError> {
        self.st
            .boot_services()
            .allocate_pages(AllocateType::Address(base), MemoryType::RESERVED, pages)
            .map(|_| PageClaim { base, pages })
            .map_err(|e| {
                if e.status() == Status::NOT_FOUND {
                    BootError::AddressConflict { base, pages }
                } else {
                    BootError::ResourceExhausted("AllocatePages at fixed address failed")
                }
            })
    }

    fn claim_any(&mut self, pages: usize) -> Result<PageClaim, BootError> {
        self.st
            .boot_services()
            .allocate_pages(AllocateType::AnyPages, MemoryType::RESERVED, pages)
            .map(|base| PageClaim { base, pages })
            .map_err(|_| BootError::ResourceExhausted("AllocatePages failed"))
    }

    fn release(&mut self, claim: PageClaim) -> Result<(), BootError> {
        self.st
            .boot_services()
            .free_pages(claim.base, claim.pages)
            .map_err(|_| BootError::ResourceExhausted("FreePages failed"))
    }

    unsafe fn slice_mut(&mut self, base: u64, len: usize) -> &mut [u8] {
        // Firmware identity-maps all memory.
        core::slice::from_raw_parts_mut(base as *mut u8, len)
    }
}

impl MemoryMapSource for EfiFirmware {
    fn memory_map_size(&mut self) -> Result<MapSize, BootError> {
        let size = self.st.boot_services().memory_map_size();
        Ok(MapSize { map_size: size.map_size, descriptor_size: size.entry_size })
    }

    fn capture_memory_map(&mut self, buffer: &PageClaim) -> Result<CapturedMap, BootError> {
        let mut len = buffer.len();
        let mut key = 0usize;
        let mut descriptor_size = 0usize;
        let mut version = 0u32;

        // SAFETY: the buffer is a claim of this firmware, `len` bytes long.
        let status = unsafe {
            ((*self.raw_boot_services()).get_memory_map)(
                &mut len,
                buffer.base as *mut raw::MemoryDescriptor,
                &mut key,
                &mut descriptor_size,
                &mut version,
            )
        };

        if status == raw::Status::SUCCESS {
            Ok(CapturedMap { len, descriptor_size, key: MapKey(key) })
        } else if status == raw::Status::BUFFER_TOO_SMALL {
            Err(BootError::ResourceExhausted("memory map buffer too small"))
        } else {
            Err(BootError::DeviceUnavailable("GetMemoryMap failed"))
        }
    }
}

impl Firmware for EfiFirmware {
    type Machine = BareMetal;

    fn exit_boot_services(self, key: MapKey) -> Result<BareMetal, ExitRejected<Self>> {
        // SAFETY: called with this image's handle; on success nothing in `self`
        // is touched again.
        let status = unsafe {
            ((*self.raw_boot_services()).exit_boot_services)(self.image.as_ptr(), key.0)
        };

        if status == raw::Status::SUCCESS {
            Ok(BareMetal { _private: () })
        } else if status == raw::Status::INVALID_PARAMETER {
            Err(ExitRejected { firmware: self, reason: ExitFailure::StaleKey })
        } else {
            Err(ExitRejected { firmware: self, reason: ExitFailure::Status(status.as_usize()) })
        }
    }

    fn halt(self) -> ! {
        halt_forever()
    }
}

/// The CPU after ExitBootServices.
pub struct BareMetal {
    _private: (),
}

#[cfg(target_arch = "x86_64")]
type KernelEntry = extern "sysv64" fn(u64, u64) -> !;
#[cfg(not(target_arch = "x86_64"))]
type KernelEntry = extern "C" fn(u64, u64) -> !;

impl Machine for BareMetal {
    fn disable_interrupts(&mut self) {
        #[cfg(target_arch = "x86_64")]
        x86_64::instructions::interrupts::disable();
    }

    unsafe fn enter_kernel(self, entry: u64, magic: u64, info: u64) -> ! {
        let kernel: KernelEntry = core::mem::transmute(entry as usize);
        kernel(magic, info)
    }
}

fn halt_forever() -> ! {
    #[cfg(target_arch = "x86_64")]
    {
        x86_64::instructions::interrupts::disable();
        loop {
            x86_64::instructions::hlt();
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    loop {
        core::hint::spin_loop();
    }
}

/// Snapshot of the firmware configuration table.
pub struct EfiConfigTables {
    entries: *const raw::ConfigurationTable,
    count: usize,
}

impl EfiConfigTables {
    pub fn new(st: &SystemTable<Boot>) -> Self {
        // SAFETY: the system table is live; the configuration table it points
        // at is owned by firmware and outlives boot services.
        let table = unsafe { &*st.as_ptr().cast::<raw::SystemTable>() };
        Self { entries: table.configuration_table, count: table.number_of_table_entries }
    }
}

impl ConfigTables for EfiConfigTables {
    fn config_tables(&self) -> Vec<ConfigTable> {
        if self.entries.is_null() {
            return Vec::new();
        }
        // SAFETY: firmware publishes `count` consecutive entries.
        let entries = unsafe { core::slice::from_raw_parts(self.entries, self.count) };
        entries
            .iter()
            .map(|e| ConfigTable {
                guid: e.vendor_guid,
                address: e.vendor_table.cast::<u8>().cast_const(),
            })
            .collect()
    }
}

/// The loader's own boot volume.
pub struct EfiVolume<'a> {
    _fs: ScopedProtocol<'a, SimpleFileSystem>,
    root: Directory,
}

impl<'a> EfiVolume<'a> {
    pub fn open(bs: &'a BootServices, image: Handle) -> Result<Self, BootError> {
        let mut fs = bs
            .get_image_file_system(image)
            .map_err(|_| BootError::DeviceUnavailable("no file system on the boot volume"))?;
        let root = fs
            .open_volume()
            .map_err(|_| BootError::DeviceUnavailable("cannot open boot volume"))?;
        Ok(Self { _fs: fs, root })
    }
}

impl Volume for EfiVolume<'_> {
    type File = EfiFile;

    fn open(&mut self, path: &str) -> Result<EfiFile, BootError> {
        let mut buf = [0u16; 256];
        let name = CStr16::from_str_with_buf(path, &mut buf)
            .map_err(|_| BootError::DeviceUnavailable("kernel path is not valid UCS-2"))?;

        self.root
            .open(name, FileMode::Read, FileAttribute::empty())
            .map_err(|_| BootError::DeviceUnavailable("kernel file not found"))?
            .into_regular_file()
            .map(EfiFile)
            .ok_or(BootError::DeviceUnavailable("kernel path is a directory"))
    }
}

/// Closed when dropped.
pub struct EfiFile(RegularFile);

impl ImageSource for EfiFile {
    fn set_position(&mut self, offset: u64) -> Result<(), BootError> {
        self.0
            .set_position(offset)
            .map_err(|_| BootError::DeviceUnavailable("seek failed"))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BootError> {
        self.0.read(buf).map_err(|_| BootError::DeviceUnavailable("read failed"))
    }
}

pub struct EfiGraphics<'a> {
    gop: ScopedProtocol<'a, GraphicsOutput>,
}

impl<'a> EfiGraphics<'a> {
    pub fn open(bs: &'a BootServices, image: Handle) -> Result<Self, BootError> {
        let handle = bs
            .get_handle_for_protocol::<GraphicsOutput>()
            .map_err(|_| BootError::DeviceUnavailable("no graphics output"))?;

        // GetProtocol leaves the console driver's own claim on GOP alone.
        // SAFETY: only the mode and framebuffer address are read.
        let gop = unsafe {
            bs.open_protocol::<GraphicsOutput>(
                OpenProtocolParams { handle, agent: image, controller: None },
                OpenProtocolAttributes::GetProtocol,
            )
        }
        .map_err(|_| BootError::DeviceUnavailable("cannot open graphics output"))?;

        Ok(Self { gop })
    }
}

impl FramebufferSource for EfiGraphics<'_> {
    fn framebuffer(&mut self) -> Result<Framebuffer, BootError> {
        let mode = self.gop.current_mode_info();
        if mode.pixel_format() == PixelFormat::BltOnly {
            return Err(BootError::DeviceUnavailable("display has no linear framebuffer"));
        }
        let (width, height) = mode.resolution();
        let base = self.gop.frame_buffer().as_mut_ptr() as u64;

        Ok(Framebuffer { width: width as u32, height: height as u32, base })
    }
}

impl From<BootError> for Status {
    fn from(e: BootError) -> Self {
        match e {
            BootError::MalformedImage(_) => Status::LOAD_ERROR,
            BootError::ResourceExhausted(_) | BootError::AddressConflict { .. } => {
                Status::OUT_OF_RESOURCES
            }
            BootError::DeviceUnavailable(_) => Status::NOT_FOUND,
        }
    }
}
