//! In-memory stand-ins for every firmware capability, used by the unit tests.
//!
//! Physical memory is an 8 MiB arena whose offsets are the physical
//! addresses, pre-filled with [`ARENA_FILL`] so untouched bytes are visible.

use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use bootinfo::Framebuffer;
use r_efi::efi::{self, Guid};
use zerocopy::AsBytes;

use crate::config::PAGE_SIZE;
use crate::elf::{
    Elf64Header, Elf64ProgramHeader, ELFCLASS64, ELFDATA2LSB, ELF_MAGIC, ET_EXEC,
    EXPECTED_MACHINE, HEADER_SIZE, PROGRAM_HEADER_SIZE,
};
use crate::error::BootError;
use crate::firmware::{
    CapturedMap, ConfigTable, ConfigTables, ExitFailure, ExitRejected, Firmware,
    FramebufferSource, ImageSource, Machine, MapKey, MapSize, MemoryMapSource, PageClaim,
    PhysicalMemory, Volume,
};

pub const ARENA_FILL: u8 = 0xAA;
pub const ARENA_SIZE: usize = 8 << 20;

/// First address handed out by `claim_any`; fixed-address loads sit below it.
pub const CLAIM_ANY_BASE: u64 = 0x40_0000;

const PAGE: u64 = PAGE_SIZE as u64;

/// Simulated physical memory. Backed by `u64`s so page-aligned addresses are
/// 8-byte aligned in the host process too.
pub struct Arena {
    words: Vec<u64>,
}

impl Arena {
    fn new() -> Self {
        Self { words: vec![u64::from_ne_bytes([ARENA_FILL; 8]); ARENA_SIZE / 8] }
    }

    fn bytes(&self) -> &[u8] {
        self.words.as_bytes()
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.words.as_bytes_mut()
    }

    pub fn read(&self, base: u64, len: usize) -> Vec<u8> {
        let start = base as usize;
        self.bytes()[start..start + len].to_vec()
    }
}

pub struct FakeFirmware {
    arena: Arena,
    claimed: BTreeSet<u64>,
    occupied: BTreeSet<u64>,
    map: Vec<(u32, u64, u64)>,
    descriptor_size: usize,
    map_growth: usize,
    key: usize,
    stale_keys: usize,
    exit_status: Option<usize>,
    claim_any_budget: Option<usize>,
    pub captures: usize,
    pub exit_calls: usize,
}

impl FakeFirmware {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
            claimed: BTreeSet::new(),
            occupied: BTreeSet::new(),
            map: vec![
                (efi::CONVENTIONAL_MEMORY, 0x0, 0x9F),
                (efi::RESERVED_MEMORY_TYPE, 0x9_F000, 0x61),
                (efi::LOADER_CODE, 0x10_0000, 0x100),
                (efi::CONVENTIONAL_MEMORY, 0x20_0000, 0x200),
                (efi::BOOT_SERVICES_DATA, 0x40_0000, 0x400),
                (efi::ACPI_RECLAIM_MEMORY, 0x80_0000, 0x10),
                (efi::ACPI_MEMORY_NVS, 0x81_0000, 0x10),
            ],
            descriptor_size: 48,
            map_growth: 0,
            key: 1,
            stale_keys: 0,
            exit_status: None,
            claim_any_budget: None,
            captures: 0,
            exit_calls: 0,
        }
    }

    /// Mark pages as owned by someone other than the loader.
    pub fn occupy(&mut self, base: u64, pages: usize) {
        for page in page_range(base, pages) {
            self.occupied.insert(page);
        }
    }

    /// Pages currently claimed through [`PhysicalMemory`].
    pub fn claimed_pages(&self) -> usize {
        self.claimed.len()
    }

    pub fn read_phys(&self, base: u64, len: usize) -> Vec<u8> {
        self.arena.read(base, len)
    }

    /// `claim_any` starts failing after `n` more successful calls.
    pub fn fail_claim_any_after(&mut self, n: usize) {
        self.claim_any_budget = Some(n);
    }

    pub fn set_memory_map(&mut self, descriptor_size: usize, map: Vec<(u32, u64, u64)>) {
        self.descriptor_size = descriptor_size;
        self.map = map;
    }

    /// Captures report `n` more descriptors than the size query did.
    pub fn grow_map_on_capture(&mut self, n: usize) {
        self.map_growth = n;
    }

    /// The next `n` ExitBootServices calls see a map that changed under them.
    pub fn invalidate_keys(&mut self, n: usize) {
        self.stale_keys = n;
    }

    pub fn reject_exit(&mut self, status: usize) {
        self.exit_status = Some(status);
    }

    /// The configured map as firmware would report it now: pages claimed
    /// through [`PhysicalMemory`] split out as `EfiReservedMemoryType`.
    fn current_map(&self) -> Vec<(u32, u64, u64)> {
        let mut descs = Vec::new();
        for &(ty, start, pages) in &self.map {
            let mut run: Option<(u32, u64, u64)> = None;
            for page in page_range(start, pages as usize) {
                let page_ty =
                    if self.claimed.contains(&page) { efi::RESERVED_MEMORY_TYPE } else { ty };
                if let Some(r) = run.as_mut().filter(|r| r.0 == page_ty) {
                    r.2 += 1;
                    continue;
                }
                descs.extend(run.take());
                run = Some((page_ty, page * PAGE, 1));
            }
            descs.extend(run);
        }
        descs
    }

    fn descriptors(&self) -> Vec<(u32, u64, u64)> {
        let mut descs = self.current_map();
        let top = descs.iter().map(|&(_, start, pages)| start + pages * PAGE).max().unwrap_or(0);
        for i in 0..self.map_growth as u64 {
            descs.push((efi::MEMORY_MAPPED_IO, top + (2 * i + 1) * PAGE, 1));
        }
        descs
    }

    fn is_free(&self, page: u64) -> bool {
        (page + 1) * PAGE <= ARENA_SIZE as u64
            && !self.claimed.contains(&page)
            && !self.occupied.contains(&page)
    }
}

fn page_range(base: u64, pages: usize) -> core::ops::Range<u64> {
    let first = base / PAGE;
    first..first + pages as u64
}

impl PhysicalMemory for FakeFirmware {
    fn claim_at(&mut self, base: u64, pages: usize) -> Result<PageClaim, BootError> {
        assert_eq!(base % PAGE, 0, "unaligned claim at {:#x}", base);
        if !page_range(base, pages).all(|p| self.is_free(p)) {
            return Err(BootError::AddressConflict { base, pages });
        }
        self.claimed.extend(page_range(base, pages));
        self.key += 1;
        Ok(PageClaim { base, pages })
    }

    fn claim_any(&mut self, pages: usize) -> Result<PageClaim, BootError> {
        if let Some(budget) = self.claim_any_budget.as_mut() {
            if *budget == 0 {
                return Err(BootError::ResourceExhausted("fake firmware out of pages"));
            }
            *budget -= 1;
        }

        let mut base = CLAIM_ANY_BASE;
        while base + (pages as u64) * PAGE <= ARENA_SIZE as u64 {
            if page_range(base, pages).all(|p| self.is_free(p)) {
                return self.claim_at(base, pages);
            }
            base += PAGE;
        }
        Err(BootError::ResourceExhausted("fake firmware out of pages"))
    }

    fn release(&mut self, claim: PageClaim) -> Result<(), BootError> {
        if !page_range(claim.base, claim.pages).all(|p| self.claimed.contains(&p)) {
            return Err(BootError::ResourceExhausted("release of unclaimed pages"));
        }
        for page in page_range(claim.base, claim.pages) {
            self.claimed.remove(&page);
        }
        self.key += 1;
        Ok(())
    }

    unsafe fn slice_mut(&mut self, base: u64, len: usize) -> &mut [u8] {
        let pages = ((base % PAGE) as usize + len).div_ceil(PAGE_SIZE);
        assert!(
            page_range(base - base % PAGE, pages).all(|p| self.claimed.contains(&p)),
            "write to unclaimed memory at {:#x} (+{} bytes)",
            base,
            len
        );
        let start = base as usize;
        &mut self.arena.bytes_mut()[start..start + len]
    }
}

impl MemoryMapSource for FakeFirmware {
    fn memory_map_size(&mut self) -> Result<MapSize, BootError> {
        Ok(MapSize {
            map_size: self.current_map().len() * self.descriptor_size,
            descriptor_size: self.descriptor_size,
        })
    }

    fn capture_memory_map(&mut self, buffer: &PageClaim) -> Result<CapturedMap, BootError> {
        self.captures += 1;
        let descs = self.descriptors();
        let len = descs.len() * self.descriptor_size;
        if len > buffer.len() {
            return Err(BootError::ResourceExhausted("memory map buffer too small"));
        }

        let stride = self.descriptor_size;
        // SAFETY: the buffer is a claim of this firmware.
        let out = unsafe { self.slice_mut(buffer.base, len) };
        for (i, &(ty, start, pages)) in descs.iter().enumerate() {
            let desc = efi::MemoryDescriptor {
                r#type: ty,
                physical_start: start,
                virtual_start: 0,
                number_of_pages: pages,
                attribute: 0,
            };
            let slot = &mut out[i * stride..(i + 1) * stride];
            slot.fill(0xEE);
            // SAFETY: `stride` is at least the descriptor size for every map
            // these tests build.
            unsafe { slot.as_mut_ptr().cast::<efi::MemoryDescriptor>().write_unaligned(desc) };
        }

        Ok(CapturedMap { len, descriptor_size: stride, key: MapKey(self.key) })
    }
}

impl Firmware for FakeFirmware {
    type Machine = FakeMachine;

    fn exit_boot_services(mut self, key: MapKey) -> Result<FakeMachine, ExitRejected<Self>> {
        self.exit_calls += 1;

        if let Some(status) = self.exit_status {
            return Err(ExitRejected { firmware: self, reason: ExitFailure::Status(status) });
        }
        if self.stale_keys > 0 {
            // Some event allocated behind the loader's back.
            self.stale_keys -= 1;
            self.key += 1;
        }
        if key != MapKey(self.key) {
            return Err(ExitRejected { firmware: self, reason: ExitFailure::StaleKey });
        }

        Ok(FakeMachine { arena: self.arena, interrupts_enabled: true, exit_calls: self.exit_calls })
    }

    fn halt(self) -> ! {
        panic!("firmware halted")
    }
}

/// The platform after ExitBootServices. Memory contents survive the fence.
pub struct FakeMachine {
    arena: Arena,
    pub interrupts_enabled: bool,
    pub exit_calls: usize,
}

impl FakeMachine {
    pub fn read_phys(&self, base: u64, len: usize) -> Vec<u8> {
        self.arena.read(base, len)
    }
}

impl Machine for FakeMachine {
    fn disable_interrupts(&mut self) {
        self.interrupts_enabled = false;
    }

    unsafe fn enter_kernel(self, entry: u64, magic: u64, info: u64) -> ! {
        panic!("entered kernel at {:#x} with magic {:#x} info {:#x}", entry, magic, info)
    }
}

/// An opened file served from memory, optionally in short reads.
pub struct FakeImage {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
}

impl FakeImage {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0, chunk: usize::MAX }
    }

    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk;
        self
    }
}

impl ImageSource for FakeImage {
    fn set_position(&mut self, offset: u64) -> Result<(), BootError> {
        self.pos = offset as usize;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BootError> {
        let rest = self.data.get(self.pos..).unwrap_or(&[]);
        let n = buf.len().min(rest.len()).min(self.chunk);
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Ok(n)
    }
}

#[derive(Default)]
pub struct FakeVolume {
    files: Vec<(String, Vec<u8>)>,
    pub opened: Vec<String>,
}

impl FakeVolume {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, data: Vec<u8>) -> Self {
        self.files.push((path.into(), data));
        self
    }
}

impl Volume for FakeVolume {
    type File = FakeImage;

    fn open(&mut self, path: &str) -> Result<FakeImage, BootError> {
        self.opened.push(path.into());
        self.files
            .iter()
            .find(|(name, _)| name == path)
            .map(|(_, data)| FakeImage::new(data.clone()))
            .ok_or(BootError::DeviceUnavailable("file not found"))
    }
}

/// Configuration tables in firmware order. Table bodies live in the host heap.
#[derive(Default)]
pub struct FakeTables {
    tables: Vec<(Guid, Vec<u8>)>,
}

impl FakeTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, guid: Guid, body: Vec<u8>) {
        self.tables.push((guid, body));
    }

    pub fn entries(&self) -> Vec<ConfigTable> {
        self.tables
            .iter()
            .map(|(guid, body)| ConfigTable { guid: *guid, address: body.as_ptr() })
            .collect()
    }
}

impl ConfigTables for FakeTables {
    fn config_tables(&self) -> Vec<ConfigTable> {
        self.entries()
    }
}

pub struct FakeDisplay {
    mode: Option<Framebuffer>,
    pub queries: usize,
}

impl FakeDisplay {
    pub fn new(mode: Option<Framebuffer>) -> Self {
        Self { mode, queries: 0 }
    }
}

impl FramebufferSource for FakeDisplay {
    fn framebuffer(&mut self) -> Result<Framebuffer, BootError> {
        self.queries += 1;
        self.mode.ok_or(BootError::DeviceUnavailable("no graphics output"))
    }
}

/// Builds little ELF64 executables for the loader tests.
pub struct ElfBuilder {
    header: Elf64Header,
    segments: Vec<(Elf64ProgramHeader, Vec<u8>)>,
}

impl ElfBuilder {
    pub fn new(entry: u64) -> Self {
        let mut header = Elf64Header {
            e_ident: [0; 16],
            e_type: ET_EXEC,
            e_machine: EXPECTED_MACHINE,
            e_version: 1,
            e_entry: entry,
            e_phoff: HEADER_SIZE as u64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: HEADER_SIZE as u16,
            e_phentsize: PROGRAM_HEADER_SIZE as u16,
            e_phnum: 0,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        };
        header.e_ident[..4].copy_from_slice(&ELF_MAGIC);
        header.e_ident[4] = ELFCLASS64;
        header.e_ident[5] = ELFDATA2LSB;
        header.e_ident[6] = 1;
        Self { header, segments: Vec::new() }
    }

    pub fn phentsize(mut self, size: u16) -> Self {
        self.header.e_phentsize = size;
        self
    }

    pub fn segment(mut self, p_type: u32, paddr: u64, data: Vec<u8>, memsz: u64) -> Self {
        let ph = Elf64ProgramHeader {
            p_type,
            p_flags: 0b101,
            p_offset: 0,
            p_vaddr: paddr,
            p_paddr: paddr,
            p_filesz: data.len() as u64,
            p_memsz: memsz,
            p_align: PAGE,
        };
        self.segments.push((ph, data));
        self.header.e_phnum += 1;
        self
    }

    pub fn header_mut(&mut self) -> &mut Elf64Header {
        &mut self.header
    }

    /// Header, then the program header table at `e_phentsize` stride, then
    /// segment bodies back to back.
    pub fn build(&self) -> Vec<u8> {
        let stride = usize::from(self.header.e_phentsize).max(PROGRAM_HEADER_SIZE);
        let table_end = HEADER_SIZE + stride * self.segments.len();

        let mut out = vec![0u8; table_end];
        out[..HEADER_SIZE].copy_from_slice(self.header.as_bytes());

        for (i, (ph, data)) in self.segments.iter().enumerate() {
            let mut ph = *ph;
            ph.p_offset = out.len() as u64;
            let at = HEADER_SIZE + i * stride;
            out[at..at + PROGRAM_HEADER_SIZE].copy_from_slice(ph.as_bytes());
            out.extend_from_slice(data);
        }
        out
    }
}
