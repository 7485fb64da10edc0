//! ELF64 on-disk structures and the header checks the loader insists on.
//!
//! Layout (little-endian, ELF64):
//!   +----------------------+ 0
//!   | Elf64Header          | 64
//!   +----------------------+ e_phoff
//!   | Elf64ProgramHeader   | e_phentsize each, e_phnum of them
//!   +----------------------+
//!   | segment bytes ...    | p_offset / p_filesz
//!   +----------------------+
//!
//! Only statically linked executables placed at fixed physical addresses are
//! accepted. Nothing here is relocated.

use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes};

use crate::error::BootError;

pub const ELF_MAGIC: [u8; 4] = *b"\x7FELF";
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const ET_EXEC: u16 = 2;
pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;
pub const PT_LOAD: u32 = 1;

/// Machine the loaded kernel must be built for.
#[cfg(target_arch = "aarch64")]
pub const EXPECTED_MACHINE: u16 = EM_AARCH64;
#[cfg(not(target_arch = "aarch64"))]
pub const EXPECTED_MACHINE: u16 = EM_X86_64;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;

pub const HEADER_SIZE: usize = core::mem::size_of::<Elf64Header>();
pub const PROGRAM_HEADER_SIZE: usize = core::mem::size_of::<Elf64ProgramHeader>();

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, AsBytes)]
pub struct Elf64Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, AsBytes)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

const _: () = assert!(HEADER_SIZE == 64);
const _: () = assert!(PROGRAM_HEADER_SIZE == 56);

impl Elf64Header {
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Self {
        // Every bit pattern is a valid header; the checks live in `validate`.
        Self::read_from(&bytes[..]).unwrap_or_else(Self::new_zeroed)
    }

    /// Strict match on every identification constant. No partial tolerance.
    pub fn validate(&self) -> Result<(), BootError> {
        if self.e_ident[..4] != ELF_MAGIC {
            return Err(BootError::MalformedImage("bad ELF magic"));
        }
        if self.e_ident[EI_CLASS] != ELFCLASS64 {
            return Err(BootError::MalformedImage("not a 64-bit ELF"));
        }
        if self.e_ident[EI_DATA] != ELFDATA2LSB {
            return Err(BootError::MalformedImage("not little-endian"));
        }
        if self.e_type != ET_EXEC {
            return Err(BootError::MalformedImage("not an executable"));
        }
        if self.e_machine != EXPECTED_MACHINE {
            return Err(BootError::MalformedImage("wrong target machine"));
        }
        if self.e_phnum == 0 {
            return Err(BootError::MalformedImage("no program headers"));
        }
        if (self.e_phentsize as usize) < PROGRAM_HEADER_SIZE {
            return Err(BootError::MalformedImage("program header entry too small"));
        }
        Ok(())
    }

    /// File offset of program header `index`.
    pub fn program_header_offset(&self, index: u16) -> Result<u64, BootError> {
        (index as u64)
            .checked_mul(self.e_phentsize as u64)
            .and_then(|rel| self.e_phoff.checked_add(rel))
            .ok_or(BootError::MalformedImage("program header table overflows"))
    }
}

bitflags! {
    /// `p_flags`. Decoded for diagnostics only; the loader enforces no permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXECUTE = 1 << 0;
        const WRITE   = 1 << 1;
        const READ    = 1 << 2;
    }
}

impl SegmentFlags {
    pub fn perms(&self) -> [char; 3] {
        [
            if self.contains(Self::READ) { 'R' } else { '-' },
            if self.contains(Self::WRITE) { 'W' } else { '-' },
            if self.contains(Self::EXECUTE) { 'X' } else { '-' },
        ]
    }
}

/// A program header the loader cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub kind: u32,
    pub flags: SegmentFlags,
    pub offset: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

impl From<Elf64ProgramHeader> for Segment {
    fn from(ph: Elf64ProgramHeader) -> Self {
        Self {
            kind: ph.p_type,
            flags: SegmentFlags::from_bits_truncate(ph.p_flags),
            offset: ph.p_offset,
            paddr: ph.p_paddr,
            filesz: ph.p_filesz,
            memsz: ph.p_memsz,
        }
    }
}

impl Segment {
    pub fn parse(bytes: &[u8; PROGRAM_HEADER_SIZE]) -> Self {
        Elf64ProgramHeader::read_from(&bytes[..])
            .unwrap_or_else(Elf64ProgramHeader::new_zeroed)
            .into()
    }

    #[inline]
    pub fn is_load(&self) -> bool {
        self.kind == PT_LOAD
    }

    /// memsz < filesz is rejected rather than truncated.
    pub fn validate(&self) -> Result<(), BootError> {
        if self.memsz < self.filesz {
            return Err(BootError::MalformedImage("segment memsz smaller than filesz"));
        }
        if self.paddr.checked_add(self.memsz).is_none() {
            return Err(BootError::MalformedImage("segment wraps the address space"));
        }
        if self.offset.checked_add(self.filesz).is_none() {
            return Err(BootError::MalformedImage("segment file range overflows"));
        }
        Ok(())
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.paddr + self.memsz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_header() -> Elf64Header {
        let mut h = Elf64Header::new_zeroed();
        h.e_ident[..4].copy_from_slice(&ELF_MAGIC);
        h.e_ident[EI_CLASS] = ELFCLASS64;
        h.e_ident[EI_DATA] = ELFDATA2LSB;
        h.e_type = ET_EXEC;
        h.e_machine = EXPECTED_MACHINE;
        h.e_phoff = 64;
        h.e_phentsize = PROGRAM_HEADER_SIZE as u16;
        h.e_phnum = 1;
        h
    }

    #[test]
    fn header_good() {
        assert!(good_header().validate().is_ok());
    }

    #[test]
    fn header_parse_is_byte_exact() {
        let h = good_header();
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(h.as_bytes());
        let back = Elf64Header::parse(&raw);
        assert_eq!(back.as_bytes(), h.as_bytes());
    }

    #[test]
    fn header_rejects_each_mismatch() {
        let cases: [(fn(&mut Elf64Header), &str); 7] = [
            (|h| h.e_ident[0] = 0, "bad ELF magic"),
            (|h| h.e_ident[EI_CLASS] = 1, "not a 64-bit ELF"),
            (|h| h.e_ident[EI_DATA] = 2, "not little-endian"),
            (|h| h.e_type = 3, "not an executable"),
            (|h| h.e_machine = 0x28, "wrong target machine"),
            (|h| h.e_phnum = 0, "no program headers"),
            (|h| h.e_phentsize = 32, "program header entry too small"),
        ];
        for (corrupt, why) in cases {
            let mut h = good_header();
            corrupt(&mut h);
            assert_eq!(h.validate(), Err(BootError::MalformedImage(why)));
        }
    }

    #[test]
    fn program_header_offsets_use_entry_size() {
        let mut h = good_header();
        h.e_phentsize = 64;
        assert_eq!(h.program_header_offset(0), Ok(64));
        assert_eq!(h.program_header_offset(3), Ok(64 + 3 * 64));
        h.e_phoff = u64::MAX - 10;
        assert!(h.program_header_offset(1).is_err());
    }

    #[test]
    fn segment_bounds() {
        let seg = Segment {
            kind: PT_LOAD,
            flags: SegmentFlags::READ | SegmentFlags::EXECUTE,
            offset: 0x1000,
            paddr: 0x10_0000,
            filesz: 0x2000,
            memsz: 0x1000,
        };
        assert_eq!(
            seg.validate(),
            Err(BootError::MalformedImage("segment memsz smaller than filesz"))
        );

        let wraps = Segment { paddr: u64::MAX - 0xFFF, filesz: 0, memsz: 0x2000, ..seg };
        assert!(wraps.validate().is_err());

        let ok = Segment { memsz: 0x3000, ..seg };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.end(), 0x10_3000);
        assert_eq!(ok.flags.perms(), ['R', '-', 'X']);
    }
}
