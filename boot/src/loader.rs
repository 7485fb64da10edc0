//! Fixed-address ELF64 segment loader.
//!
//! Reads the file header, then every program header individually (seeking to
//! `e_phoff + i * e_phentsize`), and materialises each `PT_LOAD` segment at
//! exactly its `p_paddr`:
//! - claim the covering physical pages at that address (never relocate)
//! - copy `p_filesz` bytes from `p_offset`
//! - zero-fill up to `p_memsz`
//!
//! All program headers are validated before the first page is claimed, so a
//! malformed image leaves physical memory untouched. If a claim or read fails
//! half-way, every range claimed so far is released again.

use alloc::vec::Vec;

use crate::config::PAGE_SIZE;
use crate::elf::{Elf64Header, Segment, HEADER_SIZE, PROGRAM_HEADER_SIZE};
use crate::error::BootError;
use crate::firmware::{ImageSource, PageClaim, PhysicalMemory};

/// A kernel materialised in physical memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    entry: u64,
    claims: Vec<PageClaim>,
}

impl LoadedImage {
    /// `e_entry`. The kernel is called there with the boot info block as argument.
    #[inline]
    pub fn entry(&self) -> u64 {
        self.entry
    }

    #[inline]
    pub fn claims(&self) -> &[PageClaim] {
        &self.claims
    }

    pub fn loaded_pages(&self) -> usize {
        self.claims.iter().map(|c| c.pages).sum()
    }

    /// Commit the image to the kernel. The claims stay and the claim list is
    /// leaked: pool memory freed after the memory map is captured would
    /// invalidate the map key.
    pub fn into_entry(self) -> u64 {
        let entry = self.entry;
        core::mem::forget(self.claims);
        entry
    }

    /// Give every claimed range back. Used when an attempt is abandoned.
    pub fn release<M: PhysicalMemory>(self, mem: &mut M) {
        release_all(mem, self.claims);
    }
}

/// Load the ELF executable behind `src` into physical memory.
pub fn load_elf<S, M>(src: &mut S, mem: &mut M) -> Result<LoadedImage, BootError>
where
    S: ImageSource,
    M: PhysicalMemory,
{
    let header = read_header(src)?;
    header.validate()?;

    log::debug!(
        "ELF: entry {:#x}, {} program headers at {:#x} (stride {})",
        header.e_entry,
        header.e_phnum,
        header.e_phoff,
        header.e_phentsize
    );

    let segments = read_load_segments(src, &header)?;
    if segments.is_empty() {
        log::warn!("ELF has no PT_LOAD segments; nothing to materialise");
    }

    let mut claims = Vec::with_capacity(segments.len());
    for seg in &segments {
        if let Err(e) = load_segment(src, mem, seg, &mut claims) {
            log::error!("Segment at {:#x} failed: {}", seg.paddr, e);
            release_all(mem, claims);
            return Err(e);
        }
    }

    Ok(LoadedImage { entry: header.e_entry, claims })
}

fn read_header<S: ImageSource>(src: &mut S) -> Result<Elf64Header, BootError> {
    let mut raw = [0u8; HEADER_SIZE];
    src.set_position(0)?;
    src.read_exact(&mut raw)?;
    Ok(Elf64Header::parse(&raw))
}

/// Pass 1: read and check every program header. Non-LOAD entries are skipped.
fn read_load_segments<S: ImageSource>(
    src: &mut S,
    header: &Elf64Header,
) -> Result<Vec<Segment>, BootError> {
    let mut segments = Vec::new();
    let mut raw = [0u8; PROGRAM_HEADER_SIZE];

    for index in 0..header.e_phnum {
        src.set_position(header.program_header_offset(index)?)?;
        src.read_exact(&mut raw)?;

        let seg = Segment::parse(&raw);
        if !seg.is_load() {
            log::debug!("phdr {}: type {:#x} skipped", index, seg.kind);
            continue;
        }
        seg.validate()?;
        segments.push(seg);
    }

    Ok(segments)
}

/// Pass 2: claim the segment's pages and fill them.
fn load_segment<S, M>(
    src: &mut S,
    mem: &mut M,
    seg: &Segment,
    claims: &mut Vec<PageClaim>,
) -> Result<(), BootError>
where
    S: ImageSource,
    M: PhysicalMemory,
{
    if seg.memsz == 0 {
        log::debug!("Empty PT_LOAD at {:#x} skipped", seg.paddr);
        return Ok(());
    }

    let memsz = usize::try_from(seg.memsz)
        .map_err(|_| BootError::MalformedImage("segment larger than address space"))?;
    let filesz = seg.filesz as usize;

    let span_start = align_down(seg.paddr);
    let span_end = align_up(seg.end())
        .ok_or(BootError::MalformedImage("segment wraps the address space"))?;

    // Pages anywhere in the span may already belong to another segment of
    // this image when two segments share a page; claim only the gaps.
    let mut page = span_start;
    while page < span_end {
        if claims.iter().any(|c| c.contains(page)) {
            page += PAGE_SIZE as u64;
            continue;
        }
        let run_start = page;
        while page < span_end && !claims.iter().any(|c| c.contains(page)) {
            page += PAGE_SIZE as u64;
        }
        let pages = ((page - run_start) as usize) / PAGE_SIZE;
        claims.push(mem.claim_at(run_start, pages)?);
    }

    log::info!(
        "PT_LOAD {:#x}..{:#x} ({} file bytes, {}) from offset {:#x}",
        seg.paddr,
        seg.end(),
        seg.filesz,
        seg.flags.perms().iter().collect::<alloc::string::String>(),
        seg.offset
    );

    // SAFETY: every page covering [paddr, paddr + memsz) is owned by this image,
    // either claimed just now or by an earlier segment.
    let dst = unsafe { mem.slice_mut(seg.paddr, memsz) };
    src.set_position(seg.offset)?;
    src.read_exact(&mut dst[..filesz])?;
    dst[filesz..].fill(0);

    Ok(())
}

fn release_all<M: PhysicalMemory>(mem: &mut M, claims: Vec<PageClaim>) {
    for claim in claims.into_iter().rev() {
        if let Err(e) = mem.release(claim) {
            log::warn!("Could not release {:#x} (+{} pages): {}", claim.base, claim.pages, e);
        }
    }
}

#[inline]
fn align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

#[inline]
fn align_up(addr: u64) -> Option<u64> {
    addr.checked_add(PAGE_SIZE as u64 - 1).map(align_down)
}
