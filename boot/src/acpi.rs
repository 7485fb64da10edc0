//! ACPI root pointer discovery.
//!
//! Firmware publishes the RSDP in its configuration table under one GUID per
//! ACPI revision. The newest revision present wins; among entries of the same
//! revision the first one seen wins. Only the winning table is kept, copied
//! into kernel-owned pages.

use r_efi::efi::Guid;

use crate::config::pages_for;
use crate::error::BootError;
use crate::firmware::{ConfigTable, PageClaim, PhysicalMemory};

/// ACPI 2.0+ RSDP (`EFI_ACPI_20_TABLE_GUID`).
pub const ACPI_20_TABLE_GUID: Guid = Guid::from_fields(
    0x8868_e871,
    0xe4f1,
    0x11d3,
    0xbc,
    0x22,
    &[0x00, 0x80, 0xc7, 0x3c, 0x88, 0x81],
);

/// ACPI 1.0 RSDP (`ACPI_TABLE_GUID`).
pub const ACPI_10_TABLE_GUID: Guid = Guid::from_fields(
    0xeb9d_2d30,
    0x2d88,
    0x11d3,
    0x9a,
    0x16,
    &[0x00, 0x90, 0x27, 0x3f, 0xc1, 0x4d],
);

/// Size of an ACPI 2.0 RSDP including the extended fields.
pub const RSDP_V2_SIZE: usize = 36;
/// Size of an ACPI 1.0 RSDP.
pub const RSDP_V1_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcpiCandidate {
    pub guid: Guid,
    pub revision: &'static str,
    pub copy_size: usize,
}

/// Ordered by preference, newest first.
pub const ACPI_CANDIDATES: [AcpiCandidate; 2] = [
    AcpiCandidate { guid: ACPI_20_TABLE_GUID, revision: "2.0", copy_size: RSDP_V2_SIZE },
    AcpiCandidate { guid: ACPI_10_TABLE_GUID, revision: "1.0", copy_size: RSDP_V1_SIZE },
];

/// Preference rank of `guid`; lower is better. `None` for non-ACPI tables.
pub fn candidate_rank(guid: &Guid) -> Option<usize> {
    ACPI_CANDIDATES.iter().position(|c| c.guid == *guid)
}

/// The RSDP copy handed to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootPointer {
    pub claim: PageClaim,
    pub rank: usize,
}

impl RootPointer {
    #[inline]
    pub fn address(&self) -> u64 {
        self.claim.base
    }

    #[inline]
    pub fn candidate(&self) -> &'static AcpiCandidate {
        &ACPI_CANDIDATES[self.rank]
    }
}

/// Scan `tables` and copy the best RSDP into freshly claimed pages.
///
/// A better-ranked match replaces the retained copy, whose pages are released
/// first. `Ok(None)` when firmware published no ACPI table at all.
pub fn copy_root_pointer<M: PhysicalMemory>(
    mem: &mut M,
    tables: &[ConfigTable],
) -> Result<Option<RootPointer>, BootError> {
    let mut retained: Option<RootPointer> = None;

    for table in tables {
        let Some(rank) = candidate_rank(&table.guid) else {
            continue;
        };
        if retained.is_some_and(|held| held.rank <= rank) {
            continue;
        }

        if let Some(old) = retained.take() {
            log::debug!(
                "ACPI {} supersedes {} copy at {:#x}",
                ACPI_CANDIDATES[rank].revision,
                old.candidate().revision,
                old.address()
            );
            mem.release(old.claim)?;
        }

        retained = Some(copy_table(mem, table, rank)?);
    }

    match &retained {
        Some(root) => log::info!(
            "ACPI {} RSDP copied to {:#x}",
            root.candidate().revision,
            root.address()
        ),
        None => log::warn!("No ACPI RSDP published by firmware; kernel boots without ACPI"),
    }

    Ok(retained)
}

fn copy_table<M: PhysicalMemory>(
    mem: &mut M,
    table: &ConfigTable,
    rank: usize,
) -> Result<RootPointer, BootError> {
    let size = ACPI_CANDIDATES[rank].copy_size;
    let claim = mem.claim_any(pages_for(size))?;

    // SAFETY: firmware guarantees a table of at least the revision's RSDP size
    // behind a configuration table entry carrying that revision's GUID; the
    // destination was claimed just above.
    unsafe {
        let src = core::slice::from_raw_parts(table.address, size);
        mem.slice_mut(claim.base, size).copy_from_slice(src);
    }

    Ok(RootPointer { claim, rank })
}

/// Release the copy again when the attempt is abandoned.
pub fn release_root_pointer<M: PhysicalMemory>(mem: &mut M, root: Option<RootPointer>) {
    if let Some(root) = root {
        if let Err(e) = mem.release(root.claim) {
            log::warn!("Could not release ACPI copy at {:#x}: {}", root.address(), e);
        }
    }
}
