//! Boot attempt failure taxonomy.
//!
//! Every variant describes a failure that happened *before* firmware services
//! were terminated, so it can still be reported and the attempt abandoned in
//! favour of another boot entry. Nothing past the fence produces a `BootError`.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// ELF validation failed (header constants, zero segments, memsz < filesz, truncation)
    MalformedImage(&'static str),
    /// Physical page or buffer allocation failed
    ResourceExhausted(&'static str),
    /// A fixed load address is already claimed
    AddressConflict { base: u64, pages: usize },
    /// Filesystem, display or table enumeration collaborator failed
    DeviceUnavailable(&'static str),
}

impl BootError {
    /// Validation failures are the image's fault; retrying the same entry will not help.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::MalformedImage(_))
    }

    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_) | Self::AddressConflict { .. })
    }

    /// Heading of the failure screen.
    pub fn heading(&self) -> &'static str {
        if self.is_validation() {
            "KERNEL REJECTED"
        } else if self.is_resource_exhaustion() {
            "OUT OF MEMORY"
        } else {
            "BOOT FAILED"
        }
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedImage(why) => write!(f, "malformed kernel image: {}", why),
            Self::ResourceExhausted(what) => write!(f, "out of resources: {}", what),
            Self::AddressConflict { base, pages } => write!(
                f,
                "fixed load range {:#x} (+{} pages) is already claimed",
                base, pages
            ),
            Self::DeviceUnavailable(what) => write!(f, "device unavailable: {}", what),
        }
    }
}
