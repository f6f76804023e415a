//! # Protections, Enter Flags and Page Attributes
//!
//! | Type          | Meaning                                                  |
//! |---------------|----------------------------------------------------------|
//! | [`Prot`]      | VM protection: read, write, execute                      |
//! | [`EnterFlags`]| Access type plus `wired`, `canfail`, `nocache`           |
//! | [`PageAttrs`] | Referenced / modified / writable selector for a page     |
//!
//! [`pte_bits`] turns a protection into the hardware bits of a leaf entry:
//!
//! ```text
//! WRITE      ─► RW
//! !EXECUTE   ─► NX
//! user VA    ─► U/S        (applied by the caller)
//! kernel map ─► G          (applied by the caller)
//! ```

use bitfield_struct::bitfield;
use kernel_vmem::mask;

/// VM protection.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Prot {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    #[bits(5)]
    __: u8,
}

impl Prot {
    pub const NONE: Self = Self::new();
    pub const READ: Self = Self::new().with_read(true);
    pub const READ_WRITE: Self = Self::READ.with_write(true);
    pub const READ_EXECUTE: Self = Self::READ.with_execute(true);
    pub const ALL: Self = Self::READ_WRITE.with_execute(true);

    /// Returns `true` if nothing at all is permitted.
    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        !self.read() && !self.write() && !self.execute()
    }
}

/// Flags for [`PmapSystem::enter`](crate::PmapSystem::enter).
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct EnterFlags {
    /// The mapping is entered because of a read access.
    pub access_read: bool,
    /// The mapping is entered because of a write access.
    pub access_write: bool,
    /// The mapping is entered because of an instruction fetch.
    pub access_execute: bool,
    /// The mapping must not be removed by `collect`.
    pub wired: bool,
    /// Return [`PmapError::NoMemory`](crate::PmapError) instead of panicking.
    pub canfail: bool,
    /// Map uncached.
    pub nocache: bool,
    #[bits(2)]
    __: u8,
}

impl EnterFlags {
    /// The access type as a protection.
    #[inline]
    #[must_use]
    pub const fn access(self) -> Prot {
        Prot::new()
            .with_read(self.access_read())
            .with_write(self.access_write())
            .with_execute(self.access_execute())
    }

    #[inline]
    #[must_use]
    pub const fn with_access(self, access: Prot) -> Self {
        self.with_access_read(access.read())
            .with_access_write(access.write())
            .with_access_execute(access.execute())
    }
}

/// Selects attributes of a physical page.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct PageAttrs {
    pub referenced: bool,
    pub modified: bool,
    pub writable: bool,
    #[bits(5)]
    __: u8,
}

impl PageAttrs {
    pub const REFERENCED: Self = Self::new().with_referenced(true);
    pub const MODIFIED: Self = Self::new().with_modified(true);
    pub const WRITABLE: Self = Self::new().with_writable(true);

    /// The leaf entry bits these attributes correspond to.
    #[must_use]
    pub const fn pte_mask(self) -> u64 {
        let mut bits = 0;
        if self.referenced() {
            bits |= mask::ACCESSED;
        }
        if self.modified() {
            bits |= mask::DIRTY;
        }
        if self.writable() {
            bits |= mask::WRITABLE;
        }
        bits
    }
}

/// Hardware bits granting `prot`.
#[inline]
#[must_use]
pub const fn pte_bits(prot: Prot) -> u64 {
    let mut bits = 0;
    if prot.write() {
        bits |= mask::WRITABLE;
    }
    if !prot.execute() {
        bits |= mask::NO_EXECUTE;
    }
    bits
}
