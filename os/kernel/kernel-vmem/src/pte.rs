//! # Page-Table Entry Bits
//!
//! [`Pte`] is the 64-bit entry format shared by all four levels. Directory
//! entries only use the permission bits and the frame; leaf entries also
//! carry the hardware-maintained accessed/dirty bits and the two
//! software-defined bits the pmap relies on:
//!
//! | Bits  | Field          | Mnemonic | Notes |
//! |-------|----------------|----------|-------|
//! | 0     | `present`      | `V`      | Entry is valid. |
//! | 1     | `writable`     | `RW`     | Writes allowed. |
//! | 2     | `user`         | `U/S`    | User-mode access allowed. |
//! | 3     | `write_through`| `PWT`    | |
//! | 4     | `cache_disable`| `PCD`    | |
//! | 5     | `accessed`     | `A`      | Set by hardware; the pmap's "referenced". |
//! | 6     | `dirty`        | `D`      | Set by hardware on write; the pmap's "modified". |
//! | 7     | `large_page`   | `PS`     | Leaf at level 2 or 3. |
//! | 8     | `global`       | `G`      | Survives non-global flushes. |
//! | 9     | `wired`        | `W`      | Software: mapping is wired. |
//! | 10    | `pvlist`       | `PVLIST` | Software: mapping is recorded in a PV list. |
//! | 12–51 | `frame`        |          | Physical frame number. |
//! | 63    | `no_execute`   | `NX`     | Instruction fetch disallowed. |
//!
//! The [`mask`] module exposes the same bits as raw `u64` masks for the
//! atomic read-modify-write paths, which operate on plain integers.

use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// Raw masks for the bits of [`Pte`].
pub mod mask {
    pub const PRESENT: u64 = 1 << 0;
    pub const WRITABLE: u64 = 1 << 1;
    pub const USER: u64 = 1 << 2;
    pub const WRITE_THROUGH: u64 = 1 << 3;
    pub const CACHE_DISABLE: u64 = 1 << 4;
    pub const ACCESSED: u64 = 1 << 5;
    pub const DIRTY: u64 = 1 << 6;
    pub const LARGE_PAGE: u64 = 1 << 7;
    pub const GLOBAL: u64 = 1 << 8;
    pub const WIRED: u64 = 1 << 9;
    pub const PVLIST: u64 = 1 << 10;
    pub const FRAME: u64 = 0x000F_FFFF_FFFF_F000;
    pub const NO_EXECUTE: u64 = 1 << 63;
}

#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Pte {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    /// Hardware "accessed"; the translation may be cached in some TLB.
    pub accessed: bool,
    /// Hardware "dirty"; a write went through this translation.
    pub dirty: bool,
    pub large_page: bool,
    pub global: bool,
    pub wired: bool,
    /// The mapped frame is tracked by a PV entry.
    pub pvlist: bool,
    #[bits(1)]
    __: u8,
    #[bits(40)]
    frame: u64,
    #[bits(11)]
    __: u16,
    pub no_execute: bool,
}

impl Pte {
    /// An entry pointing at `frame` with the given flags.
    #[inline]
    #[must_use]
    pub const fn with_address(self, pa: PhysicalAddress) -> Self {
        self.with_frame(pa.frame_number())
    }

    /// The frame address stored in the entry.
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::from_frame_number(self.frame())
    }

    /// A directory entry pointing to the next-level table at `table`.
    ///
    /// User tables get `U/S` so that user leaves below are reachable;
    /// permissions are then decided by the leaf.
    #[inline]
    #[must_use]
    pub const fn directory(table: PhysicalAddress, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_address(table)
    }
}

/// Returns the frame address of a raw entry.
#[inline]
#[must_use]
pub const fn frame_of(raw: u64) -> PhysicalAddress {
    PhysicalAddress::new(raw & mask::FRAME)
}

/// Returns `true` if the raw entry has the `V` bit.
#[inline]
#[must_use]
pub const fn is_valid(raw: u64) -> bool {
    raw & mask::PRESENT != 0
}
