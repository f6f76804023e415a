//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for the raw addresses the pmap layer juggles:
//! virtual addresses that are decomposed into per-level page-table indices,
//! and physical addresses that name page frames.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | A (canonical) x86-64 virtual address. |
//! | [`PhysicalAddress`] | A physical address, i.e. a frame plus an offset. |
//! | [`PageSize`] | Marker trait for [`Size4K`], [`Size2M`] and [`Size1G`]. |
//!
//! ## Page-table decomposition
//!
//! A 48-bit virtual address splits into four 9-bit table indices and a
//! 12-bit page offset:
//!
//! ```text
//!  63        48 47     39 38     30 29     21 20     12 11          0
//! +------------+---------+---------+---------+---------+-------------+
//! | sign ext.  |  L4 idx |  L3 idx |  L2 idx |  L1 idx |   offset    |
//! +------------+---------+---------+---------+---------+-------------+
//! ```
//!
//! [`VirtualAddress::table_index`] extracts the index for a given level
//! (`1` = page table, `4` = top-level directory).
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_8000_0020_3000);
//! assert_eq!(va.table_index(4), 256);
//! assert_eq!(va.table_index(2), 1);
//! assert_eq!(va.table_index(1), 3);
//! assert_eq!(va.trunc::<Size2M>().as_u64(), 0xFFFF_8000_0020_0000);
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`,
//!   and `Hash`, so they can key maps directly.
//! - All alignment and index calculations are `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod physical_address;
mod virtual_address;

pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Number of translation-table entries per table page.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Number of virtual address bits resolved by one table level.
pub const BITS_PER_LEVEL: u32 = 9;

/// Shift of the lowest table index within a virtual address.
pub const PAGE_SHIFT: u32 = Size4K::SHIFT;

/// Returns the address shift of the index used at `level` (1-based).
///
/// ```rust
/// # use kernel_memory_addresses::level_shift;
/// assert_eq!(level_shift(1), 12);
/// assert_eq!(level_shift(4), 39);
/// ```
#[inline]
#[must_use]
pub const fn level_shift(level: u8) -> u32 {
    debug_assert!(level >= 1 && level <= 4);
    PAGE_SHIFT + BITS_PER_LEVEL * (level as u32 - 1)
}

/// Returns the number of bytes one entry at `level` covers.
///
/// ```rust
/// # use kernel_memory_addresses::level_span;
/// assert_eq!(level_span(1), 4096);
/// assert_eq!(level_span(2), 2 * 1024 * 1024);
/// ```
#[inline]
#[must_use]
pub const fn level_span(level: u8) -> u64 {
    1u64 << level_shift(level)
}
