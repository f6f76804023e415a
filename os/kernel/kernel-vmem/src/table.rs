//! # Table Walking and Entry Access
//!
//! Page-table pages are addressed by their physical frame. A [`PteSlot`]
//! is a reference to one entry, good for atomic loads, swaps and
//! compare-and-swap. [`walk`] resolves a virtual address from a root
//! directory down to its leaf, reporting where a partially populated
//! hierarchy stops:
//!
//! ```text
//! root (L4) ──idx4──► L3 table ──idx3──► L2 table ──idx2──► L1 table ──idx1──► PTE
//!      │                 │                  │
//!      └─ !V: Missing(4) └─ !V: Missing(3)  └─ !V: Missing(2)   PS=1 ⇒ Large { level }
//! ```

use crate::phys::PhysMemory;
use crate::pte::{self, mask};
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// The level of the top-level directory.
pub const TOP_LEVEL: u8 = 4;

/// One page-table entry, addressable atomically.
#[derive(Copy, Clone)]
pub struct PteSlot<'m> {
    entry: &'m AtomicU64,
}

impl<'m> PteSlot<'m> {
    #[inline]
    #[must_use]
    pub const fn new(entry: &'m AtomicU64) -> Self {
        Self { entry }
    }

    /// The slot for entry `index` of the table at `table`.
    #[inline]
    #[must_use]
    pub fn of(mem: &'m PhysMemory, table: PhysicalAddress, index: usize) -> Self {
        Self::new(mem.frame_at(table).word(index))
    }

    #[inline]
    #[must_use]
    pub fn load(&self) -> u64 {
        self.entry.load(Ordering::SeqCst)
    }

    /// Atomically replaces the entry, returning the old value.
    #[inline]
    pub fn swap(&self, new: u64) -> u64 {
        self.entry.swap(new, Ordering::SeqCst)
    }

    /// Installs `new` if the entry still holds `current`.
    ///
    /// # Errors
    /// The value actually found when it was not `current`.
    #[inline]
    pub fn compare_exchange(&self, current: u64, new: u64) -> Result<u64, u64> {
        self.entry
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    /// Clears `bits`, returning the old value.
    #[inline]
    pub fn clear_bits(&self, bits: u64) -> u64 {
        self.entry.fetch_and(!bits, Ordering::SeqCst)
    }

    /// Sets `bits`, returning the old value.
    #[inline]
    pub fn set_bits(&self, bits: u64) -> u64 {
        self.entry.fetch_or(bits, Ordering::SeqCst)
    }
}

/// Result of resolving a virtual address.
#[derive(Copy, Clone)]
pub enum Walk<'m> {
    /// All directories are present; `pte` is the level-1 entry in the
    /// table at `ptp`.
    Leaf {
        ptp: PhysicalAddress,
        pte: PteSlot<'m>,
    },
    /// The entry at `level` is a large-page leaf.
    Large { level: u8, entry: u64 },
    /// The entry at `level` is not valid.
    Missing { level: u8 },
}

/// Resolves `va` starting at the directory `root`.
#[must_use]
pub fn walk(mem: &PhysMemory, root: PhysicalAddress, va: VirtualAddress) -> Walk<'_> {
    let mut table = root;
    for level in (2..=TOP_LEVEL).rev() {
        let entry = PteSlot::of(mem, table, va.table_index(level)).load();
        if !pte::is_valid(entry) {
            return Walk::Missing { level };
        }
        if level <= 3 && entry & mask::LARGE_PAGE != 0 {
            return Walk::Large { level, entry };
        }
        table = pte::frame_of(entry);
    }
    Walk::Leaf {
        ptp: table,
        pte: PteSlot::of(mem, table, va.table_index(1)),
    }
}

/// The physical address of the table at `level` (1..=3) covering `va`,
/// if every directory above it is valid.
#[must_use]
pub fn table_at(
    mem: &PhysMemory,
    root: PhysicalAddress,
    va: VirtualAddress,
    level: u8,
) -> Option<PhysicalAddress> {
    debug_assert!(level < TOP_LEVEL);
    let mut table = root;
    for l in ((level + 1)..=TOP_LEVEL).rev() {
        let entry = PteSlot::of(mem, table, va.table_index(l)).load();
        if !pte::is_valid(entry) || (l <= 3 && entry & mask::LARGE_PAGE != 0) {
            return None;
        }
        table = pte::frame_of(entry);
    }
    Some(table)
}

/// The directory entry at `level` (2..=4) that covers `va`, with the table
/// holding it, if every directory above it is valid.
#[must_use]
pub fn directory_slot<'m>(
    mem: &'m PhysMemory,
    root: PhysicalAddress,
    va: VirtualAddress,
    level: u8,
) -> Option<(PhysicalAddress, PteSlot<'m>)> {
    let table = if level == TOP_LEVEL {
        root
    } else {
        table_at(mem, root, va, level)?
    };
    Some((table, PteSlot::of(mem, table, va.table_index(level))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pte::Pte;

    fn link(mem: &PhysMemory, table: u64, index: usize, next: u64) {
        PteSlot::of(mem, PhysicalAddress::new(table), index)
            .swap(Pte::directory(PhysicalAddress::new(next), true).into_bits());
    }

    #[test]
    fn walk_reports_first_missing_level() {
        let mem = PhysMemory::new(8);
        let root = PhysicalAddress::new(0x1000);
        let va = VirtualAddress::new(0x0000_0040_2060_3000);
        assert!(matches!(walk(&mem, root, va), Walk::Missing { level: 4 }));

        link(&mem, 0x1000, va.table_index(4), 0x2000);
        link(&mem, 0x2000, va.table_index(3), 0x3000);
        assert!(matches!(walk(&mem, root, va), Walk::Missing { level: 2 }));
        assert_eq!(table_at(&mem, root, va, 2), Some(PhysicalAddress::new(0x3000)));
        assert_eq!(table_at(&mem, root, va, 1), None);

        link(&mem, 0x3000, va.table_index(2), 0x4000);
        match walk(&mem, root, va) {
            Walk::Leaf { ptp, pte } => {
                assert_eq!(ptp, PhysicalAddress::new(0x4000));
                assert_eq!(pte.load(), 0);
            }
            _ => panic!("expected a leaf"),
        }
    }

    #[test]
    fn walk_stops_at_large_pages() {
        let mem = PhysMemory::new(4);
        let root = PhysicalAddress::new(0x1000);
        let va = VirtualAddress::new(0x4020_0000);
        link(&mem, 0x1000, va.table_index(4), 0x2000);
        let big = Pte::new()
            .with_present(true)
            .with_large_page(true)
            .with_address(PhysicalAddress::new(0x4000_0000))
            .into_bits();
        PteSlot::of(&mem, PhysicalAddress::new(0x2000), va.table_index(3)).swap(big);
        assert!(matches!(walk(&mem, root, va), Walk::Large { level: 3, .. }));
    }

    #[test]
    fn slot_atomics() {
        let mem = PhysMemory::new(1);
        let s = PteSlot::of(&mem, PhysicalAddress::zero(), 3);
        assert_eq!(s.swap(0b11), 0);
        assert_eq!(s.compare_exchange(0b01, 0), Err(0b11));
        assert_eq!(s.clear_bits(0b10), 0b11);
        assert_eq!(s.set_bits(0b100), 0b01);
        assert_eq!(s.load(), 0b101);
    }
}
