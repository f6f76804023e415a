//! # Page-Table Pages
//!
//! Every PTP of a user pmap is recorded in its [`PtpTable`], keyed by level
//! and by the base of the VA range it covers. The record carries the wire
//! count:
//!
//! ```text
//! wire_count = 1 + number of valid entries in the page
//! ```
//!
//! so a PTP whose count drops back to 1 is empty and can be freed. The top
//! level directory is never freed here and has no record. Kernel PTPs are
//! never freed at all and are not recorded.

use crate::accessor::Ptes;
use crate::error::AllocFailure;
use crate::shootdown::Range;
use crate::PmapSystem;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_alloc::FrameAlloc;
use kernel_info::cpu::CpuId;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, level_span};
use kernel_vmem::{PhysMemory, Pte, PteSlot, TOP_LEVEL, directory_slot, pte};
use log::debug;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Ptp {
    pub pa: PhysicalAddress,
    pub wire_count: u32,
}

/// A PTP as seen by [`PmapSystem::ptp_census`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PtpCensus {
    pub level: u8,
    /// First VA the PTP covers.
    pub base: VirtualAddress,
    pub pa: PhysicalAddress,
    pub wire_count: u32,
    /// Valid entries actually present in the page.
    pub valid_entries: u32,
}

#[derive(Default)]
pub(crate) struct PtpTable {
    /// Indexed by `level - 1` for levels 1..=3.
    levels: [BTreeMap<u64, Ptp>; 3],
    /// Emptied PTPs of a doomed pmap, freed on the next update.
    pub(crate) deferred: Vec<PhysicalAddress>,
}

impl PtpTable {
    const fn key(level: u8, va: VirtualAddress) -> u64 {
        va.trunc_to(level_span(level + 1)).as_u64()
    }

    fn level(&self, level: u8) -> &BTreeMap<u64, Ptp> {
        debug_assert!((1..TOP_LEVEL).contains(&level));
        &self.levels[usize::from(level - 1)]
    }

    fn level_mut(&mut self, level: u8) -> &mut BTreeMap<u64, Ptp> {
        debug_assert!((1..TOP_LEVEL).contains(&level));
        &mut self.levels[usize::from(level - 1)]
    }

    pub fn get(&self, level: u8, va: VirtualAddress) -> Option<&Ptp> {
        self.level(level).get(&Self::key(level, va))
    }

    /// The PTP at `level` covering `va`, which the caller knows exists.
    pub fn expect_mut(&mut self, level: u8, va: VirtualAddress, op: &str) -> &mut Ptp {
        self.level_mut(level)
            .get_mut(&Self::key(level, va))
            .unwrap_or_else(|| panic!("{op}: no level {level} PTP for {va}"))
    }

    pub fn insert(&mut self, level: u8, va: VirtualAddress, pa: PhysicalAddress) {
        let prev = self
            .level_mut(level)
            .insert(Self::key(level, va), Ptp { pa, wire_count: 1 });
        assert!(prev.is_none(), "level {level} PTP for {va} entered twice");
    }

    pub fn remove(&mut self, level: u8, va: VirtualAddress) -> Option<Ptp> {
        self.level_mut(level).remove(&Self::key(level, va))
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(BTreeMap::is_empty)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn census(&self, mem: &PhysMemory) -> Vec<PtpCensus> {
        let mut out = Vec::new();
        for level in 1..TOP_LEVEL {
            for (&base, ptp) in self.level(level) {
                let frame = mem.frame_at(ptp.pa);
                let valid = (0..kernel_memory_addresses::ENTRIES_PER_TABLE)
                    .filter(|&i| pte::is_valid(PteSlot::new(frame.word(i)).load()))
                    .count();
                out.push(PtpCensus {
                    level,
                    base: VirtualAddress::new(base),
                    pa: ptp.pa,
                    wire_count: ptp.wire_count,
                    valid_entries: valid as u32,
                });
            }
        }
        out
    }
}

impl PmapSystem {
    /// Returns the level-1 PTP for `va`, allocating every missing level on
    /// the way down.
    ///
    /// On allocation failure the levels allocated by this call are released
    /// again, leaving the hierarchy as it was.
    pub(crate) fn get_ptp(
        &self,
        ptes: &mut Ptes<'_>,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, AllocFailure> {
        let mem = self.mem();
        let pmap = ptes.pmap();
        let tables = ptes.tables();
        let mut table = pmap.pdir();
        let mut highest_new: Option<u8> = None;

        for level in (2..=TOP_LEVEL).rev() {
            let child = level - 1;
            let slot = PteSlot::of(mem, table, va.table_index(level));
            let entry = slot.load();
            if pte::is_valid(entry) {
                assert!(
                    entry & kernel_vmem::mask::LARGE_PAGE == 0,
                    "get_ptp: large page at level {level} covers {va}"
                );
                #[cfg(feature = "diagnostic")]
                {
                    let known = tables.get(child, va).map(|p| p.pa);
                    assert_eq!(
                        known,
                        Some(pte::frame_of(entry)),
                        "get_ptp: level {child} PTP for {va} not recorded"
                    );
                }
                table = pte::frame_of(entry);
                continue;
            }

            let Ok(pa) = self.machine().table_alloc().alloc_4k() else {
                if let Some(highest) = highest_new {
                    self.unget_ptps(pmap, tables, va, child + 1, highest);
                }
                return Err(AllocFailure::PageTablePage);
            };
            mem.zero_frame(pa);
            tables.insert(child, va, pa);
            if level < TOP_LEVEL {
                tables.expect_mut(level, va, "get_ptp").wire_count += 1;
            }
            self.mmu()
                .store_entry(slot, Pte::directory(pa, true).into_bits());
            pmap.add_resident(1);
            highest_new.get_or_insert(child);
            debug!("{:?}: level {child} PTP {pa} for {va}", pmap.id());
            table = pa;
        }
        Ok(table)
    }

    /// Undoes the allocations of a failed [`get_ptp`](Self::get_ptp).
    fn unget_ptps(
        &self,
        pmap: &crate::Pmap,
        tables: &mut PtpTable,
        va: VirtualAddress,
        lowest: u8,
        highest: u8,
    ) {
        let mem = self.mem();
        for level in lowest..=highest {
            let Some(ptp) = tables.remove(level, va) else {
                panic!("get_ptp: lost level {level} PTP for {va}");
            };
            debug_assert_eq!(ptp.wire_count, 1);
            let Some((_, slot)) = directory_slot(mem, pmap.pdir(), va, level + 1) else {
                panic!("get_ptp: no parent for level {level} PTP at {va}");
            };
            self.mmu().store_entry(slot, 0);
            if level + 1 < TOP_LEVEL {
                tables.expect_mut(level + 1, va, "get_ptp").wire_count -= 1;
            }
            pmap.add_resident(-1);
            self.free_table_frame(ptp.pa);
        }
    }

    /// Frees the empty level-1 PTP covering `va` and every ancestor that
    /// becomes empty as a result, up to but excluding the top level.
    ///
    /// Each cleared directory entry is shot down. The frames are appended
    /// to `freed`; they may be reused only after a `shootwait`.
    pub(crate) fn free_ptp(
        &self,
        cpu: CpuId,
        ptes: &mut Ptes<'_>,
        va: VirtualAddress,
        freed: &mut Vec<PhysicalAddress>,
    ) {
        let mem = self.mem();
        let pmap = ptes.pmap();
        let tables = ptes.tables();
        let mut level = 1;
        loop {
            let Some(ptp) = tables.remove(level, va) else {
                panic!("free_ptp: no level {level} PTP for {va}");
            };
            assert!(
                ptp.wire_count <= 1,
                "free_ptp: level {level} PTP {} still has wire count {}",
                ptp.pa,
                ptp.wire_count
            );
            #[cfg(feature = "diagnostic")]
            assert!(
                mem.frame_at(ptp.pa).is_zero(),
                "free_ptp: level {level} PTP {} not empty",
                ptp.pa
            );

            let Some((_, slot)) = directory_slot(mem, pmap.pdir(), va, level + 1) else {
                panic!("free_ptp: no parent for level {level} PTP at {va}");
            };
            let opde = self.mmu().store_entry(slot, 0);
            assert_eq!(pte::frame_of(opde), ptp.pa, "free_ptp: parent entry mismatch");
            pmap.add_resident(-1);

            let span = level_span(level + 1);
            let base = va.trunc_to(span);
            self.shootdown(cpu, pmap, Range::span(base, base.wrapping_add(span)), opde);
            freed.push(ptp.pa);
            debug!("{:?}: freed level {level} PTP {} at {base}", pmap.id(), ptp.pa);

            level += 1;
            if level == TOP_LEVEL {
                break;
            }
            let parent = tables.expect_mut(level, va, "free_ptp");
            parent.wire_count -= 1;
            if parent.wire_count > 1 {
                break;
            }
        }
    }

    /// Hands PTP frames back once no CPU can reach them, or queues them on
    /// a doomed pmap for its next update.
    pub(crate) fn release_ptps(&self, ptes: &mut Ptes<'_>, freed: Vec<PhysicalAddress>) {
        if freed.is_empty() {
            return;
        }
        if ptes.pmap().is_doomed() {
            ptes.tables().deferred.extend(freed);
        } else {
            for pa in freed {
                self.free_table_frame(pa);
            }
        }
    }

    pub(crate) fn free_table_frame(&self, pa: PhysicalAddress) {
        if let Err(e) = self.machine().table_alloc().free_4k(pa) {
            panic!("page-table frame {pa}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_cover_the_parent_span() {
        let mut t = PtpTable::default();
        let va = VirtualAddress::new(0x0040_1000);
        t.insert(1, va, PhysicalAddress::new(0x9000));
        // Anything else in the same 2 MiB resolves to the same level-1 PTP.
        assert!(t.get(1, VirtualAddress::new(0x005F_F000)).is_some());
        assert!(t.get(1, VirtualAddress::new(0x0060_0000)).is_none());
        assert_eq!(t.remove(1, va).map(|p| p.wire_count), Some(1));
        assert!(t.is_empty());
    }

    #[test]
    #[should_panic(expected = "entered twice")]
    fn duplicate_ptp_is_fatal() {
        let mut t = PtpTable::default();
        let va = VirtualAddress::new(0x1000);
        t.insert(2, va, PhysicalAddress::new(0x9000));
        t.insert(2, va, PhysicalAddress::new(0xA000));
    }
}
