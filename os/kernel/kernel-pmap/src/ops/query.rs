//! Translation lookups, physical page helpers and diagnostics.

use crate::PmapSystem;
use crate::accessor::Ptes;
use crate::pmap::{Pmap, PmapId};
use crate::ptp::PtpCensus;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_info::cpu::CpuId;
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress, level_span};
use kernel_vmem::{Walk, pte};

fn translate(ptes: &Ptes<'_>, va: VirtualAddress) -> Option<PhysicalAddress> {
    match ptes.walk(va) {
        Walk::Leaf { pte: slot, .. } => {
            let entry = slot.load();
            pte::is_valid(entry).then(|| pte::frame_of(entry) + va.offset::<Size4K>())
        }
        Walk::Large { level, entry } => {
            Some(pte::frame_of(entry) + (va.as_u64() & (level_span(level) - 1)))
        }
        Walk::Missing { .. } => None,
    }
}

impl PmapSystem {
    /// The physical address `va` translates to in `pmap`, if mapped.
    ///
    /// Lock-free for the kernel pmap and the pmap loaded on `cpu`; the
    /// caller serializes against concurrent removal.
    #[must_use]
    pub fn extract(&self, cpu: CpuId, pmap: &Arc<Pmap>, va: VirtualAddress) -> Option<PhysicalAddress> {
        let ci = self.cpu(cpu);
        let _preempt = ci.preempt.disable();
        if pmap.is_kernel() || Arc::ptr_eq(&ci.loaded_pmap(), pmap) {
            return translate(&Ptes::unlocked(self.mem(), pmap), va);
        }
        self.with_ptes(cpu, pmap, |ptes| translate(ptes, va))
    }

    /// Fills the frame at `pa` with zeros.
    ///
    /// # Panics
    /// If `pa` is not RAM.
    pub fn zero_page(&self, pa: PhysicalAddress) {
        self.mem().zero_frame(pa);
    }

    /// Copies the frame at `src` to `dst`.
    ///
    /// # Panics
    /// If either is not RAM.
    pub fn copy_page(&self, src: PhysicalAddress, dst: PhysicalAddress) {
        self.mem().copy_frame(src, dst);
    }

    /// Number of mappings recorded for `pa`; zero for unmanaged frames.
    #[must_use]
    pub fn pv_count(&self, cpu: CpuId, pa: PhysicalAddress) -> usize {
        self.pv
            .page(pa)
            .map_or(0, |page| self.lock_relaxed(cpu, &page.head).count())
    }

    /// The `(pmap, va)` pairs recorded as mapping `pa`.
    #[must_use]
    pub fn pv_mappings(&self, cpu: CpuId, pa: PhysicalAddress) -> Vec<(PmapId, VirtualAddress)> {
        let Some(page) = self.pv.page(pa) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let head = self.lock_relaxed(cpu, &page.head);
        let _ = self.pv.try_for_each(&head, |pv| {
            out.push((pv.pmap.id(), pv.va));
            Ok::<(), ()>(())
        });
        out
    }

    /// PV nodes currently allocated from the pool.
    #[must_use]
    pub fn pv_nodes_in_use(&self) -> usize {
        self.pv.nodes_in_use()
    }

    /// Wire count of the level-1 PTP covering `va`, if there is one.
    #[must_use]
    pub fn ptp_wire_count(&self, cpu: CpuId, pmap: &Pmap, va: VirtualAddress) -> Option<u32> {
        self.lock_relaxed(cpu, &pmap.tables)
            .get(1, va)
            .map(|ptp| ptp.wire_count)
    }

    /// Every PTP of `pmap` with its recorded and actual occupancy.
    #[must_use]
    pub fn ptp_census(&self, cpu: CpuId, pmap: &Pmap) -> Vec<PtpCensus> {
        self.lock_relaxed(cpu, &pmap.tables).census(self.mem())
    }
}
