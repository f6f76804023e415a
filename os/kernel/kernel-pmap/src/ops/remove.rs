//! Removal of mappings by range and by physical page.

use crate::PmapSystem;
use crate::accessor::Ptes;
use crate::pmap::Pmap;
use crate::pv::PvSpares;
use crate::shootdown::Range;
use alloc::sync::Arc;
use alloc::vec::Vec;
use crossbeam_utils::Backoff;
use kernel_alloc::PoolIdx;
use kernel_info::cpu::CpuId;
use kernel_info::memory::{PAGE_SIZE, USERSPACE_END};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, level_span};
use kernel_vmem::{Walk, mask, pte};

/// Outcome of removing one mapping of a page under the pmap lock.
enum PageRemoval {
    Removed,
    /// The PV entry went away before we got the pmap lock.
    Gone,
    /// The entry changed underneath us: its A/D bits were set, or a
    /// kernel mapping is still being entered.
    Raced,
}

impl PmapSystem {
    /// Removes every mapping in `[sva, eva)`.
    ///
    /// # Panics
    /// On an unaligned or foreign range, or inconsistent PV state.
    pub fn remove(&self, cpu: CpuId, pmap: &Arc<Pmap>, sva: VirtualAddress, eva: VirtualAddress) {
        super::check_range("remove", pmap, sva, eva);
        self.do_remove(cpu, pmap, sva, eva, false);
    }

    /// Removes all unwired user mappings of `pmap`.
    pub fn collect(&self, cpu: CpuId, pmap: &Arc<Pmap>) {
        if pmap.is_kernel() {
            return;
        }
        self.do_remove(
            cpu,
            pmap,
            VirtualAddress::zero(),
            VirtualAddress::new(USERSPACE_END),
            true,
        );
    }

    fn do_remove(
        &self,
        cpu: CpuId,
        pmap: &Arc<Pmap>,
        sva: VirtualAddress,
        eva: VirtualAddress,
        skip_wired: bool,
    ) {
        let mut nodes: Vec<PoolIdx> = Vec::new();
        self.with_ptes(cpu, pmap, |ptes| {
            let mut freed = Vec::new();
            let mut xpte = 0;
            let mut va = sva;
            while va.as_u64() < eva.as_u64() {
                let next = match ptes.walk(va) {
                    Walk::Missing { level } => next_boundary(va, level_span(level)),
                    Walk::Large { level, .. } => {
                        panic!("remove: large page at level {level} covering {va}")
                    }
                    Walk::Leaf { ptp, .. } => {
                        let block_end = next_boundary(va, level_span(2));
                        let end = block_end.map_or(eva, |b| min_va(b, eva));
                        let ptp = (!pmap.is_kernel()).then_some(ptp);
                        xpte |= self.remove_ptes(cpu, ptes, ptp, va, end, skip_wired, &mut nodes);
                        if ptp.is_some() && ptes.tables().expect_mut(1, va, "remove").wire_count <= 1 {
                            self.free_ptp(cpu, ptes, va, &mut freed);
                        }
                        block_end
                    }
                };
                match next {
                    Some(n) => va = n,
                    None => break,
                }
            }
            if xpte & mask::ACCESSED != 0 {
                self.shootdown(cpu, pmap, Range::span(sva, eva), xpte);
            }
            self.shootwait(cpu);
            self.release_ptps(ptes, freed);
        });
        self.pv.release(PvSpares::default(), nodes);
    }

    /// Clears the valid entries in `[start, end)` of one level-1 PTP and
    /// returns the OR of the old entries.
    #[allow(clippy::too_many_arguments)]
    fn remove_ptes(
        &self,
        cpu: CpuId,
        ptes: &mut Ptes<'_>,
        ptp: Option<PhysicalAddress>,
        start: VirtualAddress,
        end: VirtualAddress,
        skip_wired: bool,
        nodes: &mut Vec<PoolIdx>,
    ) -> u64 {
        let pmap = ptes.pmap();
        let mut xpte = 0;
        let mut va = start;
        while va.as_u64() < end.as_u64() {
            let Some((_, slot)) = ptes.leaf(va) else {
                panic!("remove: page table for {va} vanished");
            };
            let current = slot.load();
            if pte::is_valid(current) && !(skip_wired && current & mask::WIRED != 0) {
                let opte = slot.swap(0);
                if pte::is_valid(opte) {
                    pmap.update_stats(opte, 0);
                    if ptp.is_some() {
                        ptes.tables().expect_mut(1, va, "remove").wire_count -= 1;
                    }
                    xpte |= opte;
                    if let Some(node) = self.forget_mapping(cpu, pmap, ptp, va, opte) {
                        nodes.push(node);
                    }
                }
            }
            va = va.wrapping_add(PAGE_SIZE);
        }
        xpte
    }

    /// Drops the PV entry of a just-cleared entry `opte`, folding its
    /// attributes into the page.
    fn forget_mapping(
        &self,
        cpu: CpuId,
        pmap: &Pmap,
        ptp: Option<PhysicalAddress>,
        va: VirtualAddress,
        opte: u64,
    ) -> Option<PoolIdx> {
        let pa = pte::frame_of(opte);
        if opte & mask::PVLIST == 0 {
            #[cfg(feature = "diagnostic")]
            assert!(
                pmap.is_kernel() || self.pv.page(pa).is_none(),
                "remove: managed {pa} at {va} without PV tracking"
            );
            return None;
        }
        let Some(page) = self.pv.page(pa) else {
            panic!("remove: PV-tracked entry at {va} maps unmanaged {pa}");
        };
        page.fold_attrs(opte);
        let mut head = self.lock_relaxed(cpu, &page.head);
        let Some(removed) = self.pv.remove(&mut head, ptp, va) else {
            panic!("remove: {:?} has no PV entry for {va} -> {pa}", pmap.id());
        };
        drop(head);
        removed.node
    }

    /// Removes every mapping of the managed page `pa`.
    ///
    /// # Panics
    /// If `pa` is not a managed page.
    pub fn page_remove(&self, cpu: CpuId, pa: PhysicalAddress) {
        let Some(page) = self.pv.page(pa) else {
            panic!("page_remove: unmanaged page {pa}");
        };
        let backoff = Backoff::new();
        loop {
            let first = {
                let head = self.lock_relaxed(cpu, &page.head);
                let first = self.pv.first(&head);
                if let Some(pair) = &first {
                    // Keeps the pmap alive once the page lock is dropped.
                    self.reference(&pair.pmap);
                }
                first
            };
            let Some(pair) = first else {
                break;
            };

            let mut node = None;
            let outcome = self.with_ptes(cpu, &pair.pmap, |ptes| {
                let mut head = self.lock_relaxed(cpu, &page.head);
                if !self.pv.contains(&head, pair.ptp, pair.va) {
                    return PageRemoval::Gone;
                }
                let pmap = ptes.pmap();
                let slot = match ptes.leaf(pair.va) {
                    Some((_, slot)) if maps(slot.load(), pa) => slot,
                    // Only kernel mappings change without the pmap lock.
                    _ => {
                        assert!(
                            pmap.is_kernel(),
                            "page_remove: {:?} has a PV entry for {} -> {pa} but no such mapping",
                            pmap.id(),
                            pair.va
                        );
                        return PageRemoval::Raced;
                    }
                };
                let opte = slot.load();
                if !maps(opte, pa) || slot.compare_exchange(opte, 0).is_err() {
                    return PageRemoval::Raced;
                }
                pmap.update_stats(opte, 0);
                page.fold_attrs(opte);
                let Some(removed) = self.pv.remove(&mut head, pair.ptp, pair.va) else {
                    unreachable!("PV entry checked under the page lock");
                };
                drop(head);
                node = removed.node;

                let mut freed = Vec::new();
                if pair.ptp.is_some() {
                    let ptp = ptes.tables().expect_mut(1, pair.va, "page_remove");
                    ptp.wire_count -= 1;
                    if ptp.wire_count <= 1 {
                        self.free_ptp(cpu, ptes, pair.va, &mut freed);
                    }
                }
                if opte & mask::ACCESSED != 0 {
                    self.shootdown(cpu, pmap, Range::page(pair.va), opte);
                }
                self.shootwait(cpu);
                self.release_ptps(ptes, freed);
                PageRemoval::Removed
            });
            self.pv.release(PvSpares::default(), node);
            self.destroy(cpu, &pair.pmap);

            match outcome {
                PageRemoval::Removed | PageRemoval::Gone => backoff.reset(),
                PageRemoval::Raced => {
                    self.service_interrupts(cpu);
                    backoff.spin();
                }
            }
        }
    }
}

/// Does `pte` map `pa`?
pub(crate) fn maps(entry: u64, pa: PhysicalAddress) -> bool {
    pte::is_valid(entry) && pte::frame_of(entry) == pa
}

/// Start of the next `span`-aligned block after `va`, if there is one.
fn next_boundary(va: VirtualAddress, span: u64) -> Option<VirtualAddress> {
    va.trunc_to(span).checked_add(span)
}

fn min_va(a: VirtualAddress, b: VirtualAddress) -> VirtualAddress {
    if a.as_u64() <= b.as_u64() { a } else { b }
}

#[cfg(test)]
mod tests {
    use crate::{EnterFlags, MachineConfig, PmapSystem, Prot};
    use kernel_info::cpu::CpuId;
    use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

    #[test]
    #[should_panic(expected = "has a PV entry")]
    fn pv_entry_without_its_mapping_is_fatal() {
        let sys = PmapSystem::bootstrap(MachineConfig::new(1));
        let p = sys.create();
        let va = VirtualAddress::new(0x1000);
        let pa = PhysicalAddress::new(0x5000);
        sys.enter(CpuId::BSP, &p, va, pa, Prot::READ_WRITE, EnterFlags::new())
            .unwrap();

        // Clear the entry behind the pmap's back.
        sys.with_ptes(CpuId::BSP, &p, |ptes| {
            let (_, slot) = ptes.leaf(va).unwrap();
            slot.swap(0);
        });
        sys.page_remove(CpuId::BSP, pa);
    }
}
