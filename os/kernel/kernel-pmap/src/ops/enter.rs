//! `enter`: install or replace one mapping.

use super::remove::maps;
use crate::PmapSystem;
use crate::accessor::Ptes;
use crate::error::{AllocFailure, PmapError};
use crate::flags::{EnterFlags, Prot, pte_bits};
use crate::pmap::Pmap;
use crate::pv::{PmapPage, PvPair, PvSpares, PvTable};
use crate::shootdown::Range;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_alloc::PoolIdx;
use kernel_info::cpu::CpuId;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_vmem::{mask, pte};
use log::warn;

impl PmapSystem {
    /// Maps `va` to `pa` in `pmap` with protection `prot`.
    ///
    /// Any previous mapping at `va` is replaced. With
    /// [`EnterFlags::canfail`], running out of page-table pages or PV
    /// nodes is returned as [`PmapError::NoMemory`]; otherwise it panics.
    ///
    /// # Errors
    /// [`PmapError::NoMemory`] as described above.
    ///
    /// # Panics
    /// On misaligned addresses, a VA outside the pmap's half, a kernel VA
    /// without a PTP, or inconsistent PV state.
    pub fn enter(
        &self,
        cpu: CpuId,
        pmap: &Arc<Pmap>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Prot,
        flags: EnterFlags,
    ) -> Result<(), PmapError> {
        super::check_range("enter", pmap, va, va.wrapping_add(PAGE_SIZE));
        assert!(pa.is_aligned::<Size4K>(), "enter: unaligned {pa}");

        let npte = self.protection_code(pmap, va, pa, prot, flags);
        let mut spares = PvSpares::default();
        let outcome = self.with_ptes(cpu, pmap, |ptes| {
            self.enter_locked(cpu, pmap, ptes, va, pa, npte, &mut spares)
        });
        self.pv.release(spares, outcome.as_ref().ok().copied().flatten());
        match outcome {
            Ok(_) => Ok(()),
            Err(failure) => self.enter_failed(cpu, flags, failure),
        }
    }

    fn enter_failed(
        &self,
        cpu: CpuId,
        flags: EnterFlags,
        failure: AllocFailure,
    ) -> Result<(), PmapError> {
        self.shootwait(cpu);
        assert!(flags.canfail(), "enter: out of memory for {failure}");
        warn!("enter: no {failure} available");
        Err(PmapError::NoMemory(failure))
    }

    /// The leaf entry for mapping `pa` at `va` in `pmap`.
    pub(crate) fn protection_code(
        &self,
        pmap: &Pmap,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Prot,
        flags: EnterFlags,
    ) -> u64 {
        let mut npte = pa.as_u64() | mask::PRESENT | pte_bits(prot);
        if kernel_info::memory::is_user_address(va.as_u64()) {
            npte |= mask::USER;
        }
        if pmap.is_kernel() && self.config().global_pages {
            npte |= mask::GLOBAL;
        }
        if flags.wired() {
            npte |= mask::WIRED;
        }
        if flags.nocache() {
            npte |= mask::CACHE_DISABLE | mask::WRITE_THROUGH;
        }
        let access = flags.access();
        if !access.is_none() {
            npte |= mask::ACCESSED;
        }
        if access.write() {
            npte |= mask::DIRTY;
        }
        npte
    }

    /// Installs `npte` at `va`; returns the PV node freed by replacing an
    /// old managed mapping, for release after the locks are gone.
    #[allow(clippy::too_many_arguments)]
    fn enter_locked(
        &self,
        cpu: CpuId,
        pmap: &Arc<Pmap>,
        ptes: &mut Ptes<'_>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        npte: u64,
        spares: &mut PvSpares,
    ) -> Result<Option<PoolIdx>, AllocFailure> {
        let ptp = if pmap.is_kernel() {
            None
        } else {
            Some(self.get_ptp(ptes, va)?)
        };
        let Some((_, slot)) = ptes.leaf(va) else {
            panic!("enter: no page table for kernel VA {va}");
        };
        let new_page = self.pv.page(pa);

        // The reverse mapping goes in first so that nobody holding the
        // pmap lock sees a PV-tracked entry without its PV entry.
        if let Some(page) = new_page
            && !maps(slot.load(), pa)
        {
            let pair = PvPair {
                pmap: Arc::clone(pmap),
                ptp,
                va,
            };
            if let Err(failure) = self.record_mapping(cpu, page, pair, spares) {
                if ptp.is_some() && ptes.tables().expect_mut(1, va, "enter").wire_count <= 1 {
                    let mut freed = Vec::new();
                    self.free_ptp(cpu, ptes, va, &mut freed);
                    self.shootwait(cpu);
                    self.release_ptps(ptes, freed);
                }
                return Err(failure);
            }
        }

        let mut opte = slot.load();
        let npte = loop {
            let candidate = if pte::is_valid(opte) && pte::frame_of(opte) == pa {
                npte | (opte & mask::PVLIST)
            } else if new_page.is_some() {
                npte | mask::PVLIST
            } else {
                npte
            };
            match slot.compare_exchange(opte, candidate) {
                Ok(_) => break candidate,
                Err(seen) => opte = seen,
            }
        };

        pmap.update_stats(opte, npte);
        if let Some(ptp_pa) = ptp
            && !pte::is_valid(opte)
        {
            let record = ptes.tables().expect_mut(1, va, "enter");
            debug_assert_eq!(record.pa, ptp_pa);
            record.wire_count += 1;
        }

        let same_frame = pte::is_valid(opte) && pte::frame_of(opte) == pa;
        let mut freed_node = None;
        if pte::is_valid(opte) && opte & mask::PVLIST != 0 {
            let old_pa = pte::frame_of(opte);
            let Some(old_page) = self.pv.page(old_pa) else {
                panic!("enter: PV-tracked entry at {va} maps unmanaged {old_pa}");
            };
            old_page.fold_attrs(opte);
            if !same_frame {
                let mut head = self.lock_relaxed(cpu, &old_page.head);
                let Some(removed) = self.pv.remove(&mut head, ptp, va) else {
                    panic!("enter: no PV entry for {va} -> {old_pa}");
                };
                drop(head);
                freed_node = removed.node;
                drop(removed.pair);
            }
        }

        // The new entry may lack the accessed bit the cached one had.
        if pte::is_valid(opte) && opte & mask::ACCESSED != 0 {
            self.shootdown(cpu, pmap, Range::page(va), opte);
        }
        self.shootwait(cpu);
        Ok(freed_node)
    }

    /// Adds `pair` to the mappings of `page`. Pool nodes are taken with the
    /// page lock dropped, and only once the page turns out to need them.
    fn record_mapping(
        &self,
        cpu: CpuId,
        page: &PmapPage,
        mut pair: PvPair,
        spares: &mut PvSpares,
    ) -> Result<(), AllocFailure> {
        loop {
            let mut head = self.lock_relaxed(cpu, &page.head);
            match self.pv.enter(&mut head, pair, spares) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    let want = PvTable::nodes_needed(&head);
                    drop(head);
                    pair = back;
                    if !self.pv.reserve(spares, want) {
                        return Err(AllocFailure::PvEntry);
                    }
                }
            }
        }
    }
}
