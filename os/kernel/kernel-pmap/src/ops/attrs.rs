//! Referenced/modified tracking and per-page protection.
//!
//! The hardware sets `ACCESSED` and `DIRTY` in the leaf entries. Each
//! managed page accumulates those bits from mappings that went away or
//! were inspected; a query folds in the live entries of every mapping, and
//! a clear strips them from every mapping. Both walk the page's PV list
//! under the page lock and touch other pmaps' entries without their locks.
//! That is safe because a mapping cannot lose its PTP while its PV entry
//! exists, and PV entries are only removed under the page lock.

use super::remove::maps;
use crate::PmapSystem;
use crate::accessor::Ptes;
use crate::flags::{PageAttrs, Prot};
use crate::pv::PvPair;
use crate::shootdown::Range;
use crossbeam_utils::Backoff;
use kernel_info::cpu::CpuId;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::{mask, pte};

/// An entry no longer mapped the page although its PV entry existed.
struct Raced;

impl PmapSystem {
    /// Returns whether any mapping of `pa` has one of `attrs` set.
    ///
    /// # Panics
    /// If `pa` is not a managed page.
    pub fn test_attrs(&self, cpu: CpuId, pa: PhysicalAddress, attrs: PageAttrs) -> bool {
        let page = self.managed("test_attrs", pa);
        let want = attrs.pte_mask();
        if page.attrs() & want != 0 {
            return true;
        }
        let backoff = Backoff::new();
        loop {
            let head = self.lock_relaxed(cpu, &page.head);
            let mut seen = 0;
            let scan = self.pv.try_for_each(&head, |pv| {
                let opte = self.live_entry(pv, pa)?;
                page.fold_attrs(opte);
                seen |= opte & want;
                if seen == 0 { Ok(()) } else { Err(None) }
            });
            drop(head);
            match scan {
                Err(Some(Raced)) => {
                    self.service_interrupts(cpu);
                    backoff.spin();
                }
                Ok(()) | Err(None) => return seen != 0 || page.attrs() & want != 0,
            }
        }
    }

    /// Clears `attrs` from `pa` and all its mappings. Returns whether any
    /// of them was set.
    ///
    /// # Panics
    /// If `pa` is not a managed page.
    pub fn clear_attrs(&self, cpu: CpuId, pa: PhysicalAddress, attrs: PageAttrs) -> bool {
        let page = self.managed("clear_attrs", pa);
        let clear = attrs.pte_mask();
        let mut result = page.clear_attrs(clear) & clear;
        let backoff = Backoff::new();
        loop {
            let head = self.lock_relaxed(cpu, &page.head);
            let scan = self.pv.try_for_each(&head, |pv| {
                let opte = self.sync_pv(cpu, pv, pa, clear)?;
                page.fold_attrs(opte & !clear);
                result |= opte & clear;
                Ok(())
            });
            drop(head);
            match scan {
                Ok(()) => break,
                Err(Raced) => {
                    self.service_interrupts(cpu);
                    backoff.spin();
                }
            }
        }
        self.shootwait(cpu);
        result != 0
    }

    /// Clears `clear` from the entry of one mapping of `pa`, shooting the
    /// entry down if some CPU may have cached it. Returns the old entry.
    fn sync_pv(&self, cpu: CpuId, pv: &PvPair, pa: PhysicalAddress, clear: u64) -> Result<u64, Raced> {
        let ptes = Ptes::unlocked(self.mem(), &pv.pmap);
        let Some((_, slot)) = ptes.leaf(pv.va) else {
            return Err(Raced);
        };
        loop {
            let opte = slot.load();
            if !maps(opte, pa) {
                return Err(Raced);
            }
            let npte = opte & !clear;
            if npte == opte {
                return Ok(opte);
            }
            if slot.compare_exchange(opte, npte).is_err() {
                continue;
            }
            // A cached writable translation without DIRTY re-walks before
            // the first write, so removing write access alone needs no
            // shootdown unless the entry is already dirty.
            let cached = opte & mask::ACCESSED != 0;
            let stale = opte & clear & (mask::ACCESSED | mask::DIRTY) != 0
                || (opte & clear & mask::WRITABLE != 0 && opte & mask::DIRTY != 0);
            if cached && stale {
                self.shootdown(cpu, &pv.pmap, Range::page(pv.va), opte);
            }
            return Ok(opte);
        }
    }

    /// The live entry of one mapping of `pa`.
    fn live_entry(&self, pv: &PvPair, pa: PhysicalAddress) -> Result<u64, Option<Raced>> {
        let ptes = Ptes::unlocked(self.mem(), &pv.pmap);
        let (_, slot) = ptes.leaf(pv.va).ok_or(Some(Raced))?;
        let opte = slot.load();
        if maps(opte, pa) { Ok(opte) } else { Err(Some(Raced)) }
    }

    fn managed(&self, op: &str, pa: PhysicalAddress) -> &crate::pv::PmapPage {
        self.pv
            .page(pa)
            .unwrap_or_else(|| panic!("{op}: unmanaged page {pa}"))
    }

    /// Restricts every mapping of `pa` to `prot`.
    pub fn page_protect(&self, cpu: CpuId, pa: PhysicalAddress, prot: Prot) {
        if prot.write() {
            return;
        }
        if prot.read() || prot.execute() {
            self.clear_attrs(cpu, pa, PageAttrs::WRITABLE);
        } else {
            self.page_remove(cpu, pa);
        }
    }

    #[must_use]
    pub fn is_referenced(&self, cpu: CpuId, pa: PhysicalAddress) -> bool {
        self.test_attrs(cpu, pa, PageAttrs::REFERENCED)
    }

    #[must_use]
    pub fn is_modified(&self, cpu: CpuId, pa: PhysicalAddress) -> bool {
        self.test_attrs(cpu, pa, PageAttrs::MODIFIED)
    }

    pub fn clear_reference(&self, cpu: CpuId, pa: PhysicalAddress) -> bool {
        self.clear_attrs(cpu, pa, PageAttrs::REFERENCED)
    }

    pub fn clear_modify(&self, cpu: CpuId, pa: PhysicalAddress) -> bool {
        self.clear_attrs(cpu, pa, PageAttrs::MODIFIED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_requires_valid_and_matching_frame() {
        let pa = PhysicalAddress::new(0x5000);
        assert!(maps(0x5000 | mask::PRESENT, pa));
        assert!(!maps(0x5000, pa));
        assert!(!maps(0x6000 | mask::PRESENT, pa));
        assert!(!pte::is_valid(0));
    }
}
