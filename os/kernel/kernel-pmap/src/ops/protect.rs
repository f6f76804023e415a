//! Reducing the permissions of a range, and unwiring.

use crate::PmapSystem;
use crate::flags::Prot;
use crate::pmap::Pmap;
use crate::shootdown::Range;
use alloc::sync::Arc;
use kernel_info::cpu::CpuId;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{VirtualAddress, level_span};
use kernel_vmem::{Walk, mask, pte};
use log::warn;

impl PmapSystem {
    /// Restricts the mappings in `[sva, eva)` to at most `prot`.
    ///
    /// Without read or execute the mappings are removed; without write they
    /// are write-protected. Otherwise nothing changes.
    pub fn protect(
        &self,
        cpu: CpuId,
        pmap: &Arc<Pmap>,
        sva: VirtualAddress,
        eva: VirtualAddress,
        prot: Prot,
    ) {
        if !prot.read() && !prot.execute() {
            self.remove(cpu, pmap, sva, eva);
        } else if !prot.write() {
            self.write_protect(cpu, pmap, sva, eva, prot);
        }
    }

    /// Clears write permission (and execute, if `prot` lacks it) from the
    /// valid entries in `[sva, eva)`.
    pub fn write_protect(
        &self,
        cpu: CpuId,
        pmap: &Arc<Pmap>,
        sva: VirtualAddress,
        eva: VirtualAddress,
        prot: Prot,
    ) {
        super::check_range("write_protect", pmap, sva, eva);
        let mut clear = 0;
        if !prot.write() {
            clear |= mask::WRITABLE;
        }
        let set = if prot.execute() { 0 } else { mask::NO_EXECUTE };
        if clear == 0 && set == 0 {
            return;
        }

        self.with_ptes(cpu, pmap, |ptes| {
            let mut xpte = 0;
            let mut va = sva;
            while va.as_u64() < eva.as_u64() {
                let step = match ptes.walk(va) {
                    Walk::Missing { level } => level_span(level) - (va.as_u64() & (level_span(level) - 1)),
                    Walk::Large { level, .. } => {
                        panic!("write_protect: large page at level {level} covering {va}")
                    }
                    Walk::Leaf { pte: slot, .. } => {
                        let mut opte = slot.load();
                        while pte::is_valid(opte) {
                            let npte = (opte & !clear) | set;
                            if npte == opte {
                                break;
                            }
                            match slot.compare_exchange(opte, npte) {
                                Ok(_) => {
                                    xpte |= opte;
                                    break;
                                }
                                Err(seen) => opte = seen,
                            }
                        }
                        PAGE_SIZE
                    }
                };
                match va.checked_add(step) {
                    Some(next) => va = next,
                    None => break,
                }
            }
            if xpte & mask::ACCESSED != 0 {
                self.shootdown(cpu, pmap, Range::span(sva, eva), xpte);
            }
            self.shootwait(cpu);
        });
    }

    /// Clears the wired bit of the mapping at `va`.
    ///
    /// # Panics
    /// If there is no valid mapping at `va`.
    pub fn unwire(&self, cpu: CpuId, pmap: &Arc<Pmap>, va: VirtualAddress) {
        self.with_ptes(cpu, pmap, |ptes| {
            let slot = match ptes.leaf(va) {
                Some((_, slot)) if pte::is_valid(slot.load()) => slot,
                _ => panic!("unwire: no mapping at {va} in {:?}", pmap.id()),
            };
            let opte = slot.clear_bits(mask::WIRED);
            if opte & mask::WIRED == 0 {
                warn!("unwire: {va} in {:?} was not wired", pmap.id());
            } else {
                pmap.add_wired(-1);
            }
        });
    }
}
