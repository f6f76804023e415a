//! # Page-Table Accessor
//!
//! [`PmapSystem::with_ptes`] gives a closure access to the page tables of
//! any pmap, with preemption disabled and the right locks held:
//!
//! | Target pmap                    | Locks                               | Window    |
//! |--------------------------------|-------------------------------------|-----------|
//! | kernel                         | none; kernel PTPs are never freed   | direct    |
//! | loaded on this CPU             | the pmap                            | direct    |
//! | anything else                  | both pmaps, lower [`PmapId`] first  | alternate |
//!
//! Page tables are addressed by frame, so the alternate window is only the
//! per-CPU record of which foreign directory is borrowed; the ordered
//! locking is what keeps two CPUs that borrow each other's tables from
//! deadlocking.
//!
//! [`PmapId`]: crate::PmapId

use crate::PmapSystem;
use crate::pmap::Pmap;
use crate::ptp::PtpTable;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use kernel_info::cpu::CpuId;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use crossbeam_utils::Backoff;
use kernel_sync::lock_pair_with;
use kernel_vmem::{PhysMemory, PteSlot, Walk, walk};

/// Page tables of one pmap, borrowed for the duration of a closure.
pub(crate) struct Ptes<'a> {
    mem: &'a PhysMemory,
    pmap: &'a Pmap,
    tables: Option<&'a mut PtpTable>,
}

impl<'a> Ptes<'a> {
    /// Unlocked access for readers that tolerate concurrent change.
    pub(crate) const fn unlocked(mem: &'a PhysMemory, pmap: &'a Pmap) -> Self {
        Self {
            mem,
            pmap,
            tables: None,
        }
    }

    pub const fn pmap(&self) -> &'a Pmap {
        self.pmap
    }

    pub fn walk(&self, va: VirtualAddress) -> Walk<'a> {
        walk(self.mem, self.pmap.pdir(), va)
    }

    /// The level-1 PTP and leaf entry for `va`, if every directory is
    /// present.
    pub fn leaf(&self, va: VirtualAddress) -> Option<(PhysicalAddress, PteSlot<'a>)> {
        match self.walk(va) {
            Walk::Leaf { ptp, pte } => Some((ptp, pte)),
            Walk::Large { level, .. } => {
                panic!("{:?}: unexpected large page at level {level} for {va}", self.pmap.id())
            }
            Walk::Missing { .. } => None,
        }
    }

    /// PTP bookkeeping of a locked user pmap.
    pub fn tables(&mut self) -> &mut PtpTable {
        match self.tables.as_deref_mut() {
            Some(tables) => tables,
            None => panic!("{:?}: page tables not locked", self.pmap.id()),
        }
    }
}

impl PmapSystem {
    /// Runs `f` with the page tables of `pmap` mapped and locked for `cpu`.
    ///
    /// A pmap load pending on `cpu` for this very pmap is performed first,
    /// so the direct path is taken for it.
    pub(crate) fn with_ptes<R>(
        &self,
        cpu: CpuId,
        pmap: &Arc<Pmap>,
        f: impl FnOnce(&mut Ptes<'_>) -> R,
    ) -> R {
        let ci = self.cpu(cpu);
        let _preempt = ci.preempt.disable();
        let mem = self.mem();

        if pmap.is_kernel() {
            return f(&mut Ptes::unlocked(mem, pmap));
        }

        if ci.wants_pmapload()
            && ci
                .current_thread()
                .is_some_and(|t| Arc::ptr_eq(t.pmap(), pmap))
        {
            self.load(cpu);
        }

        let ours = ci.loaded_pmap();
        if Arc::ptr_eq(pmap, &ours) {
            let mut tables = self.lock_relaxed(cpu, &pmap.tables);
            return f(&mut Ptes {
                mem,
                pmap,
                tables: Some(&mut *tables),
            });
        }

        let backoff = Backoff::new();
        let (mut tables, _ours_locked) = lock_pair_with(
            (&pmap.tables, pmap.id().as_u64()),
            (&ours.tables, ours.id().as_u64()),
            || {
                self.service_interrupts(cpu);
                backoff.spin();
            },
        );
        let prev = ci.alt_root.swap(pmap.pdir().as_u64(), Ordering::SeqCst);
        assert_eq!(prev, 0, "{cpu}: alternate window already borrowed");
        let result = f(&mut Ptes {
            mem,
            pmap,
            tables: Some(&mut *tables),
        });
        ci.alt_root.store(0, Ordering::SeqCst);
        result
    }
}
