//! # Pmap Lifecycle
//!
//! Top-level directories are recycled through a cache. A directory's
//! kernel slots are only current for the kernel epoch it was last brought
//! up to date under, so each cached entry records that epoch:
//!
//! ```text
//! create():   pop cached (pdir, epoch)  or construct (read epoch, copy slots)
//!             lock pmaps ── epoch still current? ── yes: register, done
//!                                              └─ no:  free pdir, retry
//! growkernel: lock pmaps ── copy new slots into every registered pmap,
//!                           bump epoch, drain the cache
//! ```
//!
//! A directory registered on the list is always updated by `growkernel`,
//! and one that is not registered is checked against the epoch before it
//! can be registered, so a recycled directory never misses kernel slots.

use crate::PmapSystem;
use crate::pmap::Pmap;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use kernel_alloc::FrameAlloc;
use kernel_info::cpu::CpuId;
use kernel_info::memory::{KERNEL_L4_SLOTS, PDIR_SLOT_KERN};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PteSlot;
use log::debug;

/// A directory in the cache.
#[derive(Debug, Copy, Clone)]
pub(crate) struct CachedPdp {
    pub pdir: PhysicalAddress,
    pub epoch: u64,
}

impl PmapSystem {
    /// Creates an empty user pmap with one reference.
    ///
    /// # Panics
    /// If no page-table memory is left for its directory.
    #[must_use]
    pub fn create(&self) -> Arc<Pmap> {
        loop {
            let cached = self.pdp_cache.lock().pop();
            let pdp = cached.unwrap_or_else(|| self.construct_pdp());

            let mut pmaps = self.pmaps.lock();
            if pdp.epoch != self.kernel_epoch.load(Ordering::SeqCst) {
                drop(pmaps);
                debug!("create: directory {} is stale, discarding", pdp.pdir);
                self.free_table_frame(pdp.pdir);
                continue;
            }
            let pmap = Arc::new(Pmap::new(self.next_pmap_id(), pdp.pdir, 1));
            pmaps.push(Arc::clone(&pmap));
            drop(pmaps);
            debug!("create: {:?} with directory {}", pmap.id(), pdp.pdir);
            return pmap;
        }
    }

    /// A fresh directory: user half empty, kernel slots copied.
    fn construct_pdp(&self) -> CachedPdp {
        let pdir = self
            .machine()
            .table_alloc()
            .alloc_4k()
            .unwrap_or_else(|e| panic!("create: page directory: {e}"));
        let mem = self.mem();
        mem.zero_frame(pdir);
        let epoch = self.kernel_epoch.load(Ordering::SeqCst);
        self.copy_kernel_slots(pdir, PDIR_SLOT_KERN..PDIR_SLOT_KERN + KERNEL_L4_SLOTS);
        CachedPdp { pdir, epoch }
    }

    /// Copies top-level `slots` of the kernel directory into `pdir`.
    pub(crate) fn copy_kernel_slots(&self, pdir: PhysicalAddress, slots: core::ops::Range<usize>) {
        let mem = self.mem();
        let kernel = self.kernel().pdir();
        for slot in slots {
            let value = PteSlot::of(mem, kernel, slot).load();
            self.mmu().store_entry(PteSlot::of(mem, pdir, slot), value);
        }
    }

    /// Adds a reference to `pmap`.
    pub fn reference(&self, pmap: &Pmap) {
        let prev = pmap.refs.fetch_add(1, Ordering::SeqCst);
        assert!(prev > 0, "reference: {:?} already destroyed", pmap.id());
    }

    /// Drops a reference; the last one tears the pmap down and caches its
    /// directory.
    ///
    /// # Panics
    /// On a reference count underflow, if a CPU still has the pmap loaded,
    /// or (with `diagnostic`) if mappings remain.
    pub fn destroy(&self, cpu: CpuId, pmap: &Arc<Pmap>) {
        let prev = pmap.refs.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "destroy: {:?} reference count underflow", pmap.id());
        if prev > 1 {
            return;
        }
        assert!(!pmap.is_kernel(), "destroy: kernel pmap");
        for ci in self.cpus() {
            assert!(
                !Arc::ptr_eq(&ci.pmap.lock(), pmap),
                "destroy: {:?} still loaded on {}",
                pmap.id(),
                ci.id()
            );
        }

        let epoch = {
            let mut pmaps = self.pmaps.lock();
            pmaps.retain(|p| !Arc::ptr_eq(p, pmap));
            self.kernel_epoch.load(Ordering::SeqCst)
        };

        let deferred = {
            let mut tables = self.lock_relaxed(cpu, &pmap.tables);
            assert!(
                tables.is_empty(),
                "destroy: {:?} still has page-table pages",
                pmap.id()
            );
            core::mem::take(&mut tables.deferred)
        };
        for pa in deferred {
            self.free_table_frame(pa);
        }

        #[cfg(feature = "diagnostic")]
        {
            let mem = self.mem();
            for slot in 0..PDIR_SLOT_KERN {
                assert!(
                    !kernel_vmem::pte::is_valid(PteSlot::of(mem, pmap.pdir(), slot).load()),
                    "destroy: {:?} user slot {slot} still valid",
                    pmap.id()
                );
            }
        }

        debug!("destroy: {:?}, directory {} cached", pmap.id(), pmap.pdir());
        self.pdp_cache.lock().push(CachedPdp {
            pdir: pmap.pdir(),
            epoch,
        });
    }

    /// Announces that every mapping of `pmap` is about to be removed.
    ///
    /// Removals until the next [`update`](Self::update) skip their
    /// shootdowns and keep emptied PTPs; `update` then does one full flush.
    pub fn remove_all(&self, pmap: &Pmap) {
        if pmap.is_kernel() {
            return;
        }
        pmap.doomed.store(true, Ordering::SeqCst);
        debug!("remove_all: {:?} doomed", pmap.id());
    }

    /// Completes deferred work for `pmap`: waits for this CPU's
    /// shootdowns and, after `remove_all`, flushes the pmap everywhere and
    /// frees the PTPs it kept.
    pub fn update(&self, cpu: CpuId, pmap: &Pmap) {
        self.shootwait(cpu);
        if !pmap.doomed.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shootdown(cpu, pmap, crate::shootdown::Range::All, 0);
        self.shootwait(cpu);
        let deferred = core::mem::take(&mut self.lock_relaxed(cpu, &pmap.tables).deferred);
        debug!(
            "update: {:?} flushed, releasing {} PTPs",
            pmap.id(),
            deferred.len()
        );
        for pa in deferred {
            self.free_table_frame(pa);
        }
    }

    /// Copies the kernel's top-level slots into every registered pmap,
    /// starts a new kernel epoch and drops the now stale cached
    /// directories. Returns the new epoch.
    pub(crate) fn publish_kernel_slots(&self) -> u64 {
        let pmaps = self.pmaps.lock();
        for pmap in pmaps.iter() {
            self.copy_kernel_slots(pmap.pdir(), PDIR_SLOT_KERN..PDIR_SLOT_KERN + KERNEL_L4_SLOTS);
        }
        let epoch = self.kernel_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        drop(pmaps);
        self.drain_pdp_cache();
        epoch
    }

    /// Number of directories waiting in the cache.
    #[must_use]
    pub fn cached_directories(&self) -> usize {
        self.pdp_cache.lock().len()
    }

    /// Returns every cached directory to the page-table allocator.
    pub(crate) fn drain_pdp_cache(&self) {
        let drained = core::mem::take(&mut *self.pdp_cache.lock());
        if !drained.is_empty() {
            debug!("pdp cache: dropping {} stale directories", drained.len());
        }
        for pdp in drained {
            self.free_table_frame(pdp.pdir);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{MachineConfig, PmapSystem};
    use kernel_alloc::FrameAlloc;
    use kernel_info::cpu::CpuId;
    use kernel_info::memory::PDIR_SLOT_KERN;
    use kernel_vmem::{Pte, PteSlot};
    use std::sync::atomic::Ordering;

    const NEW_SLOT: usize = PDIR_SLOT_KERN + 1;

    /// Hooks a fresh table into a kernel top-level slot the way growkernel
    /// would; returns the entry.
    fn install_kernel_slot(sys: &PmapSystem) -> u64 {
        let pa = sys.machine().table_alloc().alloc_4k().unwrap();
        sys.mem().zero_frame(pa);
        let entry = Pte::directory(pa, false).into_bits();
        PteSlot::of(sys.mem(), sys.kernel().pdir(), NEW_SLOT).swap(entry);
        entry
    }

    #[test]
    fn published_slots_reach_registered_pmaps() {
        let sys = PmapSystem::bootstrap(MachineConfig::new(1));
        let p = sys.create();
        let q = sys.create();
        sys.destroy(CpuId::BSP, &q);
        assert_eq!(sys.cached_directories(), 1);

        let entry = install_kernel_slot(&sys);
        assert_eq!(sys.publish_kernel_slots(), 1);

        assert_eq!(PteSlot::of(sys.mem(), p.pdir(), NEW_SLOT).load(), entry);
        assert_eq!(sys.cached_directories(), 0);
        let r = sys.create();
        assert_eq!(PteSlot::of(sys.mem(), r.pdir(), NEW_SLOT).load(), entry);
    }

    #[test]
    fn stale_cached_directory_is_discarded() {
        let sys = PmapSystem::bootstrap(MachineConfig::new(1));
        let q = sys.create();
        sys.destroy(CpuId::BSP, &q);

        // The kernel grew after the directory was cached but before the
        // cache was drained.
        let entry = install_kernel_slot(&sys);
        sys.kernel_epoch.fetch_add(1, Ordering::SeqCst);
        assert_eq!(sys.cached_directories(), 1);

        let r = sys.create();
        assert_eq!(sys.cached_directories(), 0);
        assert_eq!(PteSlot::of(sys.mem(), r.pdir(), NEW_SLOT).load(), entry);
    }

    #[test]
    #[should_panic(expected = "still loaded")]
    fn destroying_a_loaded_pmap_is_fatal() {
        let sys = PmapSystem::bootstrap(MachineConfig::new(1));
        let p = sys.create();
        let t = crate::Thread::new(p.clone());
        sys.activate(CpuId::BSP, &t);
        sys.load(CpuId::BSP);
        sys.destroy(CpuId::BSP, &p);
        sys.destroy(CpuId::BSP, &p);
    }
}
