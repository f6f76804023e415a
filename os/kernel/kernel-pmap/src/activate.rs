//! # Activation and Context Switch
//!
//! The scheduler calls [`activate`](PmapSystem::activate) when a thread is
//! switched in and [`deactivate`](PmapSystem::deactivate) when it is
//! switched out. Loading the directory is deferred to
//! [`load`](PmapSystem::load) at the next safe point. Switching back to the
//! pmap a CPU still has loaded lazily avoids the root reload unless a
//! shootdown arrived in the meantime.

use crate::PmapSystem;
use crate::cpu::{Thread, TlbState};
use crate::pmap::Pmap;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use kernel_info::cpu::CpuId;
use log::debug;

impl PmapSystem {
    /// Makes `thread` the running thread of `cpu` and schedules its pmap to
    /// be loaded.
    pub fn activate(&self, cpu: CpuId, thread: &Thread) {
        let ci = self.cpu(cpu);
        *ci.thread.lock() = Some(thread.clone());
        debug_assert_ne!(ci.tlb_state(), TlbState::Valid, "{cpu}: activate while VALID");
        if thread.pmap().is_kernel() {
            ci.want_pmapload.store(false, Ordering::SeqCst);
            return;
        }
        ci.want_pmapload.store(true, Ordering::SeqCst);
    }

    /// Loads the running thread's pmap on `cpu`, if a load is pending.
    ///
    /// # Panics
    /// If no thread is running on `cpu`.
    pub fn load(&self, cpu: CpuId) {
        let ci = self.cpu(cpu);
        let _preempt = ci.preempt.disable();
        if !ci.want_pmapload.load(Ordering::SeqCst) {
            return;
        }
        let Some(thread) = ci.current_thread() else {
            panic!("load: {cpu} has no running thread");
        };
        let pmap = Arc::clone(thread.pmap());
        assert!(!pmap.is_kernel(), "load: kernel pmap");

        let old = ci.loaded_pmap();
        if Arc::ptr_eq(&pmap, &old) {
            if !self.reactivate(cpu, &pmap) {
                // A shootdown arrived while lazy; our translations are stale.
                self.mmu().load_root(cpu, pmap.pdir());
                debug!("load: {cpu} reloaded {:?} after shootdown", pmap.id());
            }
            ci.want_pmapload.store(false, Ordering::SeqCst);
            return;
        }

        self.reference(&pmap);
        old.cpus.remove(cpu);
        old.kernel_cpus.remove(cpu);
        debug_assert!(!pmap.cpus.contains(cpu));
        ci.set_tlb_state(TlbState::Valid);
        pmap.cpus.insert(cpu);
        pmap.kernel_cpus.insert(cpu);
        *ci.pmap.lock() = Arc::clone(&pmap);
        self.mmu().load_root(cpu, pmap.pdir());
        ci.want_pmapload.store(false, Ordering::SeqCst);
        debug!("load: {cpu} switched {:?} -> {:?}", old.id(), pmap.id());

        if old.is_kernel() {
            old.refs.fetch_sub(1, Ordering::SeqCst);
        } else {
            self.destroy(cpu, &old);
        }
    }

    /// Re-declares `cpu` as relying on its cached translations of the
    /// loaded `pmap`. Returns `false` if a shootdown removed the CPU from
    /// the pmap's active set while it was lazy, in which case the caller
    /// must reload the root.
    pub(crate) fn reactivate(&self, cpu: CpuId, pmap: &Pmap) -> bool {
        let ci = self.cpu(cpu);
        ci.set_tlb_state(TlbState::Valid);
        debug_assert!(pmap.kernel_cpus.contains(cpu));
        if pmap.cpus.contains(cpu) {
            return true;
        }
        pmap.cpus.insert(cpu);
        false
    }

    /// Switches `thread` out on `cpu`. The directory stays loaded; the
    /// CPU's relationship to it drops to `LAZY`.
    pub fn deactivate(&self, cpu: CpuId, thread: &Thread) {
        let ci = self.cpu(cpu);
        if !ci.is_current(thread) {
            return;
        }
        self.shootwait(cpu);
        if ci.want_pmapload.swap(false, Ordering::SeqCst) {
            return;
        }
        let pmap = thread.pmap();
        if pmap.is_kernel() {
            return;
        }
        debug_assert!(Arc::ptr_eq(&ci.loaded_pmap(), pmap));
        debug_assert_eq!(ci.tlb_state(), TlbState::Valid);
        ci.set_tlb_state(TlbState::Lazy);
    }
}
