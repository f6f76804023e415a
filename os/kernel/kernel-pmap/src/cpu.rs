//! Per-processor pmap state.
//!
//! Each simulated CPU owns one [`CpuInfo`]: the pmap it has loaded, the
//! thread it is running, its TLB trust state and its shootdown mailbox.
//! Methods on [`PmapSystem`](crate::PmapSystem) take the executing CPU
//! explicitly; nothing here is reached through a global.

use crate::pmap::Pmap;
use crate::shootdown::Mailbox;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use crossbeam_utils::CachePadded;
use kernel_info::cpu::CpuId;
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::{PreemptCounter, SpinLock};

/// How far a CPU trusts its cached translations for the loaded pmap.
///
/// ```text
/// INVALID ──load──► VALID ──deactivate──► LAZY
///                     ▲                     │
///                     └──────load───────────┘  (reactivate, or full reload
///                                               if a shootdown intervened)
/// ```
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TlbState {
    Invalid = 0,
    Lazy = 1,
    Valid = 2,
}

impl TlbState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Lazy,
            2 => Self::Valid,
            _ => Self::Invalid,
        }
    }
}

struct ThreadInner {
    pmap: Arc<Pmap>,
}

/// A schedulable thread, as far as the pmap cares: an address space.
///
/// Clones refer to the same thread.
#[derive(Clone)]
pub struct Thread(Arc<ThreadInner>);

impl Thread {
    #[must_use]
    pub fn new(pmap: Arc<Pmap>) -> Self {
        Self(Arc::new(ThreadInner { pmap }))
    }

    #[must_use]
    pub fn pmap(&self) -> &Arc<Pmap> {
        &self.0.pmap
    }

    /// Returns `true` if `other` is the same thread.
    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

pub(crate) const IPI_MULTICAST: u8 = 1 << 0;
pub(crate) const IPI_BROADCAST: u8 = 1 << 1;

pub struct CpuInfo {
    id: CpuId,
    running: AtomicBool,
    tlb_state: AtomicU8,
    pub(crate) want_pmapload: AtomicBool,
    /// The pmap whose directory is loaded; holds a reference.
    pub(crate) pmap: SpinLock<Arc<Pmap>>,
    pub(crate) thread: SpinLock<Option<Thread>>,
    /// Directory currently borrowed through the alternate window, or zero.
    pub(crate) alt_root: AtomicU64,
    pub(crate) need_tlbwait: AtomicBool,
    pub(crate) mailbox: CachePadded<Mailbox>,
    pub(crate) pending_ipis: AtomicU8,
    pub(crate) preempt: PreemptCounter,
}

impl CpuInfo {
    pub(crate) fn new(id: CpuId, kernel: Arc<Pmap>) -> Self {
        Self {
            id,
            running: AtomicBool::new(true),
            tlb_state: AtomicU8::new(TlbState::Invalid as u8),
            want_pmapload: AtomicBool::new(false),
            pmap: SpinLock::new(kernel),
            thread: SpinLock::new(None),
            alt_root: AtomicU64::new(0),
            need_tlbwait: AtomicBool::new(false),
            mailbox: CachePadded::new(Mailbox::default()),
            pending_ipis: AtomicU8::new(0),
            preempt: PreemptCounter::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> CpuId {
        self.id
    }

    /// Returns `true` if the CPU takes part in shootdowns.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Marks the CPU as (not) running. Stopped CPUs are not sent IPIs.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    #[must_use]
    pub fn tlb_state(&self) -> TlbState {
        TlbState::from_raw(self.tlb_state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_tlb_state(&self, state: TlbState) {
        self.tlb_state.store(state as u8, Ordering::SeqCst);
    }

    /// The pmap whose directory this CPU has loaded.
    #[must_use]
    pub fn loaded_pmap(&self) -> Arc<Pmap> {
        Arc::clone(&self.pmap.lock())
    }

    #[must_use]
    pub fn current_thread(&self) -> Option<Thread> {
        self.thread.lock().clone()
    }

    /// Returns `true` if a pmap load is pending for the next safe point.
    #[must_use]
    pub fn wants_pmapload(&self) -> bool {
        self.want_pmapload.load(Ordering::SeqCst)
    }

    /// The directory borrowed through the alternate window, if any.
    #[must_use]
    pub fn alternate_root(&self) -> Option<PhysicalAddress> {
        match self.alt_root.load(Ordering::SeqCst) {
            0 => None,
            pa => Some(PhysicalAddress::new(pa)),
        }
    }

    pub(crate) fn is_current(&self, thread: &Thread) -> bool {
        self.thread.lock().as_ref().is_some_and(|t| t.is(thread))
    }
}
