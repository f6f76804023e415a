//! The physical map of one address space.

use crate::ptp::PtpTable;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use kernel_info::cpu::{AtomicCpuMask, CpuId, CpuMask};
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::SpinLock;

/// Identity of a pmap; also the global lock order (lower locks first).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PmapId(u64);

impl PmapId {
    pub const KERNEL: Self = Self(0);

    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for PmapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pmap#{}", self.0)
    }
}

/// A physical map.
///
/// Handles are `Arc<Pmap>`; the VM-visible reference count is separate and
/// maintained through [`PmapSystem::reference`](crate::PmapSystem::reference)
/// and [`PmapSystem::destroy`](crate::PmapSystem::destroy).
pub struct Pmap {
    id: PmapId,
    pdir: PhysicalAddress,
    pub(crate) refs: AtomicU32,
    /// CPUs that may hold user translations of this pmap.
    pub(crate) cpus: AtomicCpuMask,
    /// CPUs that have this pmap loaded in any state.
    pub(crate) kernel_cpus: AtomicCpuMask,
    resident: AtomicU64,
    wired: AtomicU64,
    /// Set by `remove_all`: shootdowns are skipped until the next update.
    pub(crate) doomed: AtomicBool,
    pub(crate) tables: SpinLock<PtpTable>,
}

impl Pmap {
    pub(crate) fn new(id: PmapId, pdir: PhysicalAddress, refs: u32) -> Self {
        Self {
            id,
            pdir,
            refs: AtomicU32::new(refs),
            cpus: AtomicCpuMask::default(),
            kernel_cpus: AtomicCpuMask::default(),
            resident: AtomicU64::new(1),
            wired: AtomicU64::new(0),
            doomed: AtomicBool::new(false),
            tables: SpinLock::new(PtpTable::default()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> PmapId {
        self.id
    }

    #[must_use]
    pub fn is_kernel(&self) -> bool {
        self.id == PmapId::KERNEL
    }

    /// The top-level directory.
    #[must_use]
    pub const fn pdir(&self) -> PhysicalAddress {
        self.pdir
    }

    /// Pages accounted to this pmap: the directory, PTPs and mapped pages.
    #[must_use]
    pub fn resident_count(&self) -> u64 {
        self.resident.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn wired_count(&self) -> u64 {
        self.wired.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    /// CPUs that must be sent user-range shootdowns.
    #[must_use]
    pub fn active_cpus(&self) -> CpuMask {
        self.cpus.load()
    }

    /// CPUs that have the directory loaded, whether valid or lazy.
    #[must_use]
    pub fn loaded_cpus(&self) -> CpuMask {
        self.kernel_cpus.load()
    }

    #[must_use]
    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::SeqCst)
    }

    /// `pmap_is_active`: may `cpu` hold translations for this pmap in the
    /// given half of the address space?
    pub(crate) fn is_active_on(&self, cpu: CpuId, kernel_range: bool) -> bool {
        self.is_kernel()
            || self.cpus.contains(cpu)
            || (kernel_range && self.kernel_cpus.contains(cpu))
    }

    pub(crate) fn add_resident(&self, delta: i64) {
        add_signed(&self.resident, delta);
    }

    pub(crate) fn add_wired(&self, delta: i64) {
        add_signed(&self.wired, delta);
    }

    /// Applies the statistics change of replacing `opte` by `npte`.
    pub(crate) fn update_stats(&self, opte: u64, npte: u64) {
        use kernel_vmem::{mask, pte::is_valid};
        let resident = i64::from(is_valid(npte)) - i64::from(is_valid(opte));
        let wired_bit = |v: u64| is_valid(v) && v & mask::WIRED != 0;
        let wired = i64::from(wired_bit(npte)) - i64::from(wired_bit(opte));
        self.add_resident(resident);
        self.add_wired(wired);
    }
}

fn add_signed(counter: &AtomicU64, delta: i64) {
    match delta {
        0 => {}
        d if d > 0 => {
            counter.fetch_add(d.unsigned_abs(), Ordering::Relaxed);
        }
        d => {
            let prev = counter.fetch_sub(d.unsigned_abs(), Ordering::Relaxed);
            assert!(prev >= d.unsigned_abs(), "pmap statistics underflow");
        }
    }
}

impl fmt::Debug for Pmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pmap")
            .field("id", &self.id)
            .field("pdir", &self.pdir)
            .field("refs", &self.ref_count())
            .field("resident", &self.resident_count())
            .field("wired", &self.wired_count())
            .field("cpus", &self.active_cpus())
            .finish_non_exhaustive()
    }
}
