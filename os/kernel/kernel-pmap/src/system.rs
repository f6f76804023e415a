//! The pmap module state shared by all CPUs.

use crate::config::MachineConfig;
use crate::cpu::CpuInfo;
use crate::lifecycle::CachedPdp;
use crate::machine::Machine;
use crate::pmap::{Pmap, PmapId};
use crate::pv::PvTable;
use crate::shootdown::Mailbox;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use crossbeam_utils::{Backoff, CachePadded};
use kernel_alloc::FrameAlloc;
use kernel_info::cpu::CpuId;
use kernel_info::memory::{KERNEL_SPACE_START, PAGE_SIZE};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::{SpinLock, SpinLockGuard};
use kernel_vmem::{Mmu, PhysMemory};
use log::info;

/// The pmap of a whole machine: the kernel pmap, every CPU's state, the
/// global pmap list, the directory cache and the PV metadata.
///
/// Operations take the executing CPU explicitly. A CPU is driven by one
/// thread at a time.
pub struct PmapSystem {
    machine: Machine,
    cpus: Box<[CpuInfo]>,
    kernel: Arc<Pmap>,
    /// Every user pmap; `growkernel` propagates new kernel slots to them.
    pub(crate) pmaps: SpinLock<Vec<Arc<Pmap>>>,
    pub(crate) pdp_cache: SpinLock<Vec<CachedPdp>>,
    /// Bumped (under the `pmaps` lock) whenever kernel top-level slots are added.
    pub(crate) kernel_epoch: AtomicU64,
    pub(crate) kernel_ceiling: AtomicU64,
    next_id: AtomicU64,
    pub(crate) pv: PvTable,
    pub(crate) broadcast: CachePadded<Mailbox>,
}

impl PmapSystem {
    /// Builds the machine and the kernel pmap, maps the initial kernel VA
    /// with PTPs, and loads the kernel directory on every CPU.
    ///
    /// # Panics
    /// If the configuration is unusable or there is not enough memory for
    /// the initial kernel page tables.
    #[must_use]
    pub fn bootstrap(config: MachineConfig) -> Self {
        let machine = Machine::new(config);
        let pdir = machine
            .table_alloc()
            .alloc_4k()
            .unwrap_or_else(|e| panic!("bootstrap: kernel directory: {e}"));
        machine.memory().zero_frame(pdir);

        // Each CPU's loaded-pmap slot holds a kernel reference.
        let refs = u32::try_from(config.cpus + 1).unwrap_or(u32::MAX);
        let kernel = Arc::new(Pmap::new(PmapId::KERNEL, pdir, refs));
        let cpus = (0..config.cpus)
            .map(|i| CpuInfo::new(CpuId::new(i), Arc::clone(&kernel)))
            .collect();

        let sys = Self {
            pv: PvTable::new(config.managed_frames, config.pv_entries),
            machine,
            cpus,
            kernel,
            pmaps: SpinLock::new(Vec::new()),
            pdp_cache: SpinLock::new(Vec::new()),
            kernel_epoch: AtomicU64::new(0),
            kernel_ceiling: AtomicU64::new(KERNEL_SPACE_START),
            next_id: AtomicU64::new(PmapId::KERNEL.as_u64() + 1),
            broadcast: CachePadded::new(Mailbox::default()),
        };

        let ceiling = VirtualAddress::new(config.initial_kernel_ceiling());
        sys.grow_kernel_tables(VirtualAddress::new(KERNEL_SPACE_START), ceiling);
        sys.kernel_ceiling.store(ceiling.as_u64(), Ordering::SeqCst);

        for ci in sys.cpus() {
            sys.mmu().load_root(ci.id(), pdir);
        }
        info!(
            "pmap: {} CPUs, {} KiB RAM ({} managed pages), kernel VA {:#x}..{ceiling}",
            config.cpus,
            config.ram_frames() as u64 * PAGE_SIZE / 1024,
            config.managed_frames,
            KERNEL_SPACE_START
        );
        sys
    }

    #[must_use]
    pub const fn machine(&self) -> &Machine {
        &self.machine
    }

    #[must_use]
    pub const fn config(&self) -> &MachineConfig {
        self.machine.config()
    }

    #[must_use]
    pub const fn kernel(&self) -> &Arc<Pmap> {
        &self.kernel
    }

    /// # Panics
    /// If `cpu` does not exist.
    #[must_use]
    pub fn cpu(&self, cpu: CpuId) -> &CpuInfo {
        &self.cpus[cpu.index()]
    }

    pub fn cpus(&self) -> impl ExactSizeIterator<Item = &CpuInfo> {
        self.cpus.iter()
    }

    pub(crate) fn mem(&self) -> &PhysMemory {
        self.machine.memory()
    }

    pub(crate) fn mmu(&self) -> &dyn Mmu {
        self.machine.mmu()
    }

    pub(crate) fn next_pmap_id(&self) -> PmapId {
        PmapId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Takes `lock` on behalf of `cpu`, servicing its interrupts while
    /// waiting.
    pub(crate) fn lock_relaxed<'a, T>(
        &self,
        cpu: CpuId,
        lock: &'a SpinLock<T>,
    ) -> SpinLockGuard<'a, T> {
        let backoff = Backoff::new();
        lock.lock_with(|| {
            self.service_interrupts(cpu);
            backoff.spin();
        })
    }
}
