//! The simulated machine the pmap runs on: RAM, MMUs and the two physical
//! frame allocators.

use crate::config::MachineConfig;
use alloc::sync::Arc;
use kernel_alloc::FreeListFrameAlloc;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::{PhysMemory, SimMmu};

pub struct Machine {
    config: MachineConfig,
    mem: Arc<PhysMemory>,
    mmu: SimMmu,
    pages: FreeListFrameAlloc,
    tables: FreeListFrameAlloc,
}

impl Machine {
    #[must_use]
    pub fn new(config: MachineConfig) -> Self {
        config.validate();
        let mem = Arc::new(PhysMemory::new(config.ram_frames()));
        let mmu = SimMmu::new(Arc::clone(&mem), config.cpus);
        let managed_end = PhysicalAddress::new(config.managed_frames as u64 * PAGE_SIZE);
        Self {
            pages: FreeListFrameAlloc::new(PhysicalAddress::zero(), managed_end),
            tables: FreeListFrameAlloc::new(managed_end, mem.end()),
            config,
            mem,
            mmu,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &MachineConfig {
        &self.config
    }

    #[must_use]
    pub fn memory(&self) -> &PhysMemory {
        &self.mem
    }

    /// The MMUs, with the inspection interface tests use.
    #[must_use]
    pub const fn mmu(&self) -> &SimMmu {
        &self.mmu
    }

    /// Allocator for managed pages; what the VM layer would hand out.
    #[must_use]
    pub const fn page_alloc(&self) -> &FreeListFrameAlloc {
        &self.pages
    }

    /// Allocator for page-table pages and top-level directories.
    #[must_use]
    pub const fn table_alloc(&self) -> &FreeListFrameAlloc {
        &self.tables
    }

    /// End of the managed range. Frames below it carry PV metadata.
    #[must_use]
    pub const fn managed_end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.config.managed_frames as u64 * PAGE_SIZE)
    }
}
