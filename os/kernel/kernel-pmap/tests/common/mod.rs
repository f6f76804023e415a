#![allow(dead_code)]

use kernel_info::cpu::CpuId;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_pmap::{MachineConfig, Pmap, PmapSystem, Thread};
use std::sync::Arc;

pub const CPU0: CpuId = CpuId::BSP;
pub const CPU1: CpuId = CpuId::new(1);

pub fn system(cpus: usize) -> PmapSystem {
    PmapSystem::bootstrap(MachineConfig::new(cpus))
}

pub const fn va(addr: u64) -> VirtualAddress {
    VirtualAddress::new(addr)
}

pub const fn pa(addr: u64) -> PhysicalAddress {
    PhysicalAddress::new(addr)
}

/// Switches a fresh thread of `pmap` in on `cpu` and loads its directory.
pub fn run_on(sys: &PmapSystem, cpu: CpuId, pmap: &Arc<Pmap>) -> Thread {
    let thread = Thread::new(Arc::clone(pmap));
    sys.activate(cpu, &thread);
    sys.load(cpu);
    thread
}

/// Every PTP of `pmap` holds one wire count for itself plus one per valid entry.
pub fn assert_wire_conservation(sys: &PmapSystem, cpu: CpuId, pmap: &Pmap) {
    for ptp in sys.ptp_census(cpu, pmap) {
        assert_eq!(
            ptp.wire_count,
            1 + ptp.valid_entries,
            "level {} PTP at {} covering {}",
            ptp.level,
            ptp.pa,
            ptp.base
        );
    }
}
