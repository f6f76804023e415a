//! Run-time parameters of the simulated machine.

use kernel_info::memory::{KERNEL_GROW_GRANULE, KERNEL_SPACE_START, MAX_CPUS};

/// How interprocessor interrupts reach their target.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IpiDelivery {
    /// The handler runs synchronously inside the send, on the sender's
    /// thread. Suitable when one thread drives every CPU.
    Immediate,
    /// A pending bit is set on the target; the target's own thread runs
    /// the handler from [`PmapSystem::service_interrupts`](crate::PmapSystem::service_interrupts).
    Queued,
}

/// Machine description used by [`PmapSystem::bootstrap`](crate::PmapSystem::bootstrap).
///
/// Physical memory is laid out as the managed range (pages handed to the
/// VM layer, tracked by PV entries) followed by the table range (page-table
/// pages and top-level directories):
///
/// ```text
/// 0 ─────────────── managed_frames ─────────────── + table_frames
/// │ managed pages  │ page tables, directories     │ (unmanaged beyond)
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MachineConfig {
    pub cpus: usize,
    pub managed_frames: usize,
    pub table_frames: usize,
    pub pv_entries: usize,
    /// Kernel VA mapped by PTPs at bootstrap, counted from the kernel base.
    pub initial_kva: u64,
    pub global_pages: bool,
    pub ipi_delivery: IpiDelivery,
}

impl MachineConfig {
    #[must_use]
    pub const fn new(cpus: usize) -> Self {
        Self {
            cpus,
            managed_frames: 256,
            table_frames: 512,
            pv_entries: 1024,
            initial_kva: KERNEL_GROW_GRANULE,
            global_pages: true,
            ipi_delivery: IpiDelivery::Immediate,
        }
    }

    #[must_use]
    pub const fn with_managed_frames(mut self, frames: usize) -> Self {
        self.managed_frames = frames;
        self
    }

    #[must_use]
    pub const fn with_table_frames(mut self, frames: usize) -> Self {
        self.table_frames = frames;
        self
    }

    #[must_use]
    pub const fn with_pv_entries(mut self, entries: usize) -> Self {
        self.pv_entries = entries;
        self
    }

    #[must_use]
    pub const fn with_initial_kva(mut self, bytes: u64) -> Self {
        self.initial_kva = bytes;
        self
    }

    #[must_use]
    pub const fn with_global_pages(mut self, enabled: bool) -> Self {
        self.global_pages = enabled;
        self
    }

    #[must_use]
    pub const fn with_ipi_delivery(mut self, delivery: IpiDelivery) -> Self {
        self.ipi_delivery = delivery;
        self
    }

    /// Total number of RAM frames.
    #[must_use]
    pub const fn ram_frames(&self) -> usize {
        self.managed_frames + self.table_frames
    }

    /// First kernel VA not covered at bootstrap.
    #[must_use]
    pub const fn initial_kernel_ceiling(&self) -> u64 {
        let granule = KERNEL_GROW_GRANULE;
        KERNEL_SPACE_START + self.initial_kva.div_ceil(granule) * granule
    }

    pub(crate) fn validate(&self) {
        assert!(
            (1..=MAX_CPUS).contains(&self.cpus),
            "bootstrap: {} CPUs not supported",
            self.cpus
        );
        assert!(self.table_frames > 0, "bootstrap: no frames for page tables");
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_ceiling_rounds_to_the_granule() {
        let c = MachineConfig::new(2).with_initial_kva(1);
        assert_eq!(c.initial_kernel_ceiling(), KERNEL_SPACE_START + KERNEL_GROW_GRANULE);
        let c = c.with_initial_kva(0);
        assert_eq!(c.initial_kernel_ceiling(), KERNEL_SPACE_START);
    }

    #[test]
    #[should_panic(expected = "CPUs not supported")]
    fn zero_cpus_rejected() {
        MachineConfig::new(0).validate();
    }
}
