//! Kernel virtual address space: unmanaged mappings and growth.

use crate::PmapSystem;
use crate::accessor::Ptes;
use crate::flags::{Prot, pte_bits};
use crate::shootdown::Range;
use core::sync::atomic::Ordering;
use kernel_alloc::FrameAlloc;
use kernel_info::cpu::CpuId;
use kernel_info::memory::{KERNEL_GROW_GRANULE, KERNEL_SPACE_LIMIT, KERNEL_SPACE_START, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress, level_span};
use kernel_vmem::{Pte, PteSlot, TOP_LEVEL, mask, pte};
use log::{debug, info};

impl PmapSystem {
    /// Maps `va` to `pa` in the kernel pmap without PV tracking.
    ///
    /// # Panics
    /// If `va` is not a kernel address below the current ceiling.
    pub fn kenter_pa(&self, cpu: CpuId, va: VirtualAddress, pa: PhysicalAddress, prot: Prot) {
        let kernel = self.kernel();
        super::check_range("kenter_pa", kernel, va, va.wrapping_add(PAGE_SIZE));
        assert!(pa.is_aligned::<Size4K>(), "kenter_pa: unaligned {pa}");
        let _preempt = self.cpu(cpu).preempt.disable();

        let mut npte = pa.as_u64() | mask::PRESENT | pte_bits(prot);
        if self.config().global_pages {
            npte |= mask::GLOBAL;
        }
        let ptes = Ptes::unlocked(self.mem(), kernel);
        let Some((_, slot)) = ptes.leaf(va) else {
            panic!("kenter_pa: no page table for {va}");
        };
        let opte = self.mmu().store_entry(slot, npte);
        assert!(
            opte & mask::PVLIST == 0,
            "kenter_pa: {va} replaced a managed mapping"
        );
        kernel.add_resident(i64::from(!pte::is_valid(opte)));
        if pte::is_valid(opte) && opte & mask::ACCESSED != 0 {
            self.shootdown(cpu, kernel, Range::page(va), opte);
        }
    }

    /// Removes the unmanaged kernel mappings in `[va, va + len)`. Callers
    /// follow up with [`update`](Self::update).
    pub fn kremove(&self, cpu: CpuId, va: VirtualAddress, len: u64) {
        let kernel = self.kernel();
        let eva = va.wrapping_add(len);
        super::check_range("kremove", kernel, va, eva);
        let _preempt = self.cpu(cpu).preempt.disable();

        let ptes = Ptes::unlocked(self.mem(), kernel);
        let mut xpte = 0;
        let mut cur = va;
        while cur.as_u64() < eva.as_u64() {
            if let Some((_, slot)) = ptes.leaf(cur) {
                let opte = self.mmu().store_entry(slot, 0);
                if pte::is_valid(opte) {
                    assert!(
                        opte & mask::PVLIST == 0,
                        "kremove: {cur} is a managed mapping"
                    );
                    kernel.add_resident(-1);
                    xpte |= opte;
                }
            }
            cur = cur.wrapping_add(PAGE_SIZE);
        }
        if pte::is_valid(xpte) && xpte & mask::ACCESSED != 0 {
            self.shootdown(cpu, kernel, Range::span(va, eva), xpte);
        }
    }

    /// Extends the kernel VA covered by page tables to at least `maxkva`
    /// and returns the new ceiling.
    ///
    /// # Panics
    /// If the kernel range or page-table memory is exhausted.
    pub fn growkernel(&self, cpu: CpuId, maxkva: VirtualAddress) -> VirtualAddress {
        let kernel = self.kernel();
        let _serialize = self.lock_relaxed(cpu, &kernel.tables);
        let current = VirtualAddress::new(self.kernel_ceiling.load(Ordering::SeqCst));
        if maxkva.as_u64() <= current.as_u64() {
            return current;
        }
        let target = maxkva
            .as_u64()
            .checked_next_multiple_of(KERNEL_GROW_GRANULE)
            .filter(|&t| t <= KERNEL_SPACE_LIMIT)
            .unwrap_or_else(|| panic!("growkernel: {maxkva} beyond the kernel range"));
        let target = VirtualAddress::new(target);

        let added = self.grow_kernel_tables(current, target);
        if added > 0 {
            let epoch = self.publish_kernel_slots();
            debug!("growkernel: {added} new top-level slots, epoch {epoch}");
        }
        self.kernel_ceiling.store(target.as_u64(), Ordering::SeqCst);
        info!("growkernel: kernel VA now ends at {target}");
        target
    }

    /// Allocates the kernel PTPs for `[from, to)` and returns how many
    /// top-level slots were filled.
    pub(crate) fn grow_kernel_tables(&self, from: VirtualAddress, to: VirtualAddress) -> usize {
        let mem = self.mem();
        let kernel = self.kernel();
        let mut added = 0;
        let mut va = from.trunc_to(level_span(2));
        while va.as_u64() < to.as_u64() {
            let mut table = kernel.pdir();
            for level in (2..=TOP_LEVEL).rev() {
                let slot = PteSlot::of(mem, table, va.table_index(level));
                let entry = slot.load();
                if pte::is_valid(entry) {
                    table = pte::frame_of(entry);
                    continue;
                }
                let pa = self
                    .machine()
                    .table_alloc()
                    .alloc_4k()
                    .unwrap_or_else(|e| panic!("growkernel: no page-table page: {e}"));
                mem.zero_frame(pa);
                self.mmu()
                    .store_entry(slot, Pte::directory(pa, false).into_bits());
                kernel.add_resident(1);
                if level == TOP_LEVEL {
                    added += 1;
                }
                table = pa;
            }
            va = va.wrapping_add(level_span(2));
        }
        added
    }

    /// The kernel VA range available for mappings.
    #[must_use]
    pub fn virtual_space(&self) -> (VirtualAddress, VirtualAddress) {
        (
            VirtualAddress::new(KERNEL_SPACE_START),
            VirtualAddress::new(self.kernel_ceiling.load(Ordering::SeqCst)),
        )
    }
}
