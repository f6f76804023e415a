//! # Simulated Translation Hardware
//!
//! [`SimMmu`] gives every simulated processor a root register and a
//! software TLB of 4 KiB leaf translations. [`SimMmu::access`] behaves like
//! a memory access: it hits in the TLB when it can, otherwise walks the
//! tables from the loaded root, sets the accessed (and, for writes, dirty)
//! bit in the leaf with a compare-and-swap, and caches the result.
//!
//! Stale entries stay in the TLB until something invalidates them, which
//! is exactly what the shootdown protocol exists to prevent.

use crate::mmu::{FlushScope, Mmu};
use crate::phys::PhysMemory;
use crate::pte::{self, mask};
use crate::table::PteSlot;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::cpu::CpuId;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress, level_span};
use kernel_sync::SpinLock;

/// Kind of memory access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// A page fault raised by [`SimMmu::access`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum Fault {
    #[error("{va}: no valid entry at level {level}")]
    NotPresent { va: VirtualAddress, level: u8 },
    #[error("{va}: {kind:?} access denied")]
    Protection { va: VirtualAddress, kind: AccessKind },
}

/// A cached translation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TlbEntry {
    pub frame: PhysicalAddress,
    pub writable: bool,
    pub user: bool,
    pub global: bool,
    pub dirty: bool,
    pub no_execute: bool,
}

impl TlbEntry {
    const fn permits(&self, kind: AccessKind, user: bool) -> bool {
        (!user || self.user)
            && !matches!(kind, AccessKind::Write if !self.writable)
            && !matches!(kind, AccessKind::Execute if self.no_execute)
    }
}

#[derive(Default)]
struct Tlb {
    root: PhysicalAddress,
    entries: BTreeMap<u64, TlbEntry>,
}

#[derive(Default)]
struct SimCpu {
    tlb: SpinLock<Tlb>,
    root_loads: AtomicU64,
    flushes: AtomicU64,
    invalidations: AtomicU64,
}

/// Per-CPU counters of TLB maintenance operations.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TlbCounters {
    pub root_loads: u64,
    pub flushes: u64,
    pub invalidations: u64,
}

/// Software model of the MMUs of a multiprocessor.
pub struct SimMmu {
    mem: Arc<PhysMemory>,
    cpus: Box<[SimCpu]>,
}

impl SimMmu {
    #[must_use]
    pub fn new(mem: Arc<PhysMemory>, cpu_count: usize) -> Self {
        let cpus: Vec<SimCpu> = (0..cpu_count).map(|_| SimCpu::default()).collect();
        Self {
            mem,
            cpus: cpus.into_boxed_slice(),
        }
    }

    #[must_use]
    pub const fn memory(&self) -> &Arc<PhysMemory> {
        &self.mem
    }

    fn cpu(&self, cpu: CpuId) -> &SimCpu {
        &self.cpus[cpu.index()]
    }

    /// Performs a memory access on `cpu` and returns the physical address.
    ///
    /// # Errors
    /// [`Fault::NotPresent`] if some level of the walk is invalid,
    /// [`Fault::Protection`] if the translation forbids the access.
    pub fn access(
        &self,
        cpu: CpuId,
        va: VirtualAddress,
        kind: AccessKind,
        user: bool,
    ) -> Result<PhysicalAddress, Fault> {
        let vpn = va.trunc::<Size4K>().as_u64();
        let offset = va.offset::<Size4K>();
        let mut tlb = self.cpu(cpu).tlb.lock();

        if let Some(e) = tlb.entries.get(&vpn) {
            let needs_dirty = kind == AccessKind::Write && !e.dirty;
            if e.permits(kind, user) && !needs_dirty {
                return Ok(e.frame + offset);
            }
        }

        // Miss, or a hit that hardware would re-walk: start over from the tables.
        tlb.entries.remove(&vpn);
        let entry = self.walk_and_mark(tlb.root, va, kind, user)?;
        tlb.entries.insert(vpn, entry);
        Ok(entry.frame + offset)
    }

    fn walk_and_mark(
        &self,
        root: PhysicalAddress,
        va: VirtualAddress,
        kind: AccessKind,
        user: bool,
    ) -> Result<TlbEntry, Fault> {
        let mut table = root;
        let mut user_ok = true;
        let mut write_ok = true;
        let mut nx = false;

        for level in (1..=4u8).rev() {
            let slot = PteSlot::of(&self.mem, table, va.table_index(level));
            let entry = slot.load();
            if !pte::is_valid(entry) {
                return Err(Fault::NotPresent { va, level });
            }

            let leaf = level == 1 || (level <= 3 && entry & mask::LARGE_PAGE != 0);
            if !leaf {
                user_ok &= entry & mask::USER != 0;
                write_ok &= entry & mask::WRITABLE != 0;
                nx |= entry & mask::NO_EXECUTE != 0;
                table = pte::frame_of(entry);
                continue;
            }

            // Set A (and D) without resurrecting an entry that was zapped
            // or changed underneath us.
            let mut cur = entry;
            loop {
                if !pte::is_valid(cur) {
                    return Err(Fault::NotPresent { va, level });
                }
                let probe = TlbEntry {
                    frame: PhysicalAddress::zero(),
                    writable: write_ok && cur & mask::WRITABLE != 0,
                    user: user_ok && cur & mask::USER != 0,
                    global: false,
                    dirty: false,
                    no_execute: nx || cur & mask::NO_EXECUTE != 0,
                };
                if !probe.permits(kind, user) {
                    return Err(Fault::Protection { va, kind });
                }
                let mut new = cur | mask::ACCESSED;
                if kind == AccessKind::Write {
                    new |= mask::DIRTY;
                }
                if new != cur {
                    if let Err(seen) = slot.compare_exchange(cur, new) {
                        cur = seen;
                        continue;
                    }
                }

                let base = pte::frame_of(new);
                let frame = if level == 1 {
                    base
                } else {
                    base + (va.as_u64() & (level_span(level) - 1) & !Size4K::MASK)
                };
                return Ok(TlbEntry {
                    frame,
                    global: new & mask::GLOBAL != 0,
                    dirty: new & mask::DIRTY != 0,
                    ..probe
                });
            }
        }
        unreachable!("level 1 is always a leaf")
    }

    /// Looks up `va` in the TLB of `cpu` without walking.
    #[must_use]
    pub fn probe(&self, cpu: CpuId, va: VirtualAddress) -> Option<TlbEntry> {
        let vpn = va.trunc::<Size4K>().as_u64();
        self.cpu(cpu).tlb.lock().entries.get(&vpn).copied()
    }

    /// Number of cached translations on `cpu`.
    #[must_use]
    pub fn tlb_len(&self, cpu: CpuId) -> usize {
        self.cpu(cpu).tlb.lock().entries.len()
    }

    #[must_use]
    pub fn counters(&self, cpu: CpuId) -> TlbCounters {
        let c = self.cpu(cpu);
        TlbCounters {
            root_loads: c.root_loads.load(Ordering::SeqCst),
            flushes: c.flushes.load(Ordering::SeqCst),
            invalidations: c.invalidations.load(Ordering::SeqCst),
        }
    }
}

impl Mmu for SimMmu {
    fn invalidate_page(&self, cpu: CpuId, va: VirtualAddress) {
        let c = self.cpu(cpu);
        c.invalidations.fetch_add(1, Ordering::SeqCst);
        c.tlb.lock().entries.remove(&va.trunc::<Size4K>().as_u64());
    }

    fn flush(&self, cpu: CpuId, scope: FlushScope) {
        let c = self.cpu(cpu);
        c.flushes.fetch_add(1, Ordering::SeqCst);
        let mut tlb = c.tlb.lock();
        match scope {
            FlushScope::NonGlobal => tlb.entries.retain(|_, e| e.global),
            FlushScope::All => tlb.entries.clear(),
        }
    }

    fn load_root(&self, cpu: CpuId, root: PhysicalAddress) {
        let c = self.cpu(cpu);
        c.root_loads.fetch_add(1, Ordering::SeqCst);
        let mut tlb = c.tlb.lock();
        tlb.root = root;
        tlb.entries.retain(|_, e| e.global);
    }

    fn root(&self, cpu: CpuId) -> PhysicalAddress {
        self.cpu(cpu).tlb.lock().root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pte::Pte;

    const ROOT: u64 = 0x1000;
    const VA: u64 = 0x0000_0000_0040_3000;
    const DATA: u64 = 0x5000;

    /// Builds root -> L3 -> L2 -> L1 for `VA` and returns the leaf slot's table.
    fn tables(mem: &PhysMemory) -> PhysicalAddress {
        let va = VirtualAddress::new(VA);
        let chain = [(ROOT, 4u8, 0x2000u64), (0x2000, 3, 0x3000), (0x3000, 2, 0x4000)];
        for (table, level, next) in chain {
            PteSlot::of(mem, PhysicalAddress::new(table), va.table_index(level))
                .swap(Pte::directory(PhysicalAddress::new(next), true).into_bits());
        }
        PhysicalAddress::new(0x4000)
    }

    fn leaf(mem: &PhysMemory) -> PteSlot<'_> {
        PteSlot::of(mem, PhysicalAddress::new(0x4000), VirtualAddress::new(VA).table_index(1))
    }

    fn setup(writable: bool) -> SimMmu {
        let mem = Arc::new(PhysMemory::new(8));
        tables(&mem);
        leaf(&mem).swap(
            Pte::new()
                .with_present(true)
                .with_writable(writable)
                .with_user(true)
                .with_address(PhysicalAddress::new(DATA))
                .into_bits(),
        );
        let mmu = SimMmu::new(mem, 2);
        mmu.load_root(CpuId::new(0), PhysicalAddress::new(ROOT));
        mmu.load_root(CpuId::new(1), PhysicalAddress::new(ROOT));
        mmu
    }

    #[test]
    fn access_sets_accessed_and_dirty() {
        let mmu = setup(true);
        let cpu = CpuId::new(0);
        let va = VirtualAddress::new(VA + 0x18);

        assert_eq!(mmu.access(cpu, va, AccessKind::Read, true), Ok(PhysicalAddress::new(DATA + 0x18)));
        let e = leaf(mmu.memory()).load();
        assert!(e & mask::ACCESSED != 0 && e & mask::DIRTY == 0);

        mmu.access(cpu, va, AccessKind::Write, true).unwrap();
        assert!(leaf(mmu.memory()).load() & mask::DIRTY != 0);
        assert!(mmu.probe(cpu, va).unwrap().dirty);
    }

    #[test]
    fn write_to_read_only_faults() {
        let mmu = setup(false);
        let va = VirtualAddress::new(VA);
        assert_eq!(
            mmu.access(CpuId::new(0), va, AccessKind::Write, true),
            Err(Fault::Protection { va, kind: AccessKind::Write })
        );
        assert_eq!(leaf(mmu.memory()).load() & mask::DIRTY, 0);
    }

    #[test]
    fn missing_levels_fault() {
        let mmu = setup(true);
        let va = VirtualAddress::new(0x0000_7000_0000_0000);
        assert_eq!(
            mmu.access(CpuId::new(1), va, AccessKind::Read, true),
            Err(Fault::NotPresent { va, level: 4 })
        );
    }

    #[test]
    fn stale_translation_survives_until_invalidated() {
        let mmu = setup(true);
        let cpu = CpuId::new(1);
        let va = VirtualAddress::new(VA);
        mmu.access(cpu, va, AccessKind::Read, true).unwrap();

        leaf(mmu.memory()).swap(0);
        assert!(mmu.access(cpu, va, AccessKind::Read, true).is_ok());

        mmu.invalidate_page(cpu, va);
        assert!(mmu.probe(cpu, va).is_none());
        assert!(mmu.access(cpu, va, AccessKind::Read, true).is_err());
        assert_eq!(mmu.counters(cpu).invalidations, 1);
    }

    #[test]
    fn root_load_keeps_only_global_entries() {
        let mmu = setup(true);
        let cpu = CpuId::new(0);
        leaf(mmu.memory()).set_bits(mask::GLOBAL);
        mmu.access(cpu, VirtualAddress::new(VA), AccessKind::Read, true).unwrap();

        mmu.load_root(cpu, PhysicalAddress::new(ROOT));
        assert_eq!(mmu.tlb_len(cpu), 1);
        mmu.flush(cpu, FlushScope::All);
        assert_eq!(mmu.tlb_len(cpu), 0);
        assert_eq!(mmu.counters(cpu).root_loads, 2);
    }
}
