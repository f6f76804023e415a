//! # TLB Shootdown
//!
//! A mapping change that may leave a stale translation cached on another
//! CPU is followed by a shootdown. Two kinds of mailbox carry the range:
//!
//! ```text
//!  kernel pmap                         user pmap
//!  ───────────                         ─────────
//!  global mailbox                      one mailbox per target CPU
//!    head += #targets (CAS)              own head += 1 per target
//!    broadcast IPI to every              target.owner: 0 ─CAS─► sender
//!    other running CPU                   multicast IPI to that CPU
//!  handler: flush, global tail += 1    handler: flush, sender tail += 1,
//!                                               target.owner = 0
//! ```
//!
//! A mailbox is drained when `head == tail`. [`PmapSystem::shootwait`]
//! spins until the mailboxes the CPU filled are drained. Every spin loop
//! here services the spinning CPU's own pending interrupts.
//!
//! A target in `LAZY` state does not flush for a user range. It drops out
//! of the pmap's active set instead, and reloads its root on the next
//! [`load`](PmapSystem::load).

use crate::PmapSystem;
use crate::config::IpiDelivery;
use crate::cpu::{CpuInfo, IPI_BROADCAST, IPI_MULTICAST, TlbState};
use crate::pmap::Pmap;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use crossbeam_utils::Backoff;
use kernel_info::cpu::{CpuId, CpuMask};
use kernel_info::memory::{PAGE_SIZE, SHOOTDOWN_FULL_FLUSH_PAGES, USERSPACE_END};
use kernel_memory_addresses::{Size2M, VirtualAddress};
use kernel_vmem::{FlushScope, mask};
use log::trace;

const ALL: u64 = u64::MAX;

/// Range of a shootdown.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Range {
    All,
    Span {
        start: VirtualAddress,
        end: VirtualAddress,
    },
}

impl Range {
    pub const fn page(va: VirtualAddress) -> Self {
        Self::Span {
            start: va,
            end: va.wrapping_add(PAGE_SIZE),
        }
    }

    pub const fn span(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self::Span { start, end }
    }

    /// Collapses long ranges into a full flush and aligns large pages.
    fn normalize(self, pte: u64) -> Self {
        let Self::Span { mut start, end } = self else {
            return self;
        };
        if pte & mask::LARGE_PAGE != 0 {
            start = start.trunc::<Size2M>();
        }
        let end = if end.as_u64() <= start.as_u64() {
            start.wrapping_add(PAGE_SIZE)
        } else {
            end
        };
        if (end - start) / PAGE_SIZE > SHOOTDOWN_FULL_FLUSH_PAGES {
            Self::All
        } else {
            Self::Span { start, end }
        }
    }

    /// Whether the range touches the kernel half.
    const fn is_kernel(self) -> bool {
        match self {
            Self::All => true,
            Self::Span { start, .. } => start.as_u64() >= USERSPACE_END,
        }
    }

    const fn encode(self) -> (u64, u64) {
        match self {
            Self::All => (ALL, ALL),
            Self::Span { start, end } => (start.as_u64(), end.as_u64()),
        }
    }

    const fn decode(addr1: u64, addr2: u64) -> Self {
        if addr1 == ALL {
            Self::All
        } else {
            Self::Span {
                start: VirtualAddress::new(addr1),
                end: VirtualAddress::new(addr2),
            }
        }
    }
}

/// A shootdown mailbox. `owner` is zero when free, else the sender's CPU
/// index plus one. Kept in a [`CachePadded`](crossbeam_utils::CachePadded)
/// by its owners.
#[derive(Default)]
pub(crate) struct Mailbox {
    head: AtomicU64,
    tail: AtomicU64,
    owner: AtomicUsize,
    addr1: AtomicU64,
    addr2: AtomicU64,
    global: AtomicBool,
}

impl Mailbox {
    fn is_drained(&self) -> bool {
        self.head.load(Ordering::SeqCst) == self.tail.load(Ordering::SeqCst)
    }

    fn post(&self, range: Range, global: bool) {
        let (a1, a2) = range.encode();
        self.addr1.store(a1, Ordering::SeqCst);
        self.addr2.store(a2, Ordering::SeqCst);
        self.global.store(global, Ordering::SeqCst);
    }

    fn read(&self) -> (Range, bool) {
        let range = Range::decode(
            self.addr1.load(Ordering::SeqCst),
            self.addr2.load(Ordering::SeqCst),
        );
        (range, self.global.load(Ordering::SeqCst))
    }
}

const fn owner_tag(cpu: CpuId) -> usize {
    cpu.index() + 1
}

impl PmapSystem {
    /// Invalidates `range` of `pmap` wherever it may be cached.
    ///
    /// `pte` is the old entry (or the OR of all old entries); its large-page
    /// and global bits select how the range is invalidated. Returns without
    /// waiting for remote CPUs; see [`shootwait`](Self::shootwait).
    pub(crate) fn shootdown(&self, cpu: CpuId, pmap: &Pmap, range: Range, pte: u64) {
        if pmap.is_doomed() {
            return;
        }
        let me = self.cpu(cpu);
        let _preempt = me.preempt.disable();
        let range = range.normalize(pte);
        let global = self.config().global_pages && pte & mask::GLOBAL != 0;
        let kernel_range = range.is_kernel();

        if self.cpus().len() > 1 {
            if pmap.is_kernel() {
                self.broadcast(me, range, global);
            } else {
                self.multicast(me, pmap, range, kernel_range);
            }
        }

        if pmap.is_active_on(cpu, kernel_range) {
            self.invalidate(cpu, range, global);
        }
    }

    fn broadcast(&self, me: &CpuInfo, range: Range, global: bool) {
        let targets = self.running_cpus().without(me.id().mask());
        if targets.is_empty() {
            return;
        }
        let mb = &self.broadcast;
        let backoff = Backoff::new();
        loop {
            let head = mb.head.load(Ordering::SeqCst);
            if head != mb.tail.load(Ordering::SeqCst) {
                self.service_interrupts(me.id());
                backoff.spin();
                continue;
            }
            let claimed = mb.head.compare_exchange(
                head,
                head + u64::from(targets.len()),
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            if claimed.is_ok() {
                break;
            }
        }
        mb.owner.store(owner_tag(me.id()), Ordering::SeqCst);
        mb.post(range, global);
        trace!("{}: broadcast shootdown {range:?} to {targets:?}", me.id());
        me.need_tlbwait.store(true, Ordering::SeqCst);
        for target in targets.iter() {
            self.send_ipi(target, IPI_BROADCAST);
        }
    }

    fn multicast(&self, me: &CpuInfo, pmap: &Pmap, range: Range, kernel_range: bool) {
        let mut targets = pmap.cpus.load();
        if kernel_range {
            targets = targets.union(pmap.kernel_cpus.load());
        }
        let targets = targets
            .without(me.id().mask())
            .iter()
            .filter(|&t| self.cpu(t).is_running() && pmap.is_active_on(t, kernel_range));

        let mut sent = CpuMask::EMPTY;
        for target in targets {
            let ci = self.cpu(target);
            me.mailbox.head.fetch_add(1, Ordering::SeqCst);
            let backoff = Backoff::new();
            while ci
                .mailbox
                .owner
                .compare_exchange(0, owner_tag(me.id()), Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                self.service_interrupts(me.id());
                backoff.spin();
            }
            trace!("{}: claimed mailbox of {target}", me.id());
            ci.mailbox.post(range, false);
            me.need_tlbwait.store(true, Ordering::SeqCst);
            self.send_ipi(target, IPI_MULTICAST);
            sent = sent.union(target.mask());
        }
        if !sent.is_empty() {
            trace!("{}: shootdown {range:?} of {:?} to {sent:?}", me.id(), pmap.id());
        }
    }

    fn invalidate(&self, cpu: CpuId, range: Range, global: bool) {
        let mmu = self.mmu();
        match range {
            Range::All => mmu.flush(
                cpu,
                if global {
                    FlushScope::All
                } else {
                    FlushScope::NonGlobal
                },
            ),
            Range::Span { start, end } => {
                let mut va = start;
                while va.as_u64() < end.as_u64() {
                    mmu.invalidate_page(cpu, va);
                    let next = va.wrapping_add(PAGE_SIZE);
                    if next.as_u64() < va.as_u64() {
                        break;
                    }
                    va = next;
                }
            }
        }
    }

    /// Waits until every shootdown `cpu` issued has been acknowledged.
    pub fn shootwait(&self, cpu: CpuId) {
        let me = self.cpu(cpu);
        if !me.need_tlbwait.swap(false, Ordering::SeqCst) {
            return;
        }
        let backoff = Backoff::new();
        while self.broadcast.owner.load(Ordering::SeqCst) == owner_tag(cpu)
            && !self.broadcast.is_drained()
        {
            self.service_interrupts(cpu);
            backoff.spin();
        }
        backoff.reset();
        while !me.mailbox.is_drained() {
            self.service_interrupts(cpu);
            backoff.spin();
        }
    }

    fn send_ipi(&self, target: CpuId, vector: u8) {
        match self.config().ipi_delivery {
            IpiDelivery::Immediate => self.handle_ipi(target, vector),
            IpiDelivery::Queued => {
                self.cpu(target)
                    .pending_ipis
                    .fetch_or(vector, Ordering::SeqCst);
            }
        }
    }

    /// Runs the handlers of all interrupts pending on `cpu`.
    pub fn service_interrupts(&self, cpu: CpuId) {
        let pending = self.cpu(cpu).pending_ipis.swap(0, Ordering::SeqCst);
        for vector in [IPI_MULTICAST, IPI_BROADCAST] {
            if pending & vector != 0 {
                self.handle_ipi(cpu, vector);
            }
        }
    }

    fn handle_ipi(&self, cpu: CpuId, vector: u8) {
        let me = self.cpu(cpu);
        if vector == IPI_BROADCAST {
            let (range, global) = self.broadcast.read();
            trace!("{cpu}: broadcast IPI {range:?}");
            self.invalidate(cpu, range, global);
            self.broadcast.tail.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let sender = me.mailbox.owner.load(Ordering::SeqCst);
        assert_ne!(sender, 0, "{cpu}: multicast IPI with empty mailbox");
        let (range, global) = me.mailbox.read();
        let user_range = !matches!(range, Range::Span { start, .. } if start.as_u64() >= USERSPACE_END);
        if me.tlb_state() == TlbState::Lazy && user_range {
            // Stop receiving user shootdowns; the next load reloads the root.
            me.pmap.lock().cpus.remove(cpu);
            trace!("{cpu}: lazy, dropped out instead of flushing {range:?}");
        } else {
            trace!("{cpu}: multicast IPI {range:?}");
            self.invalidate(cpu, range, global);
        }
        me.mailbox.owner.store(0, Ordering::SeqCst);
        self.cpu(CpuId::new(sender - 1))
            .mailbox
            .tail
            .fetch_add(1, Ordering::SeqCst);
    }

    fn running_cpus(&self) -> CpuMask {
        self.cpus()
            .filter(|ci| ci.is_running())
            .fold(CpuMask::EMPTY, |m, ci| m.union(ci.id().mask()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_ranges_become_full_flushes() {
        let start = VirtualAddress::new(0x1000);
        let r = Range::span(start, start + 32 * PAGE_SIZE).normalize(0);
        assert_eq!(r, Range::span(start, start + 32 * PAGE_SIZE));
        let r = Range::span(start, start + 33 * PAGE_SIZE).normalize(0);
        assert_eq!(r, Range::All);
    }

    #[test]
    fn large_pages_align_down() {
        let r = Range::page(VirtualAddress::new(0x20_3000)).normalize(mask::LARGE_PAGE);
        let Range::Span { start, .. } = r else {
            panic!("expected a span");
        };
        assert_eq!(start, VirtualAddress::new(0x20_0000));
    }

    #[test]
    fn mailbox_encoding() {
        let mb = Mailbox::default();
        mb.post(Range::All, true);
        assert_eq!(mb.read(), (Range::All, true));
        let r = Range::page(VirtualAddress::new(0x4000));
        mb.post(r, false);
        assert_eq!(mb.read(), (r, false));
        assert!(mb.is_drained());
    }

    #[test]
    fn mailboxes_do_not_share_cache_lines() {
        use crossbeam_utils::CachePadded;
        assert!(align_of::<CachePadded<Mailbox>>() >= 64);
        let sys = PmapSystem::bootstrap(crate::MachineConfig::new(2));
        let a = core::ptr::from_ref(&*sys.cpu(CpuId::BSP).mailbox) as usize;
        let b = core::ptr::from_ref(&*sys.cpu(CpuId::new(1)).mailbox) as usize;
        assert!(a.abs_diff(b) >= 64);
    }
}
