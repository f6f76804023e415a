//! # Reverse Mappings
//!
//! Every managed physical page has a [`PmapPage`]: a lock, the accumulated
//! referenced/modified bits, and the list of `(pmap, ptp, va)` pairs that
//! map it.
//!
//! ```text
//!  PmapPage ── lock ──► PvHead
//!                        ├─ embedded: Option<PvPair>      first mapping, no allocation
//!                        └─ first ──► node ◄──► node ◄──► node   (pool-backed, doubly linked)
//!                                       │        │
//!  hash[(ptp, va)] ── bucket ──────────►┘        └── hash_next chains per bucket
//! ```
//!
//! The hash exists so that removal given `(ptp, va)` does not scan the
//! page's list. Lock order: page lock, then bucket lock, then the node pool.
//! Nodes are allocated with the page lock dropped, and only once the head
//! turns out to need them.

use crate::pmap::Pmap;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_alloc::{Pool, PoolIdx};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::SpinLock;

const HASH_BUCKETS: usize = 64;

/// One mapping of a managed page.
#[derive(Clone)]
pub(crate) struct PvPair {
    pub pmap: Arc<Pmap>,
    /// Level-1 PTP holding the entry; `None` for the kernel pmap.
    pub ptp: Option<PhysicalAddress>,
    pub va: VirtualAddress,
}

impl PvPair {
    fn is(&self, ptp: Option<PhysicalAddress>, va: VirtualAddress) -> bool {
        self.ptp == ptp && self.va == va
    }
}

fn bucket_of(ptp: Option<PhysicalAddress>, va: VirtualAddress) -> usize {
    let ptp = ptp.map_or(0, PhysicalAddress::frame_number);
    #[allow(clippy::cast_possible_truncation)]
    let h = (ptp ^ (va.as_u64() >> 12)).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 58;
    h as usize % HASH_BUCKETS
}

pub(crate) struct PvNode {
    pair: Option<PvPair>,
    prev: Option<PoolIdx>,
    next: Option<PoolIdx>,
    hash_next: Option<PoolIdx>,
}

impl PvNode {
    const fn vacant() -> Self {
        Self {
            pair: None,
            prev: None,
            next: None,
            hash_next: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct PvHead {
    embedded: Option<PvPair>,
    first: Option<PoolIdx>,
    count: usize,
}

impl PvHead {
    pub const fn count(&self) -> usize {
        self.count
    }
}

/// PV metadata of one managed page.
pub(crate) struct PmapPage {
    pub head: SpinLock<PvHead>,
    attrs: AtomicU64,
}

impl PmapPage {
    fn new() -> Self {
        Self {
            head: SpinLock::new(PvHead::default()),
            attrs: AtomicU64::new(0),
        }
    }

    /// Accumulated `ACCESSED`/`DIRTY` bits.
    pub fn attrs(&self) -> u64 {
        self.attrs.load(Ordering::SeqCst)
    }

    pub fn fold_attrs(&self, bits: u64) {
        use kernel_vmem::mask;
        self.attrs
            .fetch_or(bits & (mask::ACCESSED | mask::DIRTY), Ordering::SeqCst);
    }

    /// Clears `bits`, returning the previous value.
    pub fn clear_attrs(&self, bits: u64) -> u64 {
        self.attrs.fetch_and(!bits, Ordering::SeqCst)
    }
}

/// Spare nodes taken from the pool before any page lock.
#[derive(Default)]
pub(crate) struct PvSpares(Vec<PoolIdx>);

/// A mapping taken off a page, with the node that held it (if any). The
/// node goes back to the pool once the caller has dropped its locks.
pub(crate) struct PvRemoved {
    pub pair: PvPair,
    pub node: Option<PoolIdx>,
}

pub(crate) struct PvTable {
    pages: Box<[PmapPage]>,
    nodes: Pool<PvNode>,
    buckets: Box<[SpinLock<Option<PoolIdx>>]>,
}

impl PvTable {
    pub fn new(managed_frames: usize, capacity: usize) -> Self {
        Self {
            pages: (0..managed_frames).map(|_| PmapPage::new()).collect(),
            nodes: Pool::new(capacity),
            buckets: (0..HASH_BUCKETS).map(|_| SpinLock::new(None)).collect(),
        }
    }

    /// PV metadata of `pa`, if it is a managed page.
    pub fn page(&self, pa: PhysicalAddress) -> Option<&PmapPage> {
        usize::try_from(pa.frame_number())
            .ok()
            .and_then(|i| self.pages.get(i))
    }

    pub fn nodes_in_use(&self) -> usize {
        self.nodes.in_use()
    }

    /// Fills `spares` up to `want` nodes. Returns `false` if the pool ran
    /// dry; nodes taken so far stay in `spares`.
    pub fn reserve(&self, spares: &mut PvSpares, want: usize) -> bool {
        while spares.0.len() < want {
            let Some(idx) = self.nodes.alloc(PvNode::vacant()) else {
                return false;
            };
            spares.0.push(idx);
        }
        true
    }

    /// Returns unused spares and removed nodes to the pool. Call with no
    /// page lock held.
    pub fn release(&self, spares: PvSpares, removed: impl IntoIterator<Item = PoolIdx>) {
        for idx in spares.0.into_iter().chain(removed) {
            drop(self.nodes.free(idx));
        }
    }

    /// Number of nodes a new pair needs on a page with this head.
    pub const fn nodes_needed(head: &PvHead) -> usize {
        match (&head.embedded, head.first) {
            (None, None) => 0,
            (Some(_), _) => 2,
            (None, Some(_)) => 1,
        }
    }

    /// Records `pair` as a mapping of the page owning `head`.
    ///
    /// # Errors
    /// Gives the pair back if `spares` cannot cover it; the caller drops
    /// the page lock, reserves more and retries.
    pub fn enter(
        &self,
        head: &mut PvHead,
        pair: PvPair,
        spares: &mut PvSpares,
    ) -> Result<(), PvPair> {
        let needed = Self::nodes_needed(head);
        if spares.0.len() < needed {
            return Err(pair);
        }
        if needed == 0 {
            head.embedded = Some(pair);
            head.count = 1;
            return Ok(());
        }
        if let Some(embedded) = head.embedded.take() {
            let Some(idx) = spares.0.pop() else {
                unreachable!("spares checked above");
            };
            self.link(head, idx, embedded);
        }
        let Some(idx) = spares.0.pop() else {
            unreachable!("spares checked above");
        };
        self.link(head, idx, pair);
        head.count += 1;
        Ok(())
    }

    fn link(&self, head: &mut PvHead, idx: PoolIdx, pair: PvPair) {
        let bucket = &self.buckets[bucket_of(pair.ptp, pair.va)];
        let mut chain = bucket.lock();
        let old_first = head.first;
        self.nodes.with(idx, |n| {
            n.pair = Some(pair);
            n.prev = None;
            n.next = old_first;
            n.hash_next = *chain;
        });
        if let Some(next) = old_first {
            self.nodes.with(next, |n| n.prev = Some(idx));
        }
        head.first = Some(idx);
        *chain = Some(idx);
    }

    /// Takes the mapping `(ptp, va)` off the page owning `head`.
    pub fn remove(
        &self,
        head: &mut PvHead,
        ptp: Option<PhysicalAddress>,
        va: VirtualAddress,
    ) -> Option<PvRemoved> {
        if head.embedded.as_ref().is_some_and(|p| p.is(ptp, va)) {
            let pair = head.embedded.take()?;
            head.count -= 1;
            return Some(PvRemoved { pair, node: None });
        }

        let bucket = &self.buckets[bucket_of(ptp, va)];
        let mut chain = bucket.lock();
        let mut prev_in_chain: Option<PoolIdx> = None;
        let mut cursor = *chain;
        while let Some(idx) = cursor {
            let (hit, hash_next) = self.nodes.with(idx, |n| {
                (n.pair.as_ref().is_some_and(|p| p.is(ptp, va)), n.hash_next)
            });
            if !hit {
                prev_in_chain = Some(idx);
                cursor = hash_next;
                continue;
            }
            match prev_in_chain {
                Some(p) => self.nodes.with(p, |n| n.hash_next = hash_next),
                None => *chain = hash_next,
            }
            drop(chain);

            let (pair, prev, next) = self.nodes.with(idx, |n| {
                n.hash_next = None;
                (n.pair.take(), n.prev.take(), n.next.take())
            });
            match prev {
                Some(p) => self.nodes.with(p, |n| n.next = next),
                None => head.first = next,
            }
            if let Some(n) = next {
                self.nodes.with(n, |node| node.prev = prev);
            }
            head.count -= 1;
            return pair.map(|pair| PvRemoved {
                pair,
                node: Some(idx),
            });
        }
        None
    }

    /// The first mapping of the page, if any.
    pub fn first(&self, head: &PvHead) -> Option<PvPair> {
        if let Some(pair) = &head.embedded {
            return Some(pair.clone());
        }
        head.first
            .and_then(|idx| self.nodes.with(idx, |n| n.pair.clone()))
    }

    /// Calls `f` for each mapping of the page, stopping at the first error.
    pub fn try_for_each<E>(
        &self,
        head: &PvHead,
        mut f: impl FnMut(&PvPair) -> Result<(), E>,
    ) -> Result<(), E> {
        if let Some(pair) = &head.embedded {
            f(pair)?;
        }
        let mut cursor = head.first;
        while let Some(idx) = cursor {
            let (pair, next) = self.nodes.with(idx, |n| (n.pair.clone(), n.next));
            if let Some(pair) = pair {
                f(&pair)?;
            }
            cursor = next;
        }
        Ok(())
    }

    pub fn contains(&self, head: &PvHead, ptp: Option<PhysicalAddress>, va: VirtualAddress) -> bool {
        self.try_for_each(head, |p| if p.is(ptp, va) { Err(()) } else { Ok(()) })
            .is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmap::PmapId;

    fn pmap(id: u64) -> Arc<Pmap> {
        Arc::new(Pmap::new(PmapId::new(id), PhysicalAddress::new(0x1000), 1))
    }

    fn pair(p: &Arc<Pmap>, ptp: u64, va: u64) -> PvPair {
        PvPair {
            pmap: Arc::clone(p),
            ptp: Some(PhysicalAddress::new(ptp)),
            va: VirtualAddress::new(va),
        }
    }

    fn enter(t: &PvTable, head: &mut PvHead, p: PvPair) {
        let mut spares = PvSpares::default();
        assert!(t.reserve(&mut spares, 2));
        assert!(t.enter(head, p, &mut spares).is_ok());
        t.release(spares, []);
    }

    #[test]
    fn first_mapping_is_embedded() {
        let t = PvTable::new(4, 8);
        let p = pmap(1);
        let mut head = PvHead::default();
        enter(&t, &mut head, pair(&p, 0x8000, 0x1000));
        assert_eq!(head.count(), 1);
        assert_eq!(t.nodes_in_use(), 0);
        assert_eq!(PvTable::nodes_needed(&head), 2);
    }

    #[test]
    fn second_mapping_promotes_the_embedded_pair() {
        let t = PvTable::new(4, 8);
        let p = pmap(1);
        let mut head = PvHead::default();
        enter(&t, &mut head, pair(&p, 0x8000, 0x1000));
        enter(&t, &mut head, pair(&p, 0x8000, 0x2000));
        assert_eq!(head.count(), 2);
        assert_eq!(t.nodes_in_use(), 2);
        assert!(t.contains(&head, Some(PhysicalAddress::new(0x8000)), VirtualAddress::new(0x1000)));

        enter(&t, &mut head, pair(&p, 0x9000, 0x3000));
        assert_eq!(t.nodes_in_use(), 3);
    }

    #[test]
    fn removal_unlinks_from_page_and_hash() {
        let t = PvTable::new(4, 8);
        let p = pmap(1);
        let mut head = PvHead::default();
        for va in [0x1000, 0x2000, 0x3000] {
            enter(&t, &mut head, pair(&p, 0x8000, va));
        }
        let ptp = Some(PhysicalAddress::new(0x8000));
        let r = t.remove(&mut head, ptp, VirtualAddress::new(0x2000)).unwrap();
        assert_eq!(r.pair.va, VirtualAddress::new(0x2000));
        t.release(PvSpares::default(), r.node);
        assert!(t.remove(&mut head, ptp, VirtualAddress::new(0x2000)).is_none());

        let mut seen = Vec::new();
        t.try_for_each(&head, |p| {
            seen.push(p.va.as_u64());
            Ok::<(), ()>(())
        })
        .unwrap();
        seen.sort_unstable();
        assert_eq!(seen, [0x1000, 0x3000]);

        for va in [0x1000, 0x3000] {
            let r = t.remove(&mut head, ptp, VirtualAddress::new(va)).unwrap();
            t.release(PvSpares::default(), r.node);
        }
        assert_eq!(head.count(), 0);
        assert_eq!(t.nodes_in_use(), 0);
        assert!(t.first(&head).is_none());
    }

    #[test]
    fn insufficient_spares_hand_the_pair_back() {
        let t = PvTable::new(4, 8);
        let p = pmap(1);
        let mut head = PvHead::default();
        enter(&t, &mut head, pair(&p, 0x8000, 0x1000));
        let mut none = PvSpares::default();
        assert!(t.enter(&mut head, pair(&p, 0x8000, 0x2000), &mut none).is_err());
        assert_eq!(head.count(), 1);
    }

    #[test]
    fn unmanaged_frames_have_no_page() {
        let t = PvTable::new(4, 8);
        assert!(t.page(PhysicalAddress::new(0x3000)).is_some());
        assert!(t.page(PhysicalAddress::new(0x4000)).is_none());
    }
}
