//! Fixed-capacity object pool addressed by index. Taking a slot never
//! allocates, so it is safe with spin locks held.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_sync::SpinLock;

/// Handle to an object stored in a [`Pool`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PoolIdx(u32);

impl PoolIdx {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

struct Slots<T> {
    objects: Vec<Option<T>>,
    free: Vec<u32>,
}

/// Fixed-capacity object slab.
///
/// All backing storage is reserved in [`new`](Self::new); afterwards
/// [`alloc`](Self::alloc) and [`free`](Self::free) only move indices
/// around, so they are safe to call with other spin locks held.
pub struct Pool<T> {
    slots: SpinLock<Slots<T>>,
    fail_next: AtomicUsize,
}

impl<T> Pool<T> {
    /// # Panics
    /// If `capacity` exceeds `u32::MAX`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(capacity: usize) -> Self {
        assert!(u32::try_from(capacity).is_ok(), "pool capacity exceeds u32");
        let cap = capacity as u32;
        let mut objects = Vec::with_capacity(capacity);
        objects.resize_with(capacity, || None);
        Self {
            slots: SpinLock::new(Slots {
                objects,
                free: (0..cap).rev().collect(),
            }),
            fail_next: AtomicUsize::new(0),
        }
    }

    /// Stores `value`; `None` when the pool is full.
    pub fn alloc(&self, value: T) -> Option<PoolIdx> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return None;
        }
        let mut slots = self.slots.lock();
        let i = slots.free.pop()?;
        slots.objects[i as usize] = Some(value);
        Some(PoolIdx(i))
    }

    /// Removes and returns the object at `idx`.
    ///
    /// # Panics
    /// If `idx` is not live.
    pub fn free(&self, idx: PoolIdx) -> T {
        let mut slots = self.slots.lock();
        let value = slots.objects[idx.index()]
            .take()
            .unwrap_or_else(|| panic!("pool: {idx:?} freed twice"));
        slots.free.push(idx.0);
        value
    }

    /// Runs `f` on the object at `idx`.
    ///
    /// # Panics
    /// If `idx` is not live.
    pub fn with<R>(&self, idx: PoolIdx, f: impl FnOnce(&mut T) -> R) -> R {
        let mut slots = self.slots.lock();
        match slots.objects[idx.index()].as_mut() {
            Some(obj) => f(obj),
            None => panic!("pool: {idx:?} is not allocated"),
        }
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        let slots = self.slots.lock();
        slots.objects.len() - slots.free.len()
    }

    /// Makes the next `count` allocations fail.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_reuse() {
        let p = Pool::new(2);
        let a = p.alloc("a").unwrap();
        let b = p.alloc("b").unwrap();
        assert!(p.alloc("c").is_none());
        assert_eq!(p.in_use(), 2);
        assert_eq!(p.free(a), "a");
        p.with(b, |v| *v = "B");
        assert_eq!(p.free(b), "B");
        assert_eq!(p.in_use(), 0);
    }

    #[test]
    fn injected_failures_are_consumed() {
        let p = Pool::new(4);
        p.fail_next(2);
        assert!(p.alloc(1).is_none());
        assert!(p.alloc(2).is_none());
        assert!(p.alloc(3).is_some());
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_panics() {
        let p = Pool::new(1);
        let a = p.alloc(()).unwrap();
        p.free(a);
        p.free(a);
    }
}
