//! Processor identity and processor sets.

use crate::memory::MAX_CPUS;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Index of a processor, `0..MAX_CPUS`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CpuId(u8);

impl CpuId {
    /// The bootstrap processor.
    pub const BSP: Self = Self(0);

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(index: usize) -> Self {
        assert!(index < MAX_CPUS, "CPU index out of range");
        Self(index as u8)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// The singleton set containing this CPU.
    #[inline]
    #[must_use]
    pub const fn mask(self) -> CpuMask {
        CpuMask(1 << self.0)
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// A set of processors.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const EMPTY: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & cpu.mask().0 != 0
    }

    #[inline]
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    #[must_use]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterates the members in ascending order.
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let mut rest = self.0;
        core::iter::from_fn(move || {
            if rest == 0 {
                return None;
            }
            let i = rest.trailing_zeros() as usize;
            rest &= rest - 1;
            Some(CpuId::new(i))
        })
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({:#b})", self.0)
    }
}

/// A [`CpuMask`] that can be updated concurrently.
#[derive(Default)]
pub struct AtomicCpuMask(AtomicU64);

impl AtomicCpuMask {
    #[must_use]
    pub const fn new(mask: CpuMask) -> Self {
        Self(AtomicU64::new(mask.0))
    }

    #[inline]
    pub fn load(&self) -> CpuMask {
        CpuMask(self.0.load(Ordering::SeqCst))
    }

    /// Adds `cpu`; returns the previous set.
    #[inline]
    pub fn insert(&self, cpu: CpuId) -> CpuMask {
        CpuMask(self.0.fetch_or(cpu.mask().0, Ordering::SeqCst))
    }

    /// Removes `cpu`; returns the previous set.
    #[inline]
    pub fn remove(&self, cpu: CpuId) -> CpuMask {
        CpuMask(self.0.fetch_and(!cpu.mask().0, Ordering::SeqCst))
    }

    #[inline]
    pub fn contains(&self, cpu: CpuId) -> bool {
        self.load().contains(cpu)
    }
}

impl fmt::Debug for AtomicCpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_iteration_is_ascending() {
        let m = CpuId::new(5).mask().union(CpuId::new(1).mask()).union(CpuId::new(63).mask());
        let got: Vec<_> = m.iter().map(CpuId::index).collect();
        assert_eq!(got, [1, 5, 63]);
        assert_eq!(m.len(), 3);
        assert!(m.without(CpuId::new(5).mask()).contains(CpuId::new(1)));
    }

    #[test]
    fn atomic_insert_remove() {
        let m = AtomicCpuMask::default();
        assert!(m.insert(CpuId::new(2)).is_empty());
        assert!(m.contains(CpuId::new(2)));
        assert!(m.remove(CpuId::new(2)).contains(CpuId::new(2)));
        assert!(m.load().is_empty());
    }
}
