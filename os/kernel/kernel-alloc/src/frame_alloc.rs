//! Physical frame allocation: the [`FrameAlloc`] trait and a free-list
//! allocator over one contiguous frame range.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K};
use kernel_sync::SpinLock;
use log::trace;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("no free frames")]
    Exhausted,
    #[error("frame {0} is outside the managed range")]
    NotManaged(PhysicalAddress),
    #[error("frame {0} freed twice")]
    DoubleFree(PhysicalAddress),
}

/// A source of 4 KiB physical frames.
pub trait FrameAlloc: Send + Sync {
    /// Allocates one frame. Contents are unspecified.
    ///
    /// # Errors
    /// [`FrameAllocError::Exhausted`] when no frame is available.
    fn alloc_4k(&self) -> Result<PhysicalAddress, FrameAllocError>;

    /// Returns a frame obtained from [`alloc_4k`](Self::alloc_4k).
    ///
    /// # Errors
    /// If `pa` does not belong to this allocator or is not allocated.
    fn free_4k(&self, pa: PhysicalAddress) -> Result<(), FrameAllocError>;
}

struct Inner {
    free: Vec<u64>,
    allocated: Vec<bool>,
}

/// Stack-of-free-frames allocator over `[start, end)`.
pub struct FreeListFrameAlloc {
    start: PhysicalAddress,
    end: PhysicalAddress,
    inner: SpinLock<Inner>,
    fail_next: AtomicUsize,
}

impl FreeListFrameAlloc {
    /// Manages the frames in `[start, end)`; both must be frame aligned.
    ///
    /// Frames are handed out in ascending address order until the first
    /// free.
    ///
    /// # Panics
    /// If the bounds are misaligned or reversed.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        assert!(start.is_aligned::<Size4K>() && end.is_aligned::<Size4K>());
        assert!(start <= end, "reversed frame range");
        let frames = (end.frame_number() - start.frame_number()) as usize;
        let free = (start.frame_number()..end.frame_number()).rev().collect();
        Self {
            start,
            end,
            inner: SpinLock::new(Inner {
                free,
                allocated: vec![false; frames],
            }),
            fail_next: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn range(&self) -> (PhysicalAddress, PhysicalAddress) {
        (self.start, self.end)
    }

    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa >= self.start && pa < self.end
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn capacity(&self) -> usize {
        ((self.end.as_u64() - self.start.as_u64()) / Size4K::SIZE) as usize
    }

    /// Makes the next `count` allocations fail.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn slot(&self, pa: PhysicalAddress) -> Result<usize, FrameAllocError> {
        if !self.contains(pa) || !pa.is_aligned::<Size4K>() {
            return Err(FrameAllocError::NotManaged(pa));
        }
        Ok((pa.frame_number() - self.start.frame_number()) as usize)
    }

    fn injected_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl FrameAlloc for FreeListFrameAlloc {
    fn alloc_4k(&self) -> Result<PhysicalAddress, FrameAllocError> {
        if self.injected_failure() {
            trace!("frame allocation failed by request");
            return Err(FrameAllocError::Exhausted);
        }
        let mut inner = self.inner.lock();
        let frame = inner.free.pop().ok_or(FrameAllocError::Exhausted)?;
        let pa = PhysicalAddress::from_frame_number(frame);
        let slot = self.slot(pa)?;
        inner.allocated[slot] = true;
        Ok(pa)
    }

    fn free_4k(&self, pa: PhysicalAddress) -> Result<(), FrameAllocError> {
        let slot = self.slot(pa)?;
        let mut inner = self.inner.lock();
        if !inner.allocated[slot] {
            return Err(FrameAllocError::DoubleFree(pa));
        }
        inner.allocated[slot] = false;
        inner.free.push(pa.frame_number());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc() -> FreeListFrameAlloc {
        FreeListFrameAlloc::new(PhysicalAddress::new(0x10_000), PhysicalAddress::new(0x14_000))
    }

    #[test]
    fn hands_out_ascending_then_reuses_freed() {
        let a = alloc();
        assert_eq!(a.capacity(), 4);
        let f0 = a.alloc_4k().unwrap();
        let f1 = a.alloc_4k().unwrap();
        assert_eq!(f0.as_u64(), 0x10_000);
        assert_eq!(f1.as_u64(), 0x11_000);
        a.free_4k(f0).unwrap();
        assert_eq!(a.alloc_4k().unwrap(), f0);
    }

    #[test]
    fn exhaustion_and_injection() {
        let a = alloc();
        a.fail_next(1);
        assert_eq!(a.alloc_4k(), Err(FrameAllocError::Exhausted));
        for _ in 0..4 {
            a.alloc_4k().unwrap();
        }
        assert_eq!(a.alloc_4k(), Err(FrameAllocError::Exhausted));
        assert_eq!(a.free_count(), 0);
    }

    #[test]
    fn rejects_foreign_and_double_frees() {
        let a = alloc();
        let f = a.alloc_4k().unwrap();
        a.free_4k(f).unwrap();
        assert_eq!(a.free_4k(f), Err(FrameAllocError::DoubleFree(f)));
        let foreign = PhysicalAddress::new(0x9000);
        assert_eq!(a.free_4k(foreign), Err(FrameAllocError::NotManaged(foreign)));
    }
}
