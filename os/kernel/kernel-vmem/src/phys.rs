//! # Physical Memory
//!
//! A flat array of 4 KiB frames made of atomic words. Page tables live in
//! frames like any other page, so every entry can be read, swapped or
//! compare-and-swapped by physical address without a virtual window.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::{ENTRIES_PER_TABLE, PageSize, PhysicalAddress, Size4K};

/// One 4 KiB frame: 512 atomic 64-bit words.
#[repr(C, align(4096))]
pub struct Frame {
    words: [AtomicU64; ENTRIES_PER_TABLE],
}

impl Frame {
    fn zeroed() -> Self {
        Self {
            words: [const { AtomicU64::new(0) }; ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub fn word(&self, index: usize) -> &AtomicU64 {
        &self.words[index]
    }

    pub fn zero(&self) {
        for w in &self.words {
            w.store(0, Ordering::Relaxed);
        }
    }

    pub fn copy_from(&self, src: &Self) {
        for (d, s) in self.words.iter().zip(src.words.iter()) {
            d.store(s.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    /// Returns `true` if every word is zero.
    pub fn is_zero(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Relaxed) == 0)
    }
}

const _: () = assert!(size_of::<Frame>() as u64 == Size4K::SIZE);

/// Simulated RAM: frames `0..frame_count`, physical addresses
/// `0..frame_count * 4096`.
pub struct PhysMemory {
    frames: Box<[Frame]>,
}

impl PhysMemory {
    #[must_use]
    pub fn new(frame_count: usize) -> Self {
        let frames: Vec<Frame> = (0..frame_count).map(|_| Frame::zeroed()).collect();
        Self {
            frames: frames.into_boxed_slice(),
        }
    }

    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Exclusive end of RAM.
    #[inline]
    #[must_use]
    pub fn end(&self) -> PhysicalAddress {
        PhysicalAddress::from_frame_number(self.frames.len() as u64)
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa < self.end()
    }

    /// The frame containing `pa`, if it is RAM.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn frame(&self, pa: PhysicalAddress) -> Option<&Frame> {
        self.frames.get(pa.frame_number() as usize)
    }

    /// The frame containing `pa`.
    ///
    /// # Panics
    /// If `pa` is not RAM. Page tables and data pages handed to the pmap
    /// always are; anything else is a corrupted entry.
    #[inline]
    #[must_use]
    pub fn frame_at(&self, pa: PhysicalAddress) -> &Frame {
        match self.frame(pa) {
            Some(f) => f,
            None => panic!("physical address {pa} is not backed by RAM"),
        }
    }

    /// The 64-bit word at `pa` (8-byte aligned).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn word(&self, pa: PhysicalAddress) -> &AtomicU64 {
        debug_assert_eq!(pa.as_u64() % 8, 0, "unaligned word access");
        self.frame_at(pa).word((pa.offset::<Size4K>() / 8) as usize)
    }

    pub fn read_u64(&self, pa: PhysicalAddress) -> u64 {
        self.word(pa).load(Ordering::SeqCst)
    }

    pub fn write_u64(&self, pa: PhysicalAddress, value: u64) {
        self.word(pa).store(value, Ordering::SeqCst);
    }

    pub fn zero_frame(&self, pa: PhysicalAddress) {
        self.frame_at(pa).zero();
    }

    pub fn copy_frame(&self, src: PhysicalAddress, dst: PhysicalAddress) {
        self.frame_at(dst).copy_from(self.frame_at(src));
    }
}
