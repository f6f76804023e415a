use crate::{BITS_PER_LEVEL, PageSize, level_shift};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Virtual memory address.
///
/// Values are expected to be canonical (bits 63..48 equal to bit 47);
/// [`canonical`](Self::canonical) builds one from a raw 48-bit value.
/// Arithmetic wraps, so the top of the address space can be expressed as
/// an exclusive end without overflow panics.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::canonical(0x8000_0000_0000);
/// assert_eq!(va.as_u64(), 0xFFFF_8000_0000_0000);
/// assert!(va.is_canonical());
/// assert_eq!(VirtualAddress::new(0x1234).round_up::<Size4K>().as_u64(), 0x2000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Sign-extends bit 47 into the upper 16 bits.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub const fn canonical(raw: u64) -> Self {
        Self((((raw << 16) as i64) >> 16) as u64)
    }

    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        Self::canonical(self.0).0 == self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The table index this address selects at `level` (1..=4).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn table_index(self, level: u8) -> usize {
        ((self.0 >> level_shift(level)) & ((1 << BITS_PER_LEVEL) - 1)) as usize
    }

    /// Rounds down to a boundary of size `S`.
    #[inline]
    #[must_use]
    pub const fn trunc<S: PageSize>(self) -> Self {
        Self(self.0 & !S::MASK)
    }

    /// Rounds up to a boundary of size `S`.
    #[inline]
    #[must_use]
    pub const fn round_up<S: PageSize>(self) -> Self {
        Self(self.0.wrapping_add(S::MASK) & !S::MASK)
    }

    /// Rounds down to a multiple of `span` (power of two).
    #[inline]
    #[must_use]
    pub const fn trunc_to(self, span: u64) -> Self {
        debug_assert!(span.is_power_of_two());
        Self(self.0 & !(span - 1))
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u64 {
        self.0 & S::MASK
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.offset::<S>() == 0
    }

    #[inline]
    #[must_use]
    pub const fn wrapping_add(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        self.wrapping_add(rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        *self = self.wrapping_add(rhs);
    }
}

/// Distance in bytes between two addresses.
impl Sub for VirtualAddress {
    type Output = u64;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Size2M, Size4K};

    #[test]
    fn indices_of_user_address() {
        let va = VirtualAddress::new(0x0000_0040_2060_3123);
        assert_eq!(va.table_index(4), 0);
        assert_eq!(va.table_index(3), 256);
        assert_eq!(va.table_index(2), 0x103);
        assert_eq!(va.table_index(1), 3);
        assert_eq!(va.offset::<Size4K>(), 0x123);

        let va = VirtualAddress::new(0x0000_0000_4060_3123);
        assert_eq!(va.table_index(3), 1);
        assert_eq!(va.table_index(2), 3);
    }

    #[test]
    fn canonical_sign_extension() {
        assert_eq!(VirtualAddress::canonical(0x7FFF_FFFF_F000).as_u64(), 0x7FFF_FFFF_F000);
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
        assert!(VirtualAddress::new(0xFFFF_FFFF_FFFF_F000).is_canonical());
    }

    #[test]
    fn rounding_at_the_top_wraps() {
        let top = VirtualAddress::new(0xFFFF_FFFF_FFE0_0001);
        assert_eq!(top.round_up::<Size2M>().as_u64(), 0);
        assert_eq!(top.trunc::<Size2M>().as_u64(), 0xFFFF_FFFF_FFE0_0000);
    }
}
