//! # Memory Layout
//!
//! Constants describing the 4-level x86-64 address space as the pmap sees it.

use kernel_memory_addresses::{ENTRIES_PER_TABLE, level_span};

/// Bytes in a base page.
pub const PAGE_SIZE: u64 = 4096;

/// Depth of the translation tree.
pub const PTP_LEVELS: u8 = 4;

/// Exclusive end of the user half (top-level slot 256).
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// First address of the kernel half (canonical image of slot 256).
pub const KERNEL_SPACE_START: u64 = 0xFFFF_8000_0000_0000;

/// First top-level slot that belongs to the kernel.
pub const PDIR_SLOT_KERN: usize = 256;

/// Number of top-level slots the kernel range may occupy.
pub const KERNEL_L4_SLOTS: usize = 16;

/// Exclusive upper bound the kernel range may ever grow to.
pub const KERNEL_SPACE_LIMIT: u64 = KERNEL_SPACE_START + KERNEL_L4_SLOTS as u64 * level_span(4);

/// Granularity the kernel range grows in (one level-2 entry).
pub const KERNEL_GROW_GRANULE: u64 = level_span(2);

/// Ranges longer than this many pages are invalidated with a full flush.
pub const SHOOTDOWN_FULL_FLUSH_PAGES: u64 = 32;

/// Upper bound on processors; CPU sets are 64-bit masks.
pub const MAX_CPUS: usize = 64;

/// Returns `true` if `va` lies in the user half.
#[inline]
#[must_use]
pub const fn is_user_address(va: u64) -> bool {
    va < USERSPACE_END
}

/// Returns `true` if `va` lies in the kernel range the pmap manages.
#[inline]
#[must_use]
pub const fn is_kernel_address(va: u64) -> bool {
    va >= KERNEL_SPACE_START && va < KERNEL_SPACE_LIMIT
}

const _: () = {
    assert!(USERSPACE_END == PDIR_SLOT_KERN as u64 * level_span(4));
    assert!(PDIR_SLOT_KERN + KERNEL_L4_SLOTS <= ENTRIES_PER_TABLE);
    assert!(KERNEL_SPACE_LIMIT > KERNEL_SPACE_START);
    assert!(KERNEL_GROW_GRANULE.is_power_of_two());
    assert!(MAX_CPUS <= u64::BITS as usize);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halves_do_not_overlap() {
        assert!(is_user_address(USERSPACE_END - PAGE_SIZE));
        assert!(!is_user_address(KERNEL_SPACE_START));
        assert!(is_kernel_address(KERNEL_SPACE_START));
        assert!(!is_kernel_address(KERNEL_SPACE_LIMIT));
    }
}
