//! Mapping operations.

mod attrs;
mod enter;
mod kernel;
mod protect;
mod query;
mod remove;

use crate::pmap::Pmap;
use kernel_info::memory::{is_kernel_address, is_user_address};
use kernel_memory_addresses::{Size4K, VirtualAddress};

/// Checks that `[sva, eva)` is page aligned and belongs to `pmap`'s half.
fn check_range(op: &str, pmap: &Pmap, sva: VirtualAddress, eva: VirtualAddress) {
    assert!(
        sva.is_aligned::<Size4K>() && eva.is_aligned::<Size4K>(),
        "{op}: unaligned range {sva}..{eva}"
    );
    assert!(sva.as_u64() <= eva.as_u64(), "{op}: reversed range {sva}..{eva}");
    if sva == eva {
        return;
    }
    let last = eva.as_u64() - 1;
    let ok = if pmap.is_kernel() {
        is_kernel_address(sva.as_u64()) && is_kernel_address(last)
    } else {
        is_user_address(last)
    };
    assert!(ok, "{op}: {sva}..{eva} outside the address space of {:?}", pmap.id());
}
