//! # MMU Interface
//!
//! The pmap never touches translation hardware directly. Everything it
//! needs from the processor goes through [`Mmu`]:
//!
//! | Method | x86 equivalent |
//! |--------|----------------|
//! | [`store_entry`](Mmu::store_entry) | plain store to a PTE/PDE |
//! | [`invalidate_page`](Mmu::invalidate_page) | `invlpg` |
//! | [`flush`](Mmu::flush) | `mov cr3, cr3` / toggling `CR4.PGE` |
//! | [`load_root`](Mmu::load_root) | `mov cr3, root` |
//!
//! A bare-metal implementation issues the instructions on the calling
//! processor; a paravirtualized one queues hypercalls. [`SimMmu`](crate::SimMmu)
//! models the hardware in software so the pmap can run hosted.

use crate::table::PteSlot;
use kernel_info::cpu::CpuId;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Which TLB entries a flush drops.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlushScope {
    /// Everything except global translations.
    NonGlobal,
    /// Everything, including global translations.
    All,
}

/// Translation hardware as seen by one kernel.
///
/// All TLB methods act on the TLB of `cpu`, which must be the calling
/// processor on real hardware.
pub trait Mmu: Send + Sync {
    /// Writes a page-table entry, returning the previous value.
    #[inline]
    fn store_entry(&self, slot: PteSlot<'_>, value: u64) -> u64 {
        slot.swap(value)
    }

    /// Drops any cached translation of the page containing `va`.
    fn invalidate_page(&self, cpu: CpuId, va: VirtualAddress);

    /// Drops cached translations according to `scope`.
    fn flush(&self, cpu: CpuId, scope: FlushScope);

    /// Installs `root` as the translation root; implies a non-global flush.
    fn load_root(&self, cpu: CpuId, root: PhysicalAddress);

    /// The currently loaded translation root.
    fn root(&self, cpu: CpuId) -> PhysicalAddress;
}
