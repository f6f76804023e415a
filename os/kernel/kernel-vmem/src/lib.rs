//! # Virtual Memory Hardware Model
//!
//! The hardware-facing half of the paging stack:
//!
//! - [`Pte`] / [`mask`]: the 64-bit x86-64 page-table entry format, plus
//!   the two software bits (`WIRED`, `PVLIST`) the pmap stores in the
//!   OS-available range.
//! - [`PhysMemory`]: physical memory as frames of atomic words. Page-table
//!   pages are ordinary frames and are addressed by physical address.
//! - [`PteSlot`] and [`walk`]: atomic access to individual entries and
//!   resolution of a virtual address through the four levels.
//! - [`Mmu`]: the narrow interface the pmap uses to write entries, flush
//!   TLBs and load translation roots, and [`SimMmu`], a software model of
//!   it with per-CPU TLBs.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L4   |  L3   |  L2   |  L1   | Offset |
//!
//!  L4 (root)  →  L3  →  L2  →  L1  →  Physical Page
//!                       │      │
//!                       │      └──► PTE maps a 4 KiB page
//!                       └─────────► PDE with PS=1 maps a 2 MiB page
//! ```
//!
//! Permissions are the intersection along the walk: a user access needs
//! `U/S` at every level, a write needs `RW` at every level, and one `NX`
//! anywhere forbids instruction fetch.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod mmu;
mod phys;
pub mod pte;
mod sim;
mod table;

pub use crate::mmu::{FlushScope, Mmu};
pub use crate::phys::{Frame, PhysMemory};
pub use crate::pte::{Pte, mask};
pub use crate::sim::{AccessKind, Fault, SimMmu, TlbCounters, TlbEntry};
pub use crate::table::{PteSlot, TOP_LEVEL, Walk, directory_slot, table_at, walk};
