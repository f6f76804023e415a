//! # Address-Space Layout and CPU Identity
//!
//! Compile-time configuration shared by the paging crates: where user space
//! ends, where the kernel half begins, how far the kernel may grow, and how
//! processors are named and grouped into bitmaps.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (48-bit, 4-level paging):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐  L4 slot 0
//!                       │           User Space            │
//!                       │    (one private tree per pmap)  │
//! USERSPACE_END         ├─────────────────────────────────┤  0x0000_8000_0000_0000
//!                       │      Non-canonical hole         │
//! KERNEL_SPACE_START    ├─────────────────────────────────┤  L4 slot 256
//!                       │       Kernel Space              │
//!                       │  (shared L3 tables, mirrored    │
//!                       │   into every top-level page)    │
//! KERNEL_SPACE_LIMIT    ├─────────────────────────────────┤  L4 slot 256 + KERNEL_L4_SLOTS
//!                       │           Unused                │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! * Top-level slots below [`PDIR_SLOT_KERN`](memory::PDIR_SLOT_KERN) are
//!   private to each address space.
//! * Slots from [`PDIR_SLOT_KERN`](memory::PDIR_SLOT_KERN) onward are copied
//!   from the kernel's directory whenever a directory is built, and
//!   re-propagated when the kernel range grows.
//!
//! ## Processors
//!
//! [`CpuId`](cpu::CpuId) names a processor; [`CpuMask`](cpu::CpuMask) is a
//! 64-bit set of processors, and [`AtomicCpuMask`](cpu::AtomicCpuMask) its
//! shared, lock-free counterpart used for "which CPUs have this loaded"
//! bookkeeping.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod cpu;
pub mod memory;
