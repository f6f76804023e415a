//! # x86-64 Physical Map
//!
//! The machine-dependent half of a virtual memory system: it maintains the
//! hardware page tables of every address space, the reverse mappings from
//! physical pages to the mappings of them, and TLB coherence across CPUs.
//!
//! | Component            | Where                                         |
//! |----------------------|-----------------------------------------------|
//! | Page-table accessor  | `with_ptes`: direct or alternate, ordered locks |
//! | PTP lifecycle        | `get_ptp` / `free_ptp`, wire counts            |
//! | PV subsystem         | per-page lists with an embedded first entry   |
//! | Pmap lifecycle       | [`PmapSystem::create`], [`PmapSystem::destroy`], directory cache |
//! | Activation           | [`PmapSystem::activate`], [`PmapSystem::load`], [`PmapSystem::deactivate`] |
//! | Shootdown            | mailboxes and IPIs, [`PmapSystem::shootwait`] |
//! | Mapping operations   | [`PmapSystem::enter`], [`PmapSystem::remove`], [`PmapSystem::protect`], … |
//!
//! ## Structure
//!
//! ```text
//!                 ┌──────────────── PmapSystem ────────────────┐
//!                 │ kernel pmap   pmaps list   directory cache │
//!                 │ PV table      broadcast mailbox            │
//!                 │ CpuInfo[n]: loaded pmap, TLB state,        │
//!                 │             mailbox, pending IPIs          │
//!                 └──────┬───────────────────────┬─────────────┘
//!                        │                       │
//!             Machine: PhysMemory, SimMmu,   Arc<Pmap>: directory,
//!             table and page allocators       PTP records, CPU sets
//! ```
//!
//! Every operation names the CPU it executes on. Lock order, outermost
//! first: pmap tables (two of them by ascending [`PmapId`]), page PV lock,
//! PV hash bucket, PV node pool. The pmap list lock is never taken under a
//! page lock.
//!
//! ## Example
//!
//! ```
//! use kernel_info::cpu::CpuId;
//! use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
//! use kernel_pmap::{EnterFlags, MachineConfig, PmapSystem, Prot, Thread};
//!
//! let sys = PmapSystem::bootstrap(MachineConfig::new(1));
//! let cpu = CpuId::BSP;
//! let pmap = sys.create();
//! let thread = Thread::new(pmap.clone());
//! sys.activate(cpu, &thread);
//! sys.load(cpu);
//!
//! let va = VirtualAddress::new(0x1000);
//! let pa = PhysicalAddress::new(0x5000);
//! sys.enter(cpu, &pmap, va, pa, Prot::READ_WRITE, EnterFlags::new()).unwrap();
//! assert_eq!(sys.extract(cpu, &pmap, va), Some(pa));
//! assert_eq!(sys.pv_count(cpu, pa), 1);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod accessor;
mod activate;
mod config;
mod cpu;
mod error;
mod flags;
mod lifecycle;
mod machine;
mod ops;
mod pmap;
mod ptp;
mod pv;
mod shootdown;
mod system;

pub use config::{IpiDelivery, MachineConfig};
pub use cpu::{CpuInfo, Thread, TlbState};
pub use error::{AllocFailure, PmapError};
pub use flags::{EnterFlags, PageAttrs, Prot};
pub use machine::Machine;
pub use pmap::{Pmap, PmapId};
pub use ptp::PtpCensus;
pub use system::PmapSystem;
