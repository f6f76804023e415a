//! # Kernel synchronization primitives
//!
//! The short-held locks and spin helpers the pmap layer is built on:
//!
//! | Primitive | Use |
//! |-----------|-----|
//! | [`SpinLock`] | Page-table, PV and list locks; never held across allocation. |
//! | [`lock_pair`] | Takes two locks in ascending identity order. |
//! | [`PreemptCounter`] | Per-CPU "preemption disabled" depth with an RAII guard. |

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod ordered;
mod preempt;
mod spin_lock;

pub use ordered::{lock_pair, lock_pair_with};
pub use preempt::{PreemptCounter, PreemptGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
