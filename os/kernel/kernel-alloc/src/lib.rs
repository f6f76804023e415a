//! # Physical Page and Object Allocation
//!
//! Allocators the pmap draws on for its own bookkeeping:
//!
//! * [`FrameAlloc`] hands out and takes back 4 KiB physical frames. The
//!   pmap uses it for page-table pages and top-level directories;
//!   [`FreeListFrameAlloc`] is the concrete allocator over a frame range.
//! * [`Pool`] is a fixed-capacity slab of objects addressed by [`PoolIdx`].
//!   PV list nodes live in one. Its capacity is decided up front, so
//!   taking a slot never allocates and can be done with spin locks held.
//!
//! Both allocators can be told to fail the next `n` requests
//! ([`FreeListFrameAlloc::fail_next`], [`Pool::fail_next`]) so that the
//! out-of-memory paths of their callers can be exercised.
//!
//! ## Frames
//!
//! ```text
//!        start                                         end
//!          │◄──────────── managed frame range ─────────►│
//!          ├────┬────┬────┬────┬────┬────┬────┬────┬────┤
//! free:    │ f7 │ f6 │ .. │    allocations pop from the top of the free stack
//!          └────┴────┴────┴────┴────┴────┴────┴────┴────┘
//! ```
//!
//! Frees push back on the stack; freeing a frame that is not currently
//! allocated is reported as [`FrameAllocError::DoubleFree`].

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod frame_alloc;
mod pool;

pub use frame_alloc::{FrameAlloc, FrameAllocError, FreeListFrameAlloc};
pub use pool::{Pool, PoolIdx};
