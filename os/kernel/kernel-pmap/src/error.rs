//! Recoverable pmap errors.
//!
//! Only resource exhaustion is ever returned, and only to callers that
//! passed [`EnterFlags::canfail`](crate::EnterFlags). Everything else that
//! can go wrong inside the pmap is an invariant violation and panics.

/// The resource an allocation failed for.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AllocFailure {
    #[error("page-table page")]
    PageTablePage,
    #[error("PV entry")]
    PvEntry,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PmapError {
    #[error("out of memory: no {0} available")]
    NoMemory(AllocFailure),
}
