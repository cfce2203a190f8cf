//! Shared vocabulary for the aubstream crates.
//!
//! Every backend (trace file, simulator socket) and every producer (page tables, the
//! physical allocator) speaks in terms of the same few types:
//! - [`MemoryBank`]: which physical memory pool an address belongs to
//! - [`PageInfo`]: one physically contiguous piece of a larger write
//! - [`GpuDescriptor`]: the per-family capability that supplies product identity and the
//!   opaque extra bits OR-ed into translation entries

#![forbid(unsafe_code)]

mod bank;
mod gpu;

pub use bank::{DataHint, MemoryBank, PageInfo, MAX_LOCAL_BANKS, PAGE_SIZE_2M, PAGE_SIZE_4K};
pub use gpu::{BasicGpu, GpuDescriptor, ProductFamily, TableLevel};

/// What a backend does when an operation fails.
///
/// `Report` hands the error back to the caller. `Abort` turns the failure into a panic at the
/// operation boundary, for harnesses that treat any lost write as fatal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    Report,
    Abort,
}

impl FailurePolicy {
    pub fn from_throw_on_error(throw: bool) -> Self {
        if throw {
            Self::Abort
        } else {
            Self::Report
        }
    }

    /// Applies the policy to an operation result.
    #[track_caller]
    pub fn apply<T, E: core::fmt::Display>(self, result: Result<T, E>) -> Result<T, E> {
        match (self, result) {
            (Self::Abort, Err(err)) => panic!("aubstream operation failed: {err}"),
            (_, result) => result,
        }
    }
}
