//! Physical address allocation for a simulated GPU.
//!
//! None of these allocators hand out memory the GPU could touch; they only track which parts of
//! a made-up physical address space are in use, so that page tables and data pages get stable,
//! non-overlapping addresses that can be written to a trace or forwarded to a simulator.
//!
//! Three flavours:
//! - [`SimplePhysicalAllocator`]: one bump allocator with an exact-size free list per bank.
//! - [`HeapPhysicalAllocator`]: every reservation is real host memory and the "physical" address
//!   is its host address.
//! - [`HostBackedAllocator`]: simple allocation plus a page-granular physical → host table, for
//!   backends that share host memory with the simulator.

#![forbid(unsafe_code)]

mod heap;
mod host_backed;
mod simple;

use core::ops::Range;

use aubstream_types::MemoryBank;
use thiserror::Error;

pub use heap::HeapPhysicalAllocator;
pub use host_backed::{HostBackedAllocator, HostRun};
pub use simple::{SimplePhysicalAllocator, DEFAULT_BANK_SIZE, SYSTEM_MEMORY_START};

/// Minimum alignment (and default granularity) of every reservation.
pub const MIN_ALIGNMENT: u64 = 0x1000;

pub type Result<T> = std::result::Result<T, AllocError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("{bank} exhausted: cannot reserve 0x{size:x} bytes aligned to 0x{alignment:x}")]
    OutOfMemory {
        bank: MemoryBank,
        size: u64,
        alignment: u64,
    },

    #[error("zero-sized reservation requested from {bank}")]
    ZeroSize { bank: MemoryBank },

    #[error("alignment 0x{alignment:x} is not a power of two")]
    InvalidAlignment { alignment: u64 },

    #[error("physical range 0x{address:x}+0x{len:x} in {bank} is not backed by host memory")]
    Unmapped {
        bank: MemoryBank,
        address: u64,
        len: usize,
    },
}

/// Bank-aware physical address bookkeeping.
///
/// Implementations serialize their own mutation, so one allocator may be shared (`Arc`) between
/// page-table builders running on different threads.
pub trait PhysicalAllocator: Send + Sync {
    /// Reserves `size` bytes in `bank`, aligned to `max(alignment, granularity)`.
    ///
    /// # Panics
    /// Panics if `bank` has more than one bit set or names a bank the allocator was not built
    /// with.
    fn reserve(&self, bank: MemoryBank, size: u64, alignment: u64) -> Result<u64>;

    /// Returns a reservation to its bank. Unknown addresses are ignored.
    fn free(&self, bank: MemoryBank, address: u64);

    /// Address range owned by `bank`, if the allocator partitions by bank.
    fn bank_region(&self, bank: MemoryBank) -> Option<Range<u64>> {
        let _ = bank;
        None
    }
}

impl<A: PhysicalAllocator + ?Sized> PhysicalAllocator for std::sync::Arc<A> {
    fn reserve(&self, bank: MemoryBank, size: u64, alignment: u64) -> Result<u64> {
        (**self).reserve(bank, size, alignment)
    }

    fn free(&self, bank: MemoryBank, address: u64) {
        (**self).free(bank, address)
    }

    fn bank_region(&self, bank: MemoryBank) -> Option<Range<u64>> {
        (**self).bank_region(bank)
    }
}

pub(crate) fn align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    Some(value.checked_add(alignment - 1)? & !(alignment - 1))
}

pub(crate) fn effective_alignment(alignment: u64, granularity: u64) -> Result<u64> {
    let alignment = alignment.max(granularity);
    if !alignment.is_power_of_two() {
        return Err(AllocError::InvalidAlignment { alignment });
    }
    Ok(alignment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(0, 0x1000), Some(0));
        assert_eq!(align_up(1, 0x1000), Some(0x1000));
        assert_eq!(align_up(0x1000, 0x1000), Some(0x1000));
        assert_eq!(align_up(u64::MAX, 0x1000), None);
    }

    #[test]
    fn effective_alignment_clamps_to_granularity() {
        assert_eq!(effective_alignment(0, MIN_ALIGNMENT), Ok(0x1000));
        assert_eq!(effective_alignment(16, MIN_ALIGNMENT), Ok(0x1000));
        assert_eq!(effective_alignment(0x20_0000, MIN_ALIGNMENT), Ok(0x20_0000));
        assert_eq!(
            effective_alignment(0x3000, MIN_ALIGNMENT),
            Err(AllocError::InvalidAlignment { alignment: 0x3000 })
        );
    }
}
