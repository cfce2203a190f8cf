use aubstream_types::{GpuDescriptor, MemoryBank, TableLevel, PAGE_SIZE_2M};

use crate::{PagingError, Result};

pub const ENTRY_PRESENT: u64 = 1 << 0;
pub const ENTRY_WRITABLE: u64 = 1 << 1;
pub const ENTRY_LARGE_PAGE: u64 = 1 << 7;
pub const ENTRY_LOCAL_MEMORY: u64 = 1 << 11;

pub const ENTRY_ADDRESS_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// Computes the entry that points at a node of `level` backed at `address`.
///
/// The family-specific bits from `gpu` are OR-ed in without interpretation.
pub fn compose_entry(
    gpu: &dyn GpuDescriptor,
    level: TableLevel,
    address: u64,
    bank: MemoryBank,
    writable: bool,
    uncached: bool,
) -> Result<u64> {
    let mut value = address | ENTRY_PRESENT;
    if writable {
        value |= ENTRY_WRITABLE;
    }
    if bank.is_local() {
        value |= ENTRY_LOCAL_MEMORY;
    }
    if level == TableLevel::Page2M {
        if address % PAGE_SIZE_2M != 0 {
            return Err(PagingError::MisalignedLargePage { address });
        }
        value |= ENTRY_LARGE_PAGE;
    }
    Ok(value | gpu.extra_entry_bits(level, bank, uncached))
}
