//! GPU translation tables: the flat global table (GGTT) and per-process multi-level tables
//! (PPGTT).
//!
//! The tables here never live in real memory. Each node reserves a physical address for its own
//! storage from a [`PhysicalAllocator`](aubstream_phys::PhysicalAllocator) and knows how to
//! compute the entry its parent stores for it; [`map_range`] walks the tree, creating whatever is
//! missing, and reports the entry writes a backend must publish to make a mapping visible.

#![forbid(unsafe_code)]

mod entry;
mod layout;
mod table;
mod walker;

use aubstream_phys::AllocError;
use aubstream_types::TableLevel;
use thiserror::Error;

pub use entry::{
    compose_entry, ENTRY_ADDRESS_MASK, ENTRY_LARGE_PAGE, ENTRY_LOCAL_MEMORY, ENTRY_PRESENT,
    ENTRY_WRITABLE,
};
pub use layout::PpgttLayout;
pub use table::{AllocParams, PageTable, DEFAULT_GGTT_SIZE, TABLE_ENTRY_SIZE};
pub use walker::{map_range, translate, EntryWrite, Mapping};

pub type Result<T> = std::result::Result<T, PagingError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PagingError {
    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error("large page at physical address 0x{address:x} is not 2 MiB aligned")]
    MisalignedLargePage { address: u64 },

    #[error("{level:?} node has no physical backing and cannot be referenced by an entry")]
    NoBacking { level: TableLevel },

    #[error("unsupported PPGTT address width: {bits} bits")]
    UnsupportedAddressWidth { bits: u32 },

    #[error("GPU virtual address range 0x{address:x}+0x{size:x} is outside the table")]
    AddressOutOfRange { address: u64, size: u64 },

    #[error("index {index} out of range for {level:?} table with {entries} entries")]
    IndexOutOfRange {
        level: TableLevel,
        index: usize,
        entries: usize,
    },

    #[error("{level:?} cannot hold a child of level {child:?}")]
    InvalidChild { level: TableLevel, child: TableLevel },
}
