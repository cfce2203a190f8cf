#![forbid(unsafe_code)]

//! AUB trace encoder.
//!
//! An AUB file is a flat sequence of records. Every record starts with one little-endian header
//! dword followed by `N` payload dwords:
//!
//! ```text
//! 31    29 28      23 22        16 15                0
//! +-------+----------+------------+------------------+
//! | type  |  opcode  | sub-opcode |  dword count (N) |
//! +-------+----------+------------+------------------+
//! ```
//!
//! `type` is always 7 and `opcode` always `0x2E`; the sub-opcode selects the record kind (see
//! [`RecordKind`]). Payloads that carry bytes are zero padded to a dword boundary, so a record
//! occupies exactly `4 * (N + 1)` bytes. The first record of every file is the version record.
//!
//! [`AubWriter`] produces records, [`AubReader`] parses them back, and [`plan`] decides how a
//! list of physical pages is split between discontiguous and contiguous write records.

mod format;
mod packing;
mod reader;
mod writer;

use std::io;

use thiserror::Error;

pub use format::{
    header_dword, split_header, AddressSpace, CompareOp, ContextDeclaration, RecordKind,
    SurfaceDump, AUB_FILE_VERSION, AUB_OPCODE, AUB_TYPE, MAX_CONTIGUOUS_CHUNK, MAX_RECORD_DWORDS,
    RECORDING_METHOD_LIBRARY,
};
pub use packing::{plan, PackStep, MAX_DISCONTIGUOUS_ENTRIES};
pub use reader::{decode, AubReadError, AubReader, AubRecord, DiscontiguousEntry, RawRecord};
pub use writer::AubWriter;

pub type Result<T> = std::result::Result<T, AubError>;

#[derive(Debug, Error)]
pub enum AubError {
    #[error("trace file I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("trace writer is closed")]
    Closed,

    #[error("{kind:?} record needs {dwords} payload dwords, more than the 16-bit count allows")]
    RecordTooLarge { kind: RecordKind, dwords: usize },

    #[error("write entries cover {expected} bytes but the source buffer holds {actual}")]
    SourceTooShort { expected: usize, actual: usize },

    #[error("text must not contain NUL bytes")]
    InteriorNul,
}
