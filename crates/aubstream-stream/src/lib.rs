#![forbid(unsafe_code)]

//! Backend composition for aubstream sessions.
//!
//! A [`Stream`] is the sink every recorded operation goes through. The concrete backends are
//! [`AubStream`] (trace file), [`TbxStream`] (remote simulator) and [`TbxShmStream`] (remote
//! simulator with memory served from host-backed pages). [`MirrorStream`] and
//! [`GatedMirrorStream`] fan one logical operation out to a recording side and a live side.
//!
//! [`Session`] assembles one of these combinations from a [`SessionConfig`].

mod aub;
mod config;
mod mirror;
mod registry;
mod session;
mod tbx;

use aubstream_aub::{AubError, CompareOp, ContextDeclaration, SurfaceDump};
use aubstream_paging::PagingError;
use aubstream_phys::AllocError;
use aubstream_tbx::{PciAddress, TbxError};
use aubstream_types::{DataHint, MemoryBank, PageInfo, ProductFamily};
use bitflags::bitflags;
use thiserror::Error;

pub use aub::AubStream;
pub use config::{
    ConfigError, SessionConfig, SessionMode, DEFAULT_AUB_FILE, ENV_AUB_FILE, ENV_MODE,
    ENV_TBX_CONNECT_DELAY_MS, ENV_TBX_FRONTDOOR, ENV_TBX_PORT, ENV_TBX_SERVER, ENV_THROW_ON_ERROR,
};
pub use mirror::{GatedMirrorStream, MirrorStream};
pub use registry::GpuRegistry;
pub use session::{write_mapped, Session};
pub use tbx::{TbxShmStream, TbxStream};

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Aub(#[from] AubError),

    #[error(transparent)]
    Tbx(#[from] TbxError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Paging(#[from] PagingError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{operation} is not supported by a {mode:?} stream")]
    Unsupported {
        operation: &'static str,
        mode: StreamMode,
    },

    #[error("memory at 0x{address:x} failed a {op:?} comparison")]
    CompareMismatch { address: u64, op: CompareOp },

    #[error("pages cover {expected} bytes but the buffer holds {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("no GPU descriptor registered for {family}")]
    UnknownGpu { family: ProductFamily },
}

bitflags! {
    /// Backends a stream currently forwards to.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct StreamMode: u32 {
        const AUB_FILE = 1 << 0;
        const TBX = 1 << 1;
        const TBX_SHM = 1 << 2;
    }
}

impl StreamMode {
    /// Whether some active backend can answer reads.
    pub fn can_read(self) -> bool {
        self.intersects(Self::TBX | Self::TBX_SHM)
    }
}

/// Sink for recorded GPU state mutations.
///
/// Memory operations take the physical pages backing a GPU range together with one source
/// buffer; the buffer is consumed in page order. Reads are only answered by live backends; the
/// defaults report [`StreamError::Unsupported`]. Operations with no meaning for a backend (a
/// comment on a simulator connection) succeed without doing anything.
pub trait Stream: Send {
    fn stream_mode(&self) -> StreamMode;

    fn write_mmio(&mut self, offset: u32, value: u32) -> Result<()>;

    fn read_mmio(&mut self, offset: u32) -> Result<u32> {
        let _ = offset;
        Err(unsupported(self.stream_mode(), "read_mmio"))
    }

    /// Waits until `(register & mask) == value` (or `!=` when `not_equal` is set).
    fn register_poll(
        &mut self,
        offset: u32,
        mask: u32,
        value: u32,
        not_equal: bool,
        timeout_action: u8,
    ) -> Result<()>;

    fn write_memory(&mut self, pages: &[PageInfo], data: &[u8], hint: DataHint) -> Result<()>;

    fn read_memory(&mut self, pages: &[PageInfo], out: &mut [u8]) -> Result<()> {
        let _ = (pages, out);
        Err(unsupported(self.stream_mode(), "read_memory"))
    }

    fn expect_memory(&mut self, pages: &[PageInfo], expected: &[u8], op: CompareOp)
        -> Result<()>;

    fn write_gtt(&mut self, index: u32, value: u64) -> Result<()>;

    fn read_pci_cfg(&mut self, function: PciAddress, offset: u32) -> Result<u32> {
        let _ = (function, offset);
        Err(unsupported(self.stream_mode(), "read_pci_cfg"))
    }

    fn write_pci_cfg(&mut self, function: PciAddress, offset: u32, value: u32) -> Result<()>;

    fn reserve_contiguous(&mut self, address: u64, size: u64, bank: MemoryBank) -> Result<()> {
        let _ = (address, size, bank);
        Ok(())
    }

    fn comment(&mut self, text: &str) -> Result<()> {
        let _ = text;
        Ok(())
    }

    fn declare_context(&mut self, context: &ContextDeclaration) -> Result<()> {
        let _ = context;
        Ok(())
    }

    fn dump_buffer(
        &mut self,
        address: u64,
        size: u64,
        bank: MemoryBank,
        file_name: &str,
    ) -> Result<()> {
        let _ = (address, size, bank, file_name);
        Ok(())
    }

    fn dump_surface(&mut self, surface: &SurfaceDump) -> Result<()> {
        let _ = surface;
        Ok(())
    }

    /// Flushes and releases the backend. Closing twice is a no-op.
    fn close(&mut self) -> Result<()>;
}

impl<S: Stream + ?Sized> Stream for Box<S> {
    fn stream_mode(&self) -> StreamMode {
        (**self).stream_mode()
    }

    fn write_mmio(&mut self, offset: u32, value: u32) -> Result<()> {
        (**self).write_mmio(offset, value)
    }

    fn read_mmio(&mut self, offset: u32) -> Result<u32> {
        (**self).read_mmio(offset)
    }

    fn register_poll(
        &mut self,
        offset: u32,
        mask: u32,
        value: u32,
        not_equal: bool,
        timeout_action: u8,
    ) -> Result<()> {
        (**self).register_poll(offset, mask, value, not_equal, timeout_action)
    }

    fn write_memory(&mut self, pages: &[PageInfo], data: &[u8], hint: DataHint) -> Result<()> {
        (**self).write_memory(pages, data, hint)
    }

    fn read_memory(&mut self, pages: &[PageInfo], out: &mut [u8]) -> Result<()> {
        (**self).read_memory(pages, out)
    }

    fn expect_memory(
        &mut self,
        pages: &[PageInfo],
        expected: &[u8],
        op: CompareOp,
    ) -> Result<()> {
        (**self).expect_memory(pages, expected, op)
    }

    fn write_gtt(&mut self, index: u32, value: u64) -> Result<()> {
        (**self).write_gtt(index, value)
    }

    fn read_pci_cfg(&mut self, function: PciAddress, offset: u32) -> Result<u32> {
        (**self).read_pci_cfg(function, offset)
    }

    fn write_pci_cfg(&mut self, function: PciAddress, offset: u32, value: u32) -> Result<()> {
        (**self).write_pci_cfg(function, offset, value)
    }

    fn reserve_contiguous(&mut self, address: u64, size: u64, bank: MemoryBank) -> Result<()> {
        (**self).reserve_contiguous(address, size, bank)
    }

    fn comment(&mut self, text: &str) -> Result<()> {
        (**self).comment(text)
    }

    fn declare_context(&mut self, context: &ContextDeclaration) -> Result<()> {
        (**self).declare_context(context)
    }

    fn dump_buffer(
        &mut self,
        address: u64,
        size: u64,
        bank: MemoryBank,
        file_name: &str,
    ) -> Result<()> {
        (**self).dump_buffer(address, size, bank, file_name)
    }

    fn dump_surface(&mut self, surface: &SurfaceDump) -> Result<()> {
        (**self).dump_surface(surface)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

fn unsupported(mode: StreamMode, operation: &'static str) -> StreamError {
    StreamError::Unsupported { operation, mode }
}

fn check_len(pages: &[PageInfo], len: usize) -> Result<()> {
    let expected = PageInfo::total_size(pages);
    if expected != len {
        return Err(StreamError::LengthMismatch {
            expected,
            actual: len,
        });
    }
    Ok(())
}

/// Splits `data` along `pages`.
pub(crate) fn page_chunks<'a>(
    pages: &'a [PageInfo],
    data: &'a [u8],
) -> Result<impl Iterator<Item = (&'a PageInfo, &'a [u8])>> {
    check_len(pages, data.len())?;
    let mut rest = data;
    Ok(pages.iter().map(move |page| {
        let (chunk, tail) = rest.split_at(page.size);
        rest = tail;
        (page, chunk)
    }))
}

/// Mutable counterpart of [`page_chunks`].
pub(crate) fn page_chunks_mut<'a>(
    pages: &'a [PageInfo],
    out: &'a mut [u8],
) -> Result<Vec<(&'a PageInfo, &'a mut [u8])>> {
    check_len(pages, out.len())?;
    let mut rest = out;
    let mut chunks = Vec::with_capacity(pages.len());
    for page in pages {
        let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(page.size);
        rest = tail;
        chunks.push((page, chunk));
    }
    Ok(chunks)
}

/// Checks a live read-back against the bytes a compare expects.
pub(crate) fn check_compare(address: u64, actual: &[u8], expected: &[u8], op: CompareOp) -> Result<()> {
    let equal = actual == expected;
    let pass = match op {
        CompareOp::Equal => equal,
        CompareOp::NotEqual => !equal,
    };
    if pass {
        Ok(())
    } else {
        Err(StreamError::CompareMismatch { address, op })
    }
}

/// Evaluates both results and reports the first failure.
pub(crate) fn first_error(recorder: Result<()>, live: Result<()>) -> Result<()> {
    recorder.and(live)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_follow_pages() {
        let pages = [
            PageInfo::new(0x1000, 3, MemoryBank::SYSTEM),
            PageInfo::new(0x9000, 2, MemoryBank::local(0)),
        ];
        let chunks: Vec<_> = page_chunks(&pages, b"abcde")
            .unwrap()
            .map(|(page, chunk)| (page.phys_address, chunk.to_vec()))
            .collect();
        assert_eq!(chunks, vec![(0x1000, b"abc".to_vec()), (0x9000, b"de".to_vec())]);

        assert!(matches!(
            page_chunks(&pages, b"abcd").map(|_| ()),
            Err(StreamError::LengthMismatch {
                expected: 5,
                actual: 4
            })
        ));
    }

    #[test]
    fn mutable_chunks_write_through() {
        let pages = [
            PageInfo::new(0, 1, MemoryBank::SYSTEM),
            PageInfo::new(8, 2, MemoryBank::SYSTEM),
        ];
        let mut out = [0u8; 3];
        for (i, (_, chunk)) in page_chunks_mut(&pages, &mut out).unwrap().into_iter().enumerate() {
            chunk.fill(i as u8 + 1);
        }
        assert_eq!(out, [1, 2, 2]);
    }

    #[test]
    fn compare_ops() {
        assert!(check_compare(0, b"ab", b"ab", CompareOp::Equal).is_ok());
        assert!(check_compare(0, b"ab", b"ac", CompareOp::NotEqual).is_ok());
        assert!(matches!(
            check_compare(0x40, b"ab", b"ab", CompareOp::NotEqual),
            Err(StreamError::CompareMismatch { address: 0x40, .. })
        ));
    }

    #[test]
    fn read_capability() {
        assert!(!StreamMode::AUB_FILE.can_read());
        assert!((StreamMode::AUB_FILE | StreamMode::TBX).can_read());
        assert!(StreamMode::TBX_SHM.can_read());
    }
}
