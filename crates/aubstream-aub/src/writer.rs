use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use aubstream_types::{DataHint, FailurePolicy, GpuDescriptor, PageInfo};

use crate::format::{
    header_dword, AddressSpace, CompareOp, ContextDeclaration, RecordKind, SurfaceDump,
    AUB_FILE_VERSION, MAX_CONTIGUOUS_CHUNK, MAX_RECORD_DWORDS, RECORDING_METHOD_LIBRARY,
    REGISTER_SIZE_32,
};
use crate::packing::{plan, PackStep};
use crate::{AubError, Result};

/// Size of one GGTT entry in the GTT-entry address space.
const GTT_ENTRY_SIZE: u64 = 8;

/// Accumulates one record; the header is patched in by [`RecordBuilder::finish`].
struct RecordBuilder {
    kind: RecordKind,
    bytes: Vec<u8>,
}

impl RecordBuilder {
    fn new(kind: RecordKind) -> Self {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&[0u8; 4]);
        Self { kind, bytes }
    }

    fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Low dword then high dword.
    fn u64(&mut self, value: u64) -> &mut Self {
        self.u32(value as u32).u32((value >> 32) as u32)
    }

    fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(data);
        self
    }

    fn text(&mut self, text: &str) -> Result<&mut Self> {
        if text.as_bytes().contains(&0) {
            return Err(AubError::InteriorNul);
        }
        self.bytes.extend_from_slice(text.as_bytes());
        self.bytes.push(0);
        Ok(self)
    }

    fn finish(mut self) -> Result<Vec<u8>> {
        let padded = self.bytes.len().next_multiple_of(4);
        self.bytes.resize(padded, 0);
        let dwords = padded / 4 - 1;
        if dwords > MAX_RECORD_DWORDS {
            return Err(AubError::RecordTooLarge {
                kind: self.kind,
                dwords,
            });
        }
        let header = header_dword(self.kind, dwords as u16);
        self.bytes[..4].copy_from_slice(&header.to_le_bytes());
        Ok(self.bytes)
    }
}

/// Writes AUB records to `W`.
///
/// Every operation writes one complete record (or, for large writes, a sequence of records) and
/// flushes before returning. Failures are returned as [`AubError`]; under
/// [`FailurePolicy::Abort`] they panic instead.
pub struct AubWriter<W: Write> {
    out: Option<W>,
    policy: FailurePolicy,
    records: u64,
}

impl AubWriter<BufWriter<File>> {
    /// Creates (or truncates) the trace at `path` and writes its version record.
    pub fn create(
        path: impl AsRef<Path>,
        gpu: &dyn GpuDescriptor,
        stepping: u32,
        policy: FailurePolicy,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = policy.apply(File::create(path).map_err(AubError::from))?;
        tracing::info!(path = %path.display(), family = %gpu.family(), "opened trace file");
        Self::new(BufWriter::new(file), gpu, stepping, policy)
    }
}

impl<W: Write> AubWriter<W> {
    /// Wraps `out` and writes the version record identifying `gpu`.
    pub fn new(
        out: W,
        gpu: &dyn GpuDescriptor,
        stepping: u32,
        policy: FailurePolicy,
    ) -> Result<Self> {
        let mut writer = Self {
            out: Some(out),
            policy,
            records: 0,
        };
        let result = writer.write_version(gpu, stepping);
        policy.apply(result)?;
        Ok(writer)
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: FailurePolicy) {
        self.policy = policy;
    }

    /// Records written so far, including the version record.
    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn is_closed(&self) -> bool {
        self.out.is_none()
    }

    fn emit(&mut self, record: RecordBuilder) -> Result<()> {
        let kind = record.kind;
        let bytes = record.finish()?;
        let out = self.out.as_mut().ok_or(AubError::Closed)?;
        out.write_all(&bytes)?;
        out.flush()?;
        self.records += 1;
        tracing::trace!(?kind, len = bytes.len(), "wrote trace record");
        Ok(())
    }

    fn write_version(&mut self, gpu: &dyn GpuDescriptor, stepping: u32) -> Result<()> {
        let mut tag = [0u8; 4];
        let family_tag = gpu.family().tag().as_bytes();
        tag[..family_tag.len()].copy_from_slice(family_tag);

        let mut record = RecordBuilder::new(RecordKind::Version);
        record
            .u32(AUB_FILE_VERSION)
            .bytes(&tag)
            .u32(stepping)
            .u32(gpu.device_id())
            .u32(RECORDING_METHOD_LIBRARY);
        if let Some(abbreviation) = gpu.product_abbreviation() {
            record.bytes(&abbreviation);
        }
        self.emit(record)
    }

    pub fn comment(&mut self, text: &str) -> Result<()> {
        let result = self.comment_inner(text);
        self.policy.apply(result)
    }

    fn comment_inner(&mut self, text: &str) -> Result<()> {
        let mut record = RecordBuilder::new(RecordKind::Comment);
        record.u32(0).text(text)?;
        self.emit(record)
    }

    pub fn declare_context(&mut self, context: &ContextDeclaration) -> Result<()> {
        let mut record = RecordBuilder::new(RecordKind::ContextDeclaration);
        record
            .u32(context.handle)
            .u32(context.engine)
            .u32(context.flags())
            .u64(context.page_table_root)
            .u64(context.context_image)
            .u32(context.image_size);
        let result = self.emit(record);
        self.policy.apply(result)
    }

    /// Asks the replayer to dump `size` bytes at `address` into `file_name`.
    pub fn dump_buffer(
        &mut self,
        address: u64,
        size: u64,
        space: AddressSpace,
        file_name: &str,
    ) -> Result<()> {
        let result = self.dump_buffer_inner(address, size, space, file_name);
        self.policy.apply(result)
    }

    fn dump_buffer_inner(
        &mut self,
        address: u64,
        size: u64,
        space: AddressSpace,
        file_name: &str,
    ) -> Result<()> {
        let mut record = RecordBuilder::new(RecordKind::MemoryDump);
        record
            .u64(address)
            .u32(space.to_flags())
            .u64(size)
            .text(file_name)?;
        self.emit(record)
    }

    pub fn dump_surface(&mut self, surface: &SurfaceDump) -> Result<()> {
        let mut record = RecordBuilder::new(RecordKind::SurfaceDump);
        record
            .u64(surface.base)
            .u32(surface.width)
            .u32(surface.height)
            .u32(surface.pitch)
            .u32(surface.format)
            .u32(surface.flags())
            .u64(surface.aux_base)
            .u32(surface.aux_pitch)
            .u32(surface.qpitch)
            .u64(surface.clear_color_address)
            .u32(surface.mode);
        let result = self.emit(record);
        self.policy.apply(result)
    }

    /// Asks the replayer to compare memory at `address` against `expected`.
    pub fn expect_memory(
        &mut self,
        address: u64,
        expected: &[u8],
        space: AddressSpace,
        op: CompareOp,
    ) -> Result<()> {
        let result = self.chunked(
            RecordKind::MemoryCompare,
            address,
            expected,
            space.to_flags() | op as u32,
        );
        self.policy.apply(result)
    }

    /// Declares `[address, address + size)` as one physically contiguous region.
    pub fn reserve_contiguous(&mut self, address: u64, size: u64, space: AddressSpace) -> Result<()> {
        let mut record = RecordBuilder::new(RecordKind::ContinuousRegion);
        record.u64(address).u32(space.to_flags()).u64(size);
        let result = self.emit(record);
        self.policy.apply(result)
    }

    pub fn write_contiguous(
        &mut self,
        address: u64,
        data: &[u8],
        space: AddressSpace,
        hint: DataHint,
    ) -> Result<()> {
        let result = self.chunked(
            RecordKind::MemoryWrite,
            address,
            data,
            space.to_flags() | hint.0 as u32,
        );
        self.policy.apply(result)
    }

    /// Writes `data` to `address` in records of at most [`MAX_CONTIGUOUS_CHUNK`] bytes.
    fn chunked(&mut self, kind: RecordKind, address: u64, data: &[u8], flags: u32) -> Result<()> {
        let mut offset = 0usize;
        loop {
            let end = (offset + MAX_CONTIGUOUS_CHUNK).min(data.len());
            let chunk = &data[offset..end];
            let mut record = RecordBuilder::new(kind);
            record
                .u64(address + offset as u64)
                .u32(flags)
                .u32(chunk.len() as u32)
                .bytes(chunk);
            self.emit(record)?;
            offset = end;
            if offset >= data.len() {
                return Ok(());
            }
        }
    }

    /// Writes the bytes of `data` to the physical pages in `entries`, in order.
    ///
    /// Entries are grouped into discontiguous records by [`plan`]; whatever cannot be batched is
    /// written through the contiguous path.
    pub fn write_discontiguous(
        &mut self,
        entries: &[PageInfo],
        data: &[u8],
        hint: DataHint,
    ) -> Result<()> {
        let result = self.write_discontiguous_inner(entries, data, hint);
        self.policy.apply(result)
    }

    fn write_discontiguous_inner(
        &mut self,
        entries: &[PageInfo],
        data: &[u8],
        hint: DataHint,
    ) -> Result<()> {
        let expected = PageInfo::total_size(entries);
        if expected > data.len() {
            return Err(AubError::SourceTooShort {
                expected,
                actual: data.len(),
            });
        }

        let mut offsets = Vec::with_capacity(entries.len() + 1);
        let mut offset = 0usize;
        offsets.push(0);
        for entry in entries {
            offset += entry.size;
            offsets.push(offset);
        }

        for step in plan(entries) {
            match step {
                PackStep::Single(index) => {
                    let entry = &entries[index];
                    let bytes = &data[offsets[index]..offsets[index + 1]];
                    let flags = AddressSpace::for_bank(entry.bank).to_flags() | hint.0 as u32;
                    self.chunked(RecordKind::MemoryWrite, entry.phys_address, bytes, flags)?;
                }
                PackStep::Batch(range) => {
                    let batch = &entries[range.clone()];
                    let space = AddressSpace::for_bank(batch[0].bank);
                    let mut record = RecordBuilder::new(RecordKind::MemoryWriteDiscontiguous);
                    record
                        .u32(space.to_flags() | hint.0 as u32)
                        .u32(batch.len() as u32);
                    for entry in batch {
                        record.u64(entry.phys_address).u32(entry.size as u32);
                    }
                    record.bytes(&data[offsets[range.start]..offsets[range.end]]);
                    self.emit(record)?;
                }
            }
        }
        Ok(())
    }

    pub fn write_mmio(&mut self, offset: u32, value: u32) -> Result<()> {
        let mut record = RecordBuilder::new(RecordKind::RegisterWrite);
        record
            .u32(offset)
            .u32(REGISTER_SIZE_32)
            .u32(u32::MAX)
            .u32(value);
        let result = self.emit(record);
        self.policy.apply(result)
    }

    /// Asks the replayer to wait until `(register & mask) == value` (or `!=` with
    /// `not_equal`). `timeout_action` is stored verbatim for the replayer.
    pub fn register_poll(
        &mut self,
        offset: u32,
        mask: u32,
        value: u32,
        not_equal: bool,
        timeout_action: u8,
    ) -> Result<()> {
        let flags = REGISTER_SIZE_32 | ((not_equal as u32) << 2) | ((timeout_action as u32) << 8);
        let mut record = RecordBuilder::new(RecordKind::RegisterPoll);
        record.u32(offset).u32(flags).u32(mask).u32(value);
        let result = self.emit(record);
        self.policy.apply(result)
    }

    /// Updates GGTT entry `index`, as a write into the GTT-entry address space.
    pub fn write_gtt(&mut self, index: u32, value: u64) -> Result<()> {
        let result = self.chunked(
            RecordKind::MemoryWrite,
            index as u64 * GTT_ENTRY_SIZE,
            &value.to_le_bytes(),
            AddressSpace::GttEntry.to_flags() | DataHint::PAGE_TABLE.0 as u32,
        );
        self.policy.apply(result)
    }

    /// Flushes and releases the underlying writer. Later operations fail with
    /// [`AubError::Closed`]; closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let result = match self.out.take() {
            Some(mut out) => {
                tracing::debug!(records = self.records, "closing trace");
                out.flush().map_err(AubError::from)
            }
            None => Ok(()),
        };
        self.policy.apply(result)
    }

    /// Returns the underlying writer, or `None` if the writer was closed.
    pub fn into_inner(mut self) -> Option<W> {
        self.out.take()
    }
}

impl<W: Write> Drop for AubWriter<W> {
    fn drop(&mut self) {
        if let Some(out) = self.out.as_mut() {
            if let Err(err) = out.flush() {
                tracing::warn!(error = %err, "failed to flush trace on drop");
            }
        }
    }
}
