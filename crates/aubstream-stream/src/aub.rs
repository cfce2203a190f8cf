use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use aubstream_aub::{AddressSpace, AubWriter, CompareOp, ContextDeclaration, SurfaceDump};
use aubstream_tbx::PciAddress;
use aubstream_types::{DataHint, FailurePolicy, GpuDescriptor, MemoryBank, PageInfo};

use crate::{page_chunks, Result, Stream, StreamMode};

/// Records every operation to an AUB trace.
pub struct AubStream<W: Write = BufWriter<File>> {
    writer: AubWriter<W>,
}

impl AubStream {
    /// Creates the trace file and writes its version record.
    pub fn create(
        path: impl AsRef<Path>,
        gpu: &dyn GpuDescriptor,
        stepping: u32,
        policy: FailurePolicy,
    ) -> Result<Self> {
        Ok(Self::from_writer(AubWriter::create(
            path, gpu, stepping, policy,
        )?))
    }
}

impl<W: Write> AubStream<W> {
    pub fn from_writer(writer: AubWriter<W>) -> Self {
        Self { writer }
    }

    pub fn writer(&self) -> &AubWriter<W> {
        &self.writer
    }

    /// Releases the underlying sink, or `None` after [`Stream::close`].
    pub fn into_inner(self) -> Option<W> {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> Stream for AubStream<W> {
    fn stream_mode(&self) -> StreamMode {
        StreamMode::AUB_FILE
    }

    fn write_mmio(&mut self, offset: u32, value: u32) -> Result<()> {
        Ok(self.writer.write_mmio(offset, value)?)
    }

    fn register_poll(
        &mut self,
        offset: u32,
        mask: u32,
        value: u32,
        not_equal: bool,
        timeout_action: u8,
    ) -> Result<()> {
        Ok(self
            .writer
            .register_poll(offset, mask, value, not_equal, timeout_action)?)
    }

    fn write_memory(&mut self, pages: &[PageInfo], data: &[u8], hint: DataHint) -> Result<()> {
        Ok(self.writer.write_discontiguous(pages, data, hint)?)
    }

    fn expect_memory(
        &mut self,
        pages: &[PageInfo],
        expected: &[u8],
        op: CompareOp,
    ) -> Result<()> {
        for (page, chunk) in page_chunks(pages, expected)? {
            self.writer.expect_memory(
                page.phys_address,
                chunk,
                AddressSpace::for_bank(page.bank),
                op,
            )?;
        }
        Ok(())
    }

    fn write_gtt(&mut self, index: u32, value: u64) -> Result<()> {
        Ok(self.writer.write_gtt(index, value)?)
    }

    fn write_pci_cfg(&mut self, function: PciAddress, offset: u32, value: u32) -> Result<()> {
        // Traces have no configuration-space record.
        tracing::debug!(?function, offset, value, "dropping PCI config write from trace");
        Ok(())
    }

    fn reserve_contiguous(&mut self, address: u64, size: u64, bank: MemoryBank) -> Result<()> {
        Ok(self
            .writer
            .reserve_contiguous(address, size, AddressSpace::for_bank(bank))?)
    }

    fn comment(&mut self, text: &str) -> Result<()> {
        Ok(self.writer.comment(text)?)
    }

    fn declare_context(&mut self, context: &ContextDeclaration) -> Result<()> {
        Ok(self.writer.declare_context(context)?)
    }

    fn dump_buffer(
        &mut self,
        address: u64,
        size: u64,
        bank: MemoryBank,
        file_name: &str,
    ) -> Result<()> {
        Ok(self
            .writer
            .dump_buffer(address, size, AddressSpace::for_bank(bank), file_name)?)
    }

    fn dump_surface(&mut self, surface: &SurfaceDump) -> Result<()> {
        Ok(self.writer.dump_surface(surface)?)
    }

    fn close(&mut self) -> Result<()> {
        Ok(self.writer.close()?)
    }
}
