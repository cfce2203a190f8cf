use aubstream_aub::{CompareOp, ContextDeclaration, SurfaceDump};
use aubstream_tbx::PciAddress;
use aubstream_types::{DataHint, MemoryBank, PageInfo};

use crate::{first_error, Result, Stream, StreamMode};

/// Fans operations out to a recording side and a live side.
///
/// Mutations reach both sides in call order, recorder first; if either fails the first error
/// is returned after both have been tried. Reads are answered by the live side only.
///
/// Two runtime switches narrow the fan-out: [`pause`](Self::pause) skips the recorder
/// entirely, and [`block_memory_writes`](Self::block_memory_writes) keeps memory contents off
/// the live side while MMIO, polls, compares and GTT updates still reach it.
pub struct GatedMirrorStream<P, L> {
    recorder: P,
    live: L,
    paused: bool,
    memory_blocked: bool,
}

impl<P: Stream, L: Stream> GatedMirrorStream<P, L> {
    pub fn new(recorder: P, live: L) -> Self {
        Self {
            recorder,
            live,
            paused: false,
            memory_blocked: false,
        }
    }

    pub fn pause(&mut self, paused: bool) {
        if self.paused != paused {
            tracing::debug!(paused, "recording side toggled");
        }
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn block_memory_writes(&mut self, blocked: bool) {
        if self.memory_blocked != blocked {
            tracing::debug!(blocked, "live memory writes toggled");
        }
        self.memory_blocked = blocked;
    }

    pub fn memory_writes_blocked(&self) -> bool {
        self.memory_blocked
    }

    pub fn recorder(&self) -> &P {
        &self.recorder
    }

    pub fn live(&self) -> &L {
        &self.live
    }

    pub fn into_parts(self) -> (P, L) {
        (self.recorder, self.live)
    }

    fn both(
        &mut self,
        mut op: impl FnMut(&mut dyn Stream) -> Result<()>,
    ) -> Result<()> {
        let recorded = if self.paused {
            Ok(())
        } else {
            op(&mut self.recorder)
        };
        first_error(recorded, op(&mut self.live))
    }

    fn recorder_only(&mut self, op: impl FnOnce(&mut dyn Stream) -> Result<()>) -> Result<()> {
        if self.paused {
            return Ok(());
        }
        op(&mut self.recorder)
    }
}

impl<P: Stream, L: Stream> Stream for GatedMirrorStream<P, L> {
    fn stream_mode(&self) -> StreamMode {
        let live = self.live.stream_mode();
        if self.paused {
            live
        } else {
            self.recorder.stream_mode() | live
        }
    }

    fn write_mmio(&mut self, offset: u32, value: u32) -> Result<()> {
        self.both(|s| s.write_mmio(offset, value))
    }

    fn read_mmio(&mut self, offset: u32) -> Result<u32> {
        self.live.read_mmio(offset)
    }

    fn register_poll(
        &mut self,
        offset: u32,
        mask: u32,
        value: u32,
        not_equal: bool,
        timeout_action: u8,
    ) -> Result<()> {
        self.both(|s| s.register_poll(offset, mask, value, not_equal, timeout_action))
    }

    fn write_memory(&mut self, pages: &[PageInfo], data: &[u8], hint: DataHint) -> Result<()> {
        let recorded = self.recorder_only(|s| s.write_memory(pages, data, hint));
        let live = if self.memory_blocked {
            Ok(())
        } else {
            self.live.write_memory(pages, data, hint)
        };
        first_error(recorded, live)
    }

    fn read_memory(&mut self, pages: &[PageInfo], out: &mut [u8]) -> Result<()> {
        self.live.read_memory(pages, out)
    }

    fn expect_memory(
        &mut self,
        pages: &[PageInfo],
        expected: &[u8],
        op: CompareOp,
    ) -> Result<()> {
        self.both(|s| s.expect_memory(pages, expected, op))
    }

    fn write_gtt(&mut self, index: u32, value: u64) -> Result<()> {
        self.both(|s| s.write_gtt(index, value))
    }

    fn read_pci_cfg(&mut self, function: PciAddress, offset: u32) -> Result<u32> {
        self.live.read_pci_cfg(function, offset)
    }

    fn write_pci_cfg(&mut self, function: PciAddress, offset: u32, value: u32) -> Result<()> {
        self.both(|s| s.write_pci_cfg(function, offset, value))
    }

    fn reserve_contiguous(&mut self, address: u64, size: u64, bank: MemoryBank) -> Result<()> {
        self.both(|s| s.reserve_contiguous(address, size, bank))
    }

    fn comment(&mut self, text: &str) -> Result<()> {
        self.both(|s| s.comment(text))
    }

    fn declare_context(&mut self, context: &ContextDeclaration) -> Result<()> {
        self.both(|s| s.declare_context(context))
    }

    fn dump_buffer(
        &mut self,
        address: u64,
        size: u64,
        bank: MemoryBank,
        file_name: &str,
    ) -> Result<()> {
        self.both(|s| s.dump_buffer(address, size, bank, file_name))
    }

    fn dump_surface(&mut self, surface: &SurfaceDump) -> Result<()> {
        self.both(|s| s.dump_surface(surface))
    }

    /// Closes both sides, including a paused recorder.
    fn close(&mut self) -> Result<()> {
        let recorded = self.recorder.close();
        first_error(recorded, self.live.close())
    }
}

/// A [`GatedMirrorStream`] whose switches are never thrown: every mutation reaches both sides.
pub struct MirrorStream<P, L>(GatedMirrorStream<P, L>);

impl<P: Stream, L: Stream> MirrorStream<P, L> {
    pub fn new(recorder: P, live: L) -> Self {
        Self(GatedMirrorStream::new(recorder, live))
    }

    pub fn recorder(&self) -> &P {
        self.0.recorder()
    }

    pub fn live(&self) -> &L {
        self.0.live()
    }

    pub fn into_parts(self) -> (P, L) {
        self.0.into_parts()
    }
}

impl<P: Stream, L: Stream> Stream for MirrorStream<P, L> {
    fn stream_mode(&self) -> StreamMode {
        self.0.stream_mode()
    }

    fn write_mmio(&mut self, offset: u32, value: u32) -> Result<()> {
        self.0.write_mmio(offset, value)
    }

    fn read_mmio(&mut self, offset: u32) -> Result<u32> {
        self.0.read_mmio(offset)
    }

    fn register_poll(
        &mut self,
        offset: u32,
        mask: u32,
        value: u32,
        not_equal: bool,
        timeout_action: u8,
    ) -> Result<()> {
        self.0
            .register_poll(offset, mask, value, not_equal, timeout_action)
    }

    fn write_memory(&mut self, pages: &[PageInfo], data: &[u8], hint: DataHint) -> Result<()> {
        self.0.write_memory(pages, data, hint)
    }

    fn read_memory(&mut self, pages: &[PageInfo], out: &mut [u8]) -> Result<()> {
        self.0.read_memory(pages, out)
    }

    fn expect_memory(
        &mut self,
        pages: &[PageInfo],
        expected: &[u8],
        op: CompareOp,
    ) -> Result<()> {
        self.0.expect_memory(pages, expected, op)
    }

    fn write_gtt(&mut self, index: u32, value: u64) -> Result<()> {
        self.0.write_gtt(index, value)
    }

    fn read_pci_cfg(&mut self, function: PciAddress, offset: u32) -> Result<u32> {
        self.0.read_pci_cfg(function, offset)
    }

    fn write_pci_cfg(&mut self, function: PciAddress, offset: u32, value: u32) -> Result<()> {
        self.0.write_pci_cfg(function, offset, value)
    }

    fn reserve_contiguous(&mut self, address: u64, size: u64, bank: MemoryBank) -> Result<()> {
        self.0.reserve_contiguous(address, size, bank)
    }

    fn comment(&mut self, text: &str) -> Result<()> {
        self.0.comment(text)
    }

    fn declare_context(&mut self, context: &ContextDeclaration) -> Result<()> {
        self.0.declare_context(context)
    }

    fn dump_buffer(
        &mut self,
        address: u64,
        size: u64,
        bank: MemoryBank,
        file_name: &str,
    ) -> Result<()> {
        self.0.dump_buffer(address, size, bank, file_name)
    }

    fn dump_surface(&mut self, surface: &SurfaceDump) -> Result<()> {
        self.0.dump_surface(surface)
    }

    fn close(&mut self) -> Result<()> {
        self.0.close()
    }
}
