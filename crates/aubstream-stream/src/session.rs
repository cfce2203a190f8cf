use std::sync::Arc;

use aubstream_paging::{
    map_range, AllocParams, EntryWrite, Mapping, PageTable, PpgttLayout, DEFAULT_GGTT_SIZE,
    TABLE_ENTRY_SIZE,
};
use aubstream_phys::{
    HostBackedAllocator, PhysicalAllocator, SimplePhysicalAllocator, DEFAULT_BANK_SIZE,
};
use aubstream_types::{DataHint, GpuDescriptor, MemoryBank, PageInfo, ProductFamily};

use crate::{
    AubStream, GpuRegistry, MirrorStream, Result, SessionConfig, SessionMode, Stream, StreamMode,
    TbxShmStream, TbxStream,
};

/// Publishes the entry writes of `mapping`, then writes `data` into its pages.
///
/// Table entries go out with [`DataHint::PAGE_TABLE`]; GGTT slots go out as GTT writes.
pub fn write_mapped(
    stream: &mut dyn Stream,
    mapping: &Mapping,
    data: &[u8],
    hint: DataHint,
) -> Result<()> {
    for entry in &mapping.entries {
        match *entry {
            EntryWrite::Memory {
                address,
                value,
                bank,
            } => {
                let page = PageInfo::new(address, TABLE_ENTRY_SIZE as usize, bank);
                stream.write_memory(&[page], &value.to_le_bytes(), DataHint::PAGE_TABLE)?;
            }
            EntryWrite::Gtt { index, value } => stream.write_gtt(index, value)?,
        }
    }
    stream.write_memory(&mapping.pages, data, hint)
}

/// One device's worth of backends, allocator and descriptor.
pub struct Session {
    mode: SessionMode,
    gpu: Arc<dyn GpuDescriptor>,
    allocator: Arc<dyn PhysicalAllocator>,
    stream: Box<dyn Stream>,
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.mode)
            .field("gpu", &self.gpu)
            .field("stream_mode", &self.stream.stream_mode())
            .finish()
    }
}

impl Session {
    /// Looks up `family` in `registry` and opens the backends `config` selects.
    ///
    /// Trace backends get their version record (carrying `stepping`) here; simulator backends
    /// connect and complete the handshake.
    pub fn open(
        config: &SessionConfig,
        registry: &GpuRegistry,
        family: ProductFamily,
        stepping: u32,
    ) -> Result<Self> {
        let gpu = registry.lookup(family)?;
        let phys = SimplePhysicalAllocator::new(gpu.local_memory_banks(), DEFAULT_BANK_SIZE);
        let policy = config.policy;

        let session = match config.mode {
            SessionMode::Aub => {
                let stream = AubStream::create(&config.aub_file, gpu.as_ref(), stepping, policy)?;
                Self::from_parts(config.mode, gpu, Arc::new(phys), Box::new(stream))
            }
            SessionMode::Tbx => {
                let stream = TbxStream::connect(&config.tbx, policy)?;
                Self::from_parts(config.mode, gpu, Arc::new(phys), Box::new(stream))
            }
            SessionMode::AubTbx => {
                let recorder =
                    AubStream::create(&config.aub_file, gpu.as_ref(), stepping, policy)?;
                let live = TbxStream::connect(&config.tbx, policy)?;
                let stream = MirrorStream::new(recorder, live);
                Self::from_parts(config.mode, gpu, Arc::new(phys), Box::new(stream))
            }
            SessionMode::TbxShm => {
                let memory = Arc::new(HostBackedAllocator::new(phys));
                let stream = TbxShmStream::connect(&config.tbx, Arc::clone(&memory), policy)?;
                Self::from_parts(config.mode, gpu, memory, Box::new(stream))
            }
        };
        tracing::info!(
            mode = config.mode.as_str(),
            %family,
            stepping,
            "session opened"
        );
        Ok(session)
    }

    /// Assembles a session around an already opened stream.
    pub fn from_parts(
        mode: SessionMode,
        gpu: Arc<dyn GpuDescriptor>,
        allocator: Arc<dyn PhysicalAllocator>,
        stream: Box<dyn Stream>,
    ) -> Self {
        Self {
            mode,
            gpu,
            allocator,
            stream,
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn gpu(&self) -> &Arc<dyn GpuDescriptor> {
        &self.gpu
    }

    pub fn allocator(&self) -> &Arc<dyn PhysicalAllocator> {
        &self.allocator
    }

    pub fn stream(&mut self) -> &mut dyn Stream {
        &mut *self.stream
    }

    pub fn stream_mode(&self) -> StreamMode {
        self.stream.stream_mode()
    }

    pub fn new_ggtt(&self) -> PageTable {
        PageTable::ggtt(
            Arc::clone(&self.gpu),
            Arc::clone(&self.allocator),
            DEFAULT_GGTT_SIZE,
        )
    }

    /// A per-process table sized for the device's virtual address width.
    pub fn new_ppgtt(&self, bank: MemoryBank) -> Result<PageTable> {
        let layout = PpgttLayout::for_address_bits(self.gpu.ppgtt_address_bits())?;
        Ok(PageTable::ppgtt(
            Arc::clone(&self.gpu),
            Arc::clone(&self.allocator),
            layout,
            bank,
        )?)
    }

    /// Maps `[gpu_va, gpu_va + data.len())` under `root` and writes `data` through it.
    pub fn map_and_write(
        &mut self,
        root: &mut PageTable,
        gpu_va: u64,
        data: &[u8],
        bank: MemoryBank,
        params: AllocParams,
        hint: DataHint,
    ) -> Result<Mapping> {
        let mapping = map_range(root, gpu_va, data.len() as u64, bank, params)?;
        write_mapped(&mut *self.stream, &mapping, data, hint)?;
        Ok(mapping)
    }

    pub fn close(&mut self) -> Result<()> {
        tracing::info!(mode = self.mode.as_str(), "closing session");
        self.stream.close()
    }
}
