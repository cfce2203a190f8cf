use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use aubstream_aub::CompareOp;
use aubstream_phys::HostBackedAllocator;
use aubstream_tbx::{PciAddress, TbxClient, TbxConfig};
use aubstream_types::{DataHint, FailurePolicy, PageInfo};

use crate::{check_compare, page_chunks, page_chunks_mut, Result, Stream, StreamMode};

/// Spins on `read` until the masked register satisfies the condition.
///
/// There is no timeout; a register that never settles blocks the caller.
fn poll_register(
    mut read: impl FnMut() -> Result<u32>,
    mask: u32,
    value: u32,
    not_equal: bool,
) -> Result<()> {
    let mut attempts = 0u64;
    loop {
        let current = read()? & mask;
        attempts += 1;
        if (current == value) != not_equal {
            tracing::trace!(attempts, current, "register poll satisfied");
            return Ok(());
        }
    }
}

/// Forwards every operation to a remote simulator.
pub struct TbxStream<T = TcpStream> {
    client: TbxClient<T>,
}

impl TbxStream {
    pub fn connect(config: &TbxConfig, policy: FailurePolicy) -> Result<Self> {
        Ok(Self::from_client(TbxClient::connect(config, policy)?))
    }
}

impl<T> TbxStream<T> {
    pub fn from_client(client: TbxClient<T>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &TbxClient<T> {
        &self.client
    }
}

impl<T: Read + Write + Send> Stream for TbxStream<T> {
    fn stream_mode(&self) -> StreamMode {
        StreamMode::TBX
    }

    fn write_mmio(&mut self, offset: u32, value: u32) -> Result<()> {
        Ok(self.client.write_mmio(offset, value)?)
    }

    fn read_mmio(&mut self, offset: u32) -> Result<u32> {
        Ok(self.client.read_mmio(offset)?)
    }

    fn register_poll(
        &mut self,
        offset: u32,
        mask: u32,
        value: u32,
        not_equal: bool,
        _timeout_action: u8,
    ) -> Result<()> {
        let client = &self.client;
        poll_register(|| Ok(client.read_mmio(offset)?), mask, value, not_equal)
    }

    fn write_memory(&mut self, pages: &[PageInfo], data: &[u8], _hint: DataHint) -> Result<()> {
        for (page, chunk) in page_chunks(pages, data)? {
            self.client
                .write_memory(page.phys_address, page.bank, chunk)?;
        }
        Ok(())
    }

    fn read_memory(&mut self, pages: &[PageInfo], out: &mut [u8]) -> Result<()> {
        for (page, chunk) in page_chunks_mut(pages, out)? {
            self.client.read_memory(page.phys_address, page.bank, chunk)?;
        }
        Ok(())
    }

    fn expect_memory(
        &mut self,
        pages: &[PageInfo],
        expected: &[u8],
        op: CompareOp,
    ) -> Result<()> {
        for (page, chunk) in page_chunks(pages, expected)? {
            let mut actual = vec![0u8; chunk.len()];
            self.client
                .read_memory(page.phys_address, page.bank, &mut actual)?;
            check_compare(page.phys_address, &actual, chunk, op)?;
        }
        Ok(())
    }

    fn write_gtt(&mut self, index: u32, value: u64) -> Result<()> {
        Ok(self.client.write_gtt(index, value)?)
    }

    fn read_pci_cfg(&mut self, function: PciAddress, offset: u32) -> Result<u32> {
        Ok(self.client.read_pci_cfg(function, offset)?)
    }

    fn write_pci_cfg(&mut self, function: PciAddress, offset: u32, value: u32) -> Result<()> {
        Ok(self.client.write_pci_cfg(function, offset, value)?)
    }

    fn close(&mut self) -> Result<()> {
        Ok(self.client.close()?)
    }
}

/// Simulator stream whose memory traffic stays in host memory.
///
/// MMIO, PCI and GTT operations still go over the wire; memory reads and writes go straight to
/// the host pages backing each physical reservation, which the simulator maps as shared memory.
pub struct TbxShmStream<T = TcpStream> {
    client: TbxClient<T>,
    memory: Arc<HostBackedAllocator>,
}

impl TbxShmStream {
    pub fn connect(
        config: &TbxConfig,
        memory: Arc<HostBackedAllocator>,
        policy: FailurePolicy,
    ) -> Result<Self> {
        Ok(Self::from_client(TbxClient::connect(config, policy)?, memory))
    }
}

impl<T> TbxShmStream<T> {
    pub fn from_client(client: TbxClient<T>, memory: Arc<HostBackedAllocator>) -> Self {
        Self { client, memory }
    }

    pub fn client(&self) -> &TbxClient<T> {
        &self.client
    }

    pub fn memory(&self) -> &Arc<HostBackedAllocator> {
        &self.memory
    }
}

impl<T: Read + Write + Send> Stream for TbxShmStream<T> {
    fn stream_mode(&self) -> StreamMode {
        StreamMode::TBX_SHM
    }

    fn write_mmio(&mut self, offset: u32, value: u32) -> Result<()> {
        Ok(self.client.write_mmio(offset, value)?)
    }

    fn read_mmio(&mut self, offset: u32) -> Result<u32> {
        Ok(self.client.read_mmio(offset)?)
    }

    fn register_poll(
        &mut self,
        offset: u32,
        mask: u32,
        value: u32,
        not_equal: bool,
        _timeout_action: u8,
    ) -> Result<()> {
        let client = &self.client;
        poll_register(|| Ok(client.read_mmio(offset)?), mask, value, not_equal)
    }

    fn write_memory(&mut self, pages: &[PageInfo], data: &[u8], _hint: DataHint) -> Result<()> {
        for (page, chunk) in page_chunks(pages, data)? {
            self.memory.write(page.bank, page.phys_address, chunk)?;
        }
        Ok(())
    }

    fn read_memory(&mut self, pages: &[PageInfo], out: &mut [u8]) -> Result<()> {
        for (page, chunk) in page_chunks_mut(pages, out)? {
            self.memory.read(page.bank, page.phys_address, chunk)?;
        }
        Ok(())
    }

    fn expect_memory(
        &mut self,
        pages: &[PageInfo],
        expected: &[u8],
        op: CompareOp,
    ) -> Result<()> {
        for (page, chunk) in page_chunks(pages, expected)? {
            let mut actual = vec![0u8; chunk.len()];
            self.memory.read(page.bank, page.phys_address, &mut actual)?;
            check_compare(page.phys_address, &actual, chunk, op)?;
        }
        Ok(())
    }

    fn write_gtt(&mut self, index: u32, value: u64) -> Result<()> {
        Ok(self.client.write_gtt(index, value)?)
    }

    fn read_pci_cfg(&mut self, function: PciAddress, offset: u32) -> Result<u32> {
        Ok(self.client.read_pci_cfg(function, offset)?)
    }

    fn write_pci_cfg(&mut self, function: PciAddress, offset: u32, value: u32) -> Result<()> {
        Ok(self.client.write_pci_cfg(function, offset, value)?)
    }

    fn close(&mut self) -> Result<()> {
        Ok(self.client.close()?)
    }
}
