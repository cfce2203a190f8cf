use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use aubstream_types::MemoryBank;

use crate::{effective_alignment, AllocError, PhysicalAllocator, Result, MIN_ALIGNMENT};

#[derive(Debug)]
struct HeapBlock {
    storage: Box<[u8]>,
    offset: usize,
    size: usize,
}

impl HeapBlock {
    fn bytes(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.size]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.size]
    }
}

/// Hands out real, zeroed host memory; the "physical" address is the host address.
///
/// For consumers that map the simulated physical space onto process memory and need to reach
/// the bytes behind an address. Banks are accepted but not partitioned: every reservation comes
/// from the host heap.
#[derive(Debug, Default)]
pub struct HeapPhysicalAllocator {
    blocks: Mutex<BTreeMap<u64, HeapBlock>>,
}

impl HeapPhysicalAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_blocks(&self) -> usize {
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Copies the bytes at `address` into `dst`. The range must lie inside one reservation.
    pub fn read(&self, address: u64, dst: &mut [u8]) -> Result<()> {
        let blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        let (offset, block) = find_block(&blocks, address, dst.len())?;
        dst.copy_from_slice(&block.bytes()[offset..offset + dst.len()]);
        Ok(())
    }

    /// Copies `src` to `address`. The range must lie inside one reservation.
    pub fn write(&self, address: u64, src: &[u8]) -> Result<()> {
        let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        let (base, offset) = {
            let (offset, _) = find_block(&blocks, address, src.len())?;
            (address - offset as u64, offset)
        };
        let Some(block) = blocks.get_mut(&base) else {
            return Err(unmapped(address, src.len()));
        };
        block.bytes_mut()[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}

fn unmapped(address: u64, len: usize) -> AllocError {
    AllocError::Unmapped {
        bank: MemoryBank::SYSTEM,
        address,
        len,
    }
}

/// Returns the offset of `address` inside its block and the block itself.
fn find_block(
    blocks: &BTreeMap<u64, HeapBlock>,
    address: u64,
    len: usize,
) -> Result<(usize, &HeapBlock)> {
    let (&base, block) = blocks
        .range(..=address)
        .next_back()
        .ok_or_else(|| unmapped(address, len))?;
    let offset = usize::try_from(address - base).map_err(|_| unmapped(address, len))?;
    match offset.checked_add(len) {
        Some(end) if end <= block.size => Ok((offset, block)),
        _ => Err(unmapped(address, len)),
    }
}

impl PhysicalAllocator for HeapPhysicalAllocator {
    fn reserve(&self, bank: MemoryBank, size: u64, alignment: u64) -> Result<u64> {
        if size == 0 {
            return Err(AllocError::ZeroSize { bank });
        }
        let alignment = effective_alignment(alignment, MIN_ALIGNMENT)?;
        let out_of_memory = || AllocError::OutOfMemory {
            bank,
            size,
            alignment,
        };
        let size_usize = usize::try_from(size).map_err(|_| out_of_memory())?;
        let align_usize = usize::try_from(alignment).map_err(|_| out_of_memory())?;
        let capacity = size_usize
            .checked_add(align_usize)
            .ok_or_else(out_of_memory)?;

        // Over-allocate and place the block at the first aligned address inside the buffer; the
        // boxed slice never moves, so the address stays valid until the block is freed.
        let storage = vec![0u8; capacity].into_boxed_slice();
        let base = storage.as_ptr() as usize;
        let offset = (align_usize - base % align_usize) % align_usize;
        let address = (base + offset) as u64;

        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                address,
                HeapBlock {
                    storage,
                    offset,
                    size: size_usize,
                },
            );
        Ok(address)
    }

    fn free(&self, _bank: MemoryBank, address: u64) {
        let removed = self
            .blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address);
        if removed.is_none() {
            tracing::warn!(address, "free of unknown heap block");
        }
    }
}
