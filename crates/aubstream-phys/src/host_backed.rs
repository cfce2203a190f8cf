use core::ops::Range;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use aubstream_types::{MemoryBank, PAGE_SIZE_4K};

use crate::{AllocError, PhysicalAllocator, Result, SimplePhysicalAllocator};

const PAGE: u64 = PAGE_SIZE_4K;

/// A run of bytes that is contiguous both physically and in host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRun {
    pub host_address: usize,
    pub len: usize,
}

#[derive(Debug)]
struct HostBuffer {
    storage: Box<[u8]>,
    offset: usize,
    len: usize,
}

impl HostBuffer {
    fn new(pages: u64) -> Self {
        let len = (pages * PAGE) as usize;
        let storage = vec![0u8; len + PAGE as usize].into_boxed_slice();
        let base = storage.as_ptr() as usize;
        let offset = (PAGE as usize - base % PAGE as usize) % PAGE as usize;
        Self {
            storage,
            offset,
            len,
        }
    }

    fn host_address(&self) -> usize {
        self.storage.as_ptr() as usize + self.offset
    }

    fn bytes(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }
}

#[derive(Debug, Default)]
struct HostTable {
    /// `(bank mask, physical page number)` → host address of that page.
    pages: HashMap<(u32, u64), usize>,
    /// `(bank mask, physical start)` → backing buffer of one reservation.
    buffers: BTreeMap<(u32, u64), HostBuffer>,
}

impl HostTable {
    /// The reservation containing `address`, with the offset of `address` inside it.
    fn locate(&mut self, bank: MemoryBank, address: u64) -> Option<(usize, &mut HostBuffer)> {
        let key = (bank.mask(), address);
        let (&(mask, start), buffer) = self.buffers.range_mut(..=key).next_back()?;
        if mask != bank.mask() {
            return None;
        }
        let offset = usize::try_from(address - start).ok()?;
        (offset < buffer.len).then_some((offset, buffer))
    }
}

/// Physical allocation mirrored into host memory, page by page.
///
/// Every reservation is backed by zeroed, page-aligned host memory, and every physical page of it
/// is recorded in a translation table. Backends that share memory with the simulator use
/// [`HostBackedAllocator::translate`] to find host runs, or [`HostBackedAllocator::read`] /
/// [`HostBackedAllocator::write`] to move bytes without a round trip over the wire.
#[derive(Debug)]
pub struct HostBackedAllocator {
    phys: SimplePhysicalAllocator,
    table: Mutex<HostTable>,
}

impl HostBackedAllocator {
    /// # Panics
    /// Panics if `phys` hands out reservations finer than a 4 KiB page, since two of them could
    /// then share one translated page.
    pub fn new(phys: SimplePhysicalAllocator) -> Self {
        assert!(
            phys.granularity() >= PAGE,
            "host-backed memory needs page-granular reservations, got 0x{:x}",
            phys.granularity()
        );
        Self {
            phys,
            table: Mutex::default(),
        }
    }

    pub fn mapped_pages(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pages
            .len()
    }

    /// Host location of `phys` and the length of the run that stays contiguous in both address
    /// spaces, capped at `size`.
    pub fn translate(&self, phys: u64, size: usize, bank: MemoryBank) -> Option<HostRun> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let page = phys / PAGE;
        let offset = (phys % PAGE) as usize;
        let first_host = *table.pages.get(&(bank.mask(), page))?;

        let mut len = (PAGE as usize - offset).min(size);
        let mut prev_host = first_host;
        let mut next_page = page + 1;
        while len < size {
            match table.pages.get(&(bank.mask(), next_page)) {
                Some(&host) if host == prev_host + PAGE as usize => {
                    len += (PAGE as usize).min(size - len);
                    prev_host = host;
                    next_page += 1;
                }
                _ => break,
            }
        }

        Some(HostRun {
            host_address: first_host + offset,
            len,
        })
    }

    /// Copies host-backed bytes starting at `phys` into `dst`, crossing reservations as needed.
    pub fn read(&self, bank: MemoryBank, phys: u64, dst: &mut [u8]) -> Result<()> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let mut done = 0;
        while done < dst.len() {
            let address = phys + done as u64;
            let (offset, buffer) = table.locate(bank, address).ok_or(AllocError::Unmapped {
                bank,
                address,
                len: dst.len() - done,
            })?;
            let n = (buffer.len - offset).min(dst.len() - done);
            dst[done..done + n].copy_from_slice(&buffer.bytes()[offset..offset + n]);
            done += n;
        }
        Ok(())
    }

    /// Copies `src` into host-backed memory starting at `phys`.
    pub fn write(&self, bank: MemoryBank, phys: u64, src: &[u8]) -> Result<()> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let mut done = 0;
        while done < src.len() {
            let address = phys + done as u64;
            let (offset, buffer) = table.locate(bank, address).ok_or(AllocError::Unmapped {
                bank,
                address,
                len: src.len() - done,
            })?;
            let n = (buffer.len - offset).min(src.len() - done);
            buffer.bytes_mut()[offset..offset + n].copy_from_slice(&src[done..done + n]);
            done += n;
        }
        Ok(())
    }
}

impl PhysicalAllocator for HostBackedAllocator {
    fn reserve(&self, bank: MemoryBank, size: u64, alignment: u64) -> Result<u64> {
        let phys = self.phys.reserve(bank, size, alignment)?;
        let pages = size.div_ceil(PAGE);
        let buffer = HostBuffer::new(pages);
        let host = buffer.host_address();

        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        for i in 0..pages {
            table
                .pages
                .insert((bank.mask(), phys / PAGE + i), host + (i * PAGE) as usize);
        }
        table.buffers.insert((bank.mask(), phys), buffer);
        Ok(phys)
    }

    fn free(&self, bank: MemoryBank, address: u64) {
        {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(buffer) = table.buffers.remove(&(bank.mask(), address)) {
                let pages = buffer.len as u64 / PAGE;
                for i in 0..pages {
                    table.pages.remove(&(bank.mask(), address / PAGE + i));
                }
            }
        }
        self.phys.free(bank, address);
    }

    fn bank_region(&self, bank: MemoryBank) -> Option<Range<u64>> {
        self.phys.bank_region(bank)
    }
}
