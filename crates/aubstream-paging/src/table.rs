use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;

use aubstream_phys::PhysicalAllocator;
use aubstream_types::{GpuDescriptor, MemoryBank, TableLevel, PAGE_SIZE_2M, PAGE_SIZE_4K};

use crate::entry::compose_entry;
use crate::{EntryWrite, PagingError, PpgttLayout, Result};

pub const TABLE_ENTRY_SIZE: u64 = 8;

/// GGTT coverage when the caller does not choose one.
pub const DEFAULT_GGTT_SIZE: u64 = 0x1_0000_0000;

const TABLE_ENTRIES: usize = 512;

/// Allocation parameters that feed into entry-bit computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocParams {
    pub writable: bool,
    pub uncached: bool,
    /// Map with 2 MiB pages where the hierarchy allows it.
    pub large_pages: bool,
}

impl Default for AllocParams {
    fn default() -> Self {
        Self {
            writable: true,
            uncached: false,
            large_pages: false,
        }
    }
}

/// One node of a translation hierarchy.
///
/// A node exclusively owns its children. Dropping a node drops its subtree first and then returns
/// the node's own physical backing to the allocator, so no reservation outlives the table that
/// made it.
pub struct PageTable {
    level: TableLevel,
    entries: usize,
    address: Option<u64>,
    owns_backing: bool,
    bank: MemoryBank,
    params: AllocParams,
    children: BTreeMap<usize, Box<PageTable>>,
    allocator: Arc<dyn PhysicalAllocator>,
    gpu: Arc<dyn GpuDescriptor>,
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTable")
            .field("level", &self.level)
            .field("entries", &self.entries)
            .field("address", &self.address)
            .field("bank", &self.bank)
            .field("params", &self.params)
            .field("children", &self.children.len())
            .finish()
    }
}

impl PageTable {
    /// The global table. It has no storage of its own: its entries are published with GTT
    /// writes rather than memory writes.
    pub fn ggtt(
        gpu: Arc<dyn GpuDescriptor>,
        allocator: Arc<dyn PhysicalAllocator>,
        size: u64,
    ) -> Self {
        Self {
            level: TableLevel::Ggtt,
            entries: (size / PAGE_SIZE_4K) as usize,
            address: None,
            owns_backing: false,
            bank: MemoryBank::SYSTEM,
            params: AllocParams::default(),
            children: BTreeMap::new(),
            allocator,
            gpu,
        }
    }

    /// Root of a per-process table, backed in `bank`.
    pub fn ppgtt(
        gpu: Arc<dyn GpuDescriptor>,
        allocator: Arc<dyn PhysicalAllocator>,
        layout: PpgttLayout,
        bank: MemoryBank,
    ) -> Result<Self> {
        Self::table(
            gpu,
            allocator,
            layout.root_level(),
            layout.root_entries(),
            bank,
            AllocParams::default(),
        )
    }

    fn table(
        gpu: Arc<dyn GpuDescriptor>,
        allocator: Arc<dyn PhysicalAllocator>,
        level: TableLevel,
        entries: usize,
        bank: MemoryBank,
        params: AllocParams,
    ) -> Result<Self> {
        let size = (entries as u64 * TABLE_ENTRY_SIZE).max(PAGE_SIZE_4K);
        let address = allocator.reserve(bank, size, PAGE_SIZE_4K)?;
        tracing::trace!(?level, address, %bank, "allocated page table");
        Ok(Self {
            level,
            entries,
            address: Some(address),
            owns_backing: true,
            bank,
            params,
            children: BTreeMap::new(),
            allocator,
            gpu,
        })
    }

    /// A data page of `level` (`Page4K` or `Page2M`), reserved from the allocator.
    pub fn data_page(
        gpu: Arc<dyn GpuDescriptor>,
        allocator: Arc<dyn PhysicalAllocator>,
        level: TableLevel,
        bank: MemoryBank,
        params: AllocParams,
    ) -> Result<Self> {
        let size = data_page_size(level).ok_or(PagingError::InvalidChild {
            level: TableLevel::Pt,
            child: level,
        })?;
        let address = allocator.reserve(bank, size, size)?;
        Ok(Self {
            level,
            entries: 0,
            address: Some(address),
            owns_backing: true,
            bank,
            params,
            children: BTreeMap::new(),
            allocator,
            gpu,
        })
    }

    /// A data page at an address the caller already owns; it is not freed on drop.
    pub fn wrap_data_page(
        gpu: Arc<dyn GpuDescriptor>,
        allocator: Arc<dyn PhysicalAllocator>,
        level: TableLevel,
        address: u64,
        bank: MemoryBank,
        params: AllocParams,
    ) -> Self {
        Self {
            level,
            entries: 0,
            address: Some(address),
            owns_backing: false,
            bank,
            params,
            children: BTreeMap::new(),
            allocator,
            gpu,
        }
    }

    /// Creates a node suitable as a child of `self`, sharing its allocator and GPU descriptor.
    ///
    /// Only data pages are placed in `page_bank` with `params`. Intermediate tables always live
    /// in the bank of the table above them, so a whole hierarchy shares its root's bank.
    pub(crate) fn new_child(
        &self,
        level: TableLevel,
        page_bank: MemoryBank,
        params: AllocParams,
    ) -> Result<Self> {
        if level.is_data_page() {
            Self::data_page(
                self.gpu.clone(),
                self.allocator.clone(),
                level,
                page_bank,
                params,
            )
        } else {
            Self::table(
                self.gpu.clone(),
                self.allocator.clone(),
                level,
                TABLE_ENTRIES,
                self.bank,
                AllocParams::default(),
            )
        }
    }

    pub fn level(&self) -> TableLevel {
        self.level
    }

    pub fn entry_count(&self) -> usize {
        self.entries
    }

    pub fn physical_address(&self) -> Option<u64> {
        self.address
    }

    pub fn bank(&self) -> MemoryBank {
        self.bank
    }

    pub fn params(&self) -> AllocParams {
        self.params
    }

    pub fn gpu(&self) -> &Arc<dyn GpuDescriptor> {
        &self.gpu
    }

    /// Bytes of virtual address space covered by one entry of this node.
    pub fn entry_span(&self) -> u64 {
        1u64 << self.level.shift()
    }

    /// Bytes of virtual address space covered by the whole node.
    pub fn span(&self) -> u64 {
        self.entry_span() * self.entries as u64
    }

    pub fn index_of(&self, gpu_va: u64) -> usize {
        if self.entries == 0 {
            return 0;
        }
        ((gpu_va >> self.level.shift()) % self.entries as u64) as usize
    }

    pub fn child(&self, index: usize) -> Option<&PageTable> {
        self.children.get(&index).map(Box::as_ref)
    }

    pub fn child_mut(&mut self, index: usize) -> Option<&mut PageTable> {
        self.children.get_mut(&index).map(Box::as_mut)
    }

    /// Populated slots, in index order.
    pub fn children(&self) -> impl Iterator<Item = (usize, &PageTable)> {
        self.children.iter().map(|(&index, child)| (index, child.as_ref()))
    }

    /// Installs `child` at `index`, returning whatever was there.
    pub fn set_child(&mut self, index: usize, child: PageTable) -> Result<Option<Box<PageTable>>> {
        if index >= self.entries {
            return Err(PagingError::IndexOutOfRange {
                level: self.level,
                index,
                entries: self.entries,
            });
        }
        if !accepts_child(self.level, child.level) {
            return Err(PagingError::InvalidChild {
                level: self.level,
                child: child.level,
            });
        }
        Ok(self.children.insert(index, Box::new(child)))
    }

    pub fn take_child(&mut self, index: usize) -> Option<Box<PageTable>> {
        self.children.remove(&index)
    }

    /// The value a parent stores to reference this node.
    pub fn entry_value(&self) -> Result<u64> {
        self.compose(self.level)
    }

    /// The value `self` stores to reference `child`.
    ///
    /// GGTT slots are composed as [`TableLevel::Ggtt`] so the descriptor can tell them apart
    /// from per-process page entries.
    pub fn child_entry_value(&self, child: &PageTable) -> Result<u64> {
        if self.level == TableLevel::Ggtt {
            child.compose(TableLevel::Ggtt)
        } else {
            child.entry_value()
        }
    }

    fn compose(&self, level: TableLevel) -> Result<u64> {
        let address = self
            .address
            .ok_or(PagingError::NoBacking { level: self.level })?;
        compose_entry(
            self.gpu.as_ref(),
            level,
            address,
            self.bank,
            self.params.writable,
            self.params.uncached,
        )
    }

    /// Describes the write that stores `value` in entry `index` of this node.
    pub(crate) fn entry_write(&self, index: usize, value: u64) -> EntryWrite {
        match self.address {
            Some(base) => EntryWrite::Memory {
                address: base + index as u64 * TABLE_ENTRY_SIZE,
                value,
                bank: self.bank,
            },
            None => EntryWrite::Gtt {
                index: index as u32,
                value,
            },
        }
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        self.children.clear();
        if self.owns_backing {
            if let Some(address) = self.address.take() {
                self.allocator.free(self.bank, address);
            }
        }
    }
}

pub(crate) fn data_page_size(level: TableLevel) -> Option<u64> {
    match level {
        TableLevel::Page4K => Some(PAGE_SIZE_4K),
        TableLevel::Page2M => Some(PAGE_SIZE_2M),
        _ => None,
    }
}

fn accepts_child(parent: TableLevel, child: TableLevel) -> bool {
    matches!(
        (parent, child),
        (TableLevel::Ggtt, TableLevel::Page4K)
            | (TableLevel::Pml4, TableLevel::Pdp)
            | (TableLevel::Pdp, TableLevel::Pd)
            | (TableLevel::Pd, TableLevel::Pt)
            | (TableLevel::Pd, TableLevel::Page2M)
            | (TableLevel::Pt, TableLevel::Page4K)
    )
}
