use aubstream_types::{MemoryBank, PageInfo, TableLevel, PAGE_SIZE_2M, PAGE_SIZE_4K};

use crate::table::data_page_size;
use crate::{AllocParams, PageTable, PagingError, Result};

/// A table entry the caller must publish before the mapping is visible to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryWrite {
    /// An 8-byte entry stored in a backed table.
    Memory {
        address: u64,
        value: u64,
        bank: MemoryBank,
    },
    /// A GGTT slot, published through a GTT write.
    Gtt { index: u32, value: u64 },
}

impl EntryWrite {
    pub fn value(&self) -> u64 {
        match *self {
            EntryWrite::Memory { value, .. } | EntryWrite::Gtt { value, .. } => value,
        }
    }
}

/// Result of [`map_range`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mapping {
    /// Backing of the requested range, in virtual address order.
    pub pages: Vec<PageInfo>,
    /// Entries created during the walk, parents before children.
    pub entries: Vec<EntryWrite>,
}

/// Makes `[gpu_va, gpu_va + size)` resident under `root`.
///
/// Missing tables and data pages are allocated on the way down. Pages that already exist are
/// reused, so mapping the same range twice yields the same physical pages and no entry writes
/// the second time. A reused page keeps the bank it was allocated in, whatever `bank` asks for.
///
/// On error every node this call installed is removed again, so a retry republishes the whole
/// path.
pub fn map_range(
    root: &mut PageTable,
    gpu_va: u64,
    size: u64,
    bank: MemoryBank,
    params: AllocParams,
) -> Result<Mapping> {
    let mut mapping = Mapping::default();
    if size == 0 {
        return Ok(mapping);
    }
    let end = gpu_va
        .checked_add(size)
        .filter(|&end| end <= root.span())
        .ok_or(PagingError::AddressOutOfRange {
            address: gpu_va,
            size,
        })?;

    let leaf = if params.large_pages && root.level() != TableLevel::Ggtt {
        TableLevel::Page2M
    } else {
        TableLevel::Page4K
    };
    let page_size = data_page_size(leaf).unwrap_or(PAGE_SIZE_4K);

    let mut installed = Vec::new();
    let mut page_va = gpu_va & !(page_size - 1);
    while page_va < end {
        let walk = Walk {
            gpu_va: page_va,
            leaf,
            bank,
            params,
        };
        let (page_phys, page_bank) =
            match ensure_page(root, &walk, &mut mapping.entries, &mut installed) {
                Ok(page) => page,
                Err(err) => {
                    rollback(root, &installed);
                    return Err(err);
                }
            };
        let start = gpu_va.max(page_va);
        let stop = end.min(page_va + page_size);
        mapping.pages.push(PageInfo::new(
            page_phys + (start - page_va),
            (stop - start) as usize,
            page_bank,
        ));
        page_va += page_size;
    }

    tracing::trace!(
        gpu_va,
        size,
        pages = mapping.pages.len(),
        entries = mapping.entries.len(),
        "mapped range"
    );
    Ok(mapping)
}

struct Walk {
    gpu_va: u64,
    leaf: TableLevel,
    bank: MemoryBank,
    params: AllocParams,
}

/// A slot filled during the current call: the child of the `parent`-level node on the path to
/// `gpu_va`.
struct Installed {
    gpu_va: u64,
    parent: TableLevel,
}

fn ensure_page(
    node: &mut PageTable,
    walk: &Walk,
    entries: &mut Vec<EntryWrite>,
    installed: &mut Vec<Installed>,
) -> Result<(u64, MemoryBank)> {
    let index = node.index_of(walk.gpu_va);
    let wanted = child_level(node.level(), walk.leaf);

    if node.child(index).is_none() {
        let child = node.new_child(wanted, walk.bank, walk.params)?;
        let value = node.child_entry_value(&child)?;
        let write = node.entry_write(index, value);
        node.set_child(index, child)?;
        entries.push(write);
        installed.push(Installed {
            gpu_va: walk.gpu_va,
            parent: node.level(),
        });
    }

    let level = node.level();
    let child = node
        .child_mut(index)
        .ok_or(PagingError::NoBacking { level: wanted })?;
    if child.level() != wanted {
        return Err(PagingError::InvalidChild {
            level,
            child: child.level(),
        });
    }
    if child.level().is_data_page() {
        let phys = child
            .physical_address()
            .ok_or(PagingError::NoBacking { level: wanted })?;
        return Ok((phys, child.bank()));
    }
    ensure_page(child, walk, entries, installed)
}

/// Removes the slots filled by a failed call, deepest first.
fn rollback(root: &mut PageTable, installed: &[Installed]) {
    for slot in installed.iter().rev() {
        if let Some(parent) = find_table_mut(root, slot.gpu_va, slot.parent) {
            let index = parent.index_of(slot.gpu_va);
            parent.take_child(index);
        }
    }
    if !installed.is_empty() {
        tracing::debug!(nodes = installed.len(), "rolled back partial mapping");
    }
}

fn find_table_mut(root: &mut PageTable, gpu_va: u64, level: TableLevel) -> Option<&mut PageTable> {
    let mut node = root;
    loop {
        if node.level() == level {
            return Some(node);
        }
        let index = node.index_of(gpu_va);
        node = node.child_mut(index)?;
    }
}

fn child_level(parent: TableLevel, leaf: TableLevel) -> TableLevel {
    match parent {
        TableLevel::Ggtt | TableLevel::Pt => TableLevel::Page4K,
        TableLevel::Pd if leaf == TableLevel::Page2M => TableLevel::Page2M,
        other => other.next_table().unwrap_or(TableLevel::Page4K),
    }
}

/// Looks up the physical address `gpu_va` maps to, without allocating.
pub fn translate(root: &PageTable, gpu_va: u64) -> Option<u64> {
    if gpu_va >= root.span() {
        return None;
    }
    let mut node = root;
    loop {
        let child = node.child(node.index_of(gpu_va))?;
        if child.level().is_data_page() {
            let page_size = match child.level() {
                TableLevel::Page2M => PAGE_SIZE_2M,
                _ => PAGE_SIZE_4K,
            };
            return Some(child.physical_address()? + (gpu_va & (page_size - 1)));
        }
        node = child;
    }
}
