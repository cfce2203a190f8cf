use core::fmt;

pub const PAGE_SIZE_4K: u64 = 0x1000;
pub const PAGE_SIZE_2M: u64 = 0x20_0000;

/// Local banks are selected by a one-hot `u32` mask.
pub const MAX_LOCAL_BANKS: u32 = 32;

/// A physical memory pool.
///
/// `0` is system memory. Any other value is a bitmask; a well-formed local bank has exactly one
/// bit set. Malformed masks can be represented (they come from callers) but allocators reject
/// them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MemoryBank(u32);

impl MemoryBank {
    pub const SYSTEM: Self = Self(0);

    pub const fn from_mask(mask: u32) -> Self {
        Self(mask)
    }

    /// Local bank `index` (mask `1 << index`).
    pub fn local(index: u32) -> Self {
        assert!(index < MAX_LOCAL_BANKS, "local bank index {index} out of range");
        Self(1 << index)
    }

    pub const fn mask(self) -> u32 {
        self.0
    }

    pub const fn is_system(self) -> bool {
        self.0 == 0
    }

    pub const fn is_local(self) -> bool {
        self.0 != 0
    }

    pub const fn is_one_hot(self) -> bool {
        self.0.is_power_of_two()
    }

    /// Index of the selected local bank, or `None` for system memory and malformed masks.
    pub fn local_index(self) -> Option<u32> {
        self.is_one_hot().then(|| self.0.trailing_zeros())
    }
}

impl fmt::Debug for MemoryBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_system() {
            f.write_str("MemoryBank::SYSTEM")
        } else {
            write!(f, "MemoryBank(0x{:x})", self.0)
        }
    }
}

impl fmt::Display for MemoryBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local_index() {
            _ if self.is_system() => f.write_str("system"),
            Some(index) => write!(f, "local{index}"),
            None => write!(f, "bank-mask 0x{:x}", self.0),
        }
    }
}

/// One physically contiguous piece of a write.
///
/// A logical write that spans several physical pages is described by an ordered list of these;
/// the data buffer that accompanies the list is consumed front to back, `size` bytes per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub phys_address: u64,
    pub size: usize,
    pub bank: MemoryBank,
}

impl PageInfo {
    pub fn new(phys_address: u64, size: usize, bank: MemoryBank) -> Self {
        Self {
            phys_address,
            size,
            bank,
        }
    }

    pub fn is_local(&self) -> bool {
        self.bank.is_local()
    }

    /// Sum of `size` over `pages`.
    pub fn total_size(pages: &[PageInfo]) -> usize {
        pages.iter().map(|page| page.size).sum()
    }
}

/// Caller-supplied hint describing what a block of memory holds.
///
/// Backends pass it through untouched (trace records carry it, the simulator receives it as the
/// memory type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataHint(pub u8);

impl DataHint {
    pub const NONE: Self = Self(0);
    pub const BATCH_BUFFER: Self = Self(1);
    pub const CONTEXT_IMAGE: Self = Self(2);
    pub const PAGE_TABLE: Self = Self(3);
    pub const RING_BUFFER: Self = Self(4);
    pub const SURFACE: Self = Self(5);
}
