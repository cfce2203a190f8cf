use core::ops::Range;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use aubstream_types::{MemoryBank, MAX_LOCAL_BANKS};

use crate::{align_up, effective_alignment, AllocError, PhysicalAllocator, Result, MIN_ALIGNMENT};

/// Size of each bank's region when the caller does not choose one (32 GiB).
pub const DEFAULT_BANK_SIZE: u64 = 0x8_0000_0000;

/// First address handed out from system memory; physical page 0 is never used.
pub const SYSTEM_MEMORY_START: u64 = 0x1000;

/// Bump allocator over one bank's region, with exact-size reuse of freed blocks.
#[derive(Debug)]
struct BankAllocator {
    bank: MemoryBank,
    region: Range<u64>,
    state: Mutex<BankState>,
}

#[derive(Debug)]
struct BankState {
    next: u64,
    /// Freed `(address, size)` pairs, oldest first.
    free: Vec<(u64, u64)>,
    /// Live reservations, address → size.
    used: BTreeMap<u64, u64>,
}

impl BankAllocator {
    fn new(bank: MemoryBank, region: Range<u64>, first: u64) -> Self {
        Self {
            bank,
            state: Mutex::new(BankState {
                next: first,
                free: Vec::new(),
                used: BTreeMap::new(),
            }),
            region,
        }
    }

    fn reserve(&self, size: u64, alignment: u64) -> Result<u64> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(pos) = state
            .free
            .iter()
            .position(|&(address, free_size)| free_size == size && address % alignment == 0)
        {
            let (address, _) = state.free.remove(pos);
            state.used.insert(address, size);
            tracing::trace!(bank = %self.bank, address, size, "reused freed block");
            return Ok(address);
        }

        let out_of_memory = AllocError::OutOfMemory {
            bank: self.bank,
            size,
            alignment,
        };
        let address = align_up(state.next, alignment).ok_or_else(|| out_of_memory.clone())?;
        let end = address.checked_add(size).ok_or_else(|| out_of_memory.clone())?;
        if end > self.region.end {
            return Err(out_of_memory);
        }

        state.next = end;
        state.used.insert(address, size);
        Ok(address)
    }

    fn free(&self, address: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.used.remove(&address) {
            Some(size) => state.free.push((address, size)),
            None => tracing::warn!(bank = %self.bank, address, "free of unknown physical address"),
        }
    }
}

/// Per-bank bump allocation over disjoint regions.
///
/// With a bank size `R`, system memory owns `[0, R)` (allocation starts at
/// [`SYSTEM_MEMORY_START`]) and local bank `i` owns `[(i + 1) * R, (i + 2) * R)`.
///
/// Not a general-purpose allocator: freed blocks are only reused by a later reservation of the
/// same size, and are never split or merged.
#[derive(Debug)]
pub struct SimplePhysicalAllocator {
    granularity: u64,
    system: BankAllocator,
    locals: Vec<BankAllocator>,
}

impl SimplePhysicalAllocator {
    pub fn new(local_banks: u32, bank_size: u64) -> Self {
        Self::with_granularity(local_banks, bank_size, MIN_ALIGNMENT)
    }

    /// Like [`SimplePhysicalAllocator::new`] with a custom minimum alignment.
    ///
    /// # Panics
    /// Panics if `granularity` is not a power of two, if `local_banks` exceeds
    /// [`MAX_LOCAL_BANKS`], or if the regions do not fit in 64 bits.
    pub fn with_granularity(local_banks: u32, bank_size: u64, granularity: u64) -> Self {
        assert!(granularity.is_power_of_two(), "granularity must be a power of two");
        assert!(
            local_banks <= MAX_LOCAL_BANKS,
            "at most {MAX_LOCAL_BANKS} local banks are supported"
        );
        assert!(
            bank_size > SYSTEM_MEMORY_START,
            "bank size 0x{bank_size:x} leaves no room for allocations"
        );

        assert!(
            bank_size.checked_mul(u64::from(local_banks) + 1).is_some(),
            "bank regions overflow the physical address space"
        );

        let region = |slot: u64| slot * bank_size..(slot + 1) * bank_size;

        let system = BankAllocator::new(MemoryBank::SYSTEM, region(0), SYSTEM_MEMORY_START);
        let locals = (0..local_banks)
            .map(|index| {
                let region = region(u64::from(index) + 1);
                let first = region.start;
                BankAllocator::new(MemoryBank::local(index), region, first)
            })
            .collect();

        Self {
            granularity,
            system,
            locals,
        }
    }

    /// Minimum alignment of every reservation.
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    pub fn local_bank_count(&self) -> u32 {
        self.locals.len() as u32
    }

    fn bank_allocator(&self, bank: MemoryBank) -> &BankAllocator {
        if bank.is_system() {
            return &self.system;
        }
        assert!(
            bank.is_one_hot(),
            "invalid memory bank mask 0x{:x}: exactly one bit must be set",
            bank.mask()
        );
        let index = bank.mask().trailing_zeros() as usize;
        assert!(
            index < self.locals.len(),
            "memory bank {bank} is not configured ({} local banks)",
            self.locals.len()
        );
        &self.locals[index]
    }
}

impl Default for SimplePhysicalAllocator {
    fn default() -> Self {
        Self::new(0, DEFAULT_BANK_SIZE)
    }
}

impl PhysicalAllocator for SimplePhysicalAllocator {
    fn reserve(&self, bank: MemoryBank, size: u64, alignment: u64) -> Result<u64> {
        let allocator = self.bank_allocator(bank);
        if size == 0 {
            return Err(AllocError::ZeroSize { bank });
        }
        let alignment = effective_alignment(alignment, self.granularity)?;
        allocator.reserve(size, alignment)
    }

    fn free(&self, bank: MemoryBank, address: u64) {
        self.bank_allocator(bank).free(address)
    }

    fn bank_region(&self, bank: MemoryBank) -> Option<Range<u64>> {
        Some(self.bank_allocator(bank).region.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BANK: u64 = 0x100_0000;

    #[test]
    fn system_allocation_skips_page_zero() {
        let alloc = SimplePhysicalAllocator::new(0, BANK);
        let a = alloc.reserve(MemoryBank::SYSTEM, 0x10, 0).unwrap();
        assert_eq!(a, SYSTEM_MEMORY_START);
        let b = alloc.reserve(MemoryBank::SYSTEM, 0x10, 0).unwrap();
        assert_eq!(b, 0x2000);
    }

    #[test]
    fn exact_size_free_list_reuse() {
        let alloc = SimplePhysicalAllocator::new(0, BANK);
        let a = alloc.reserve(MemoryBank::SYSTEM, 0x3000, 0).unwrap();
        let b = alloc.reserve(MemoryBank::SYSTEM, 0x1000, 0).unwrap();
        alloc.free(MemoryBank::SYSTEM, a);

        // Different size: bump allocation continues past `b`.
        let c = alloc.reserve(MemoryBank::SYSTEM, 0x2000, 0).unwrap();
        assert!(c > b);

        // Same size: the freed block comes back.
        let d = alloc.reserve(MemoryBank::SYSTEM, 0x3000, 0).unwrap();
        assert_eq!(d, a);
    }

    #[test]
    fn free_list_respects_alignment() {
        let alloc = SimplePhysicalAllocator::new(0, BANK);
        let a = alloc.reserve(MemoryBank::SYSTEM, 0x1000, 0).unwrap();
        assert_eq!(a % 0x20_0000, 0x1000);
        alloc.free(MemoryBank::SYSTEM, a);

        let b = alloc.reserve(MemoryBank::SYSTEM, 0x1000, 0x20_0000).unwrap();
        assert_ne!(b, a);
        assert_eq!(b % 0x20_0000, 0);
    }

    #[test]
    fn local_banks_are_disjoint() {
        let alloc = SimplePhysicalAllocator::new(2, BANK);
        let region0 = alloc.bank_region(MemoryBank::local(0)).unwrap();
        let region1 = alloc.bank_region(MemoryBank::local(1)).unwrap();
        assert_eq!(region0, BANK..2 * BANK);
        assert_eq!(region1, 2 * BANK..3 * BANK);

        let a = alloc.reserve(MemoryBank::local(0), 0x1000, 0).unwrap();
        let b = alloc.reserve(MemoryBank::local(1), 0x1000, 0).unwrap();
        assert!(region0.contains(&a));
        assert!(region1.contains(&b));
    }

    #[test]
    fn exhaustion_is_reported() {
        let alloc = SimplePhysicalAllocator::new(1, 0x4000);
        let bank = MemoryBank::local(0);
        for _ in 0..4 {
            alloc.reserve(bank, 0x1000, 0).unwrap();
        }
        assert_eq!(
            alloc.reserve(bank, 0x1000, 0),
            Err(AllocError::OutOfMemory {
                bank,
                size: 0x1000,
                alignment: 0x1000
            })
        );
    }

    #[test]
    fn zero_size_is_rejected() {
        let alloc = SimplePhysicalAllocator::default();
        assert_eq!(
            alloc.reserve(MemoryBank::SYSTEM, 0, 0),
            Err(AllocError::ZeroSize {
                bank: MemoryBank::SYSTEM
            })
        );
    }

    #[test]
    fn smaller_granularity_allows_finer_alignment() {
        let alloc = SimplePhysicalAllocator::with_granularity(0, BANK, 0x40);
        let a = alloc.reserve(MemoryBank::SYSTEM, 0x10, 0).unwrap();
        let b = alloc.reserve(MemoryBank::SYSTEM, 0x10, 0).unwrap();
        assert_eq!(b - a, 0x40);
    }

    #[test]
    #[should_panic(expected = "exactly one bit must be set")]
    fn multi_bit_bank_mask_is_fatal() {
        let alloc = SimplePhysicalAllocator::new(2, BANK);
        let _ = alloc.reserve(MemoryBank::from_mask(0b11), 0x1000, 0);
    }

    #[test]
    #[should_panic(expected = "is not configured")]
    fn unconfigured_bank_is_fatal() {
        let alloc = SimplePhysicalAllocator::new(1, BANK);
        let _ = alloc.reserve(MemoryBank::local(4), 0x1000, 0);
    }
}
