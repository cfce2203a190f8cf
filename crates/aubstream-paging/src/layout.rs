use aubstream_types::TableLevel;

use crate::{PagingError, Result};

/// Shape of a per-process table, derived from the virtual address width.
///
/// | address bits | levels | root |
/// |---|---|---|
/// | 22..=30 | 2 | `Pd` |
/// | 31..=39 | 3 | `Pdp` |
/// | 40..=48 | 4 | `Pml4` |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpgttLayout {
    address_bits: u32,
}

impl PpgttLayout {
    pub fn for_address_bits(bits: u32) -> Result<Self> {
        if !(22..=48).contains(&bits) {
            return Err(PagingError::UnsupportedAddressWidth { bits });
        }
        Ok(Self { address_bits: bits })
    }

    pub fn address_bits(self) -> u32 {
        self.address_bits
    }

    pub fn levels(self) -> u32 {
        match self.address_bits {
            0..=30 => 2,
            31..=39 => 3,
            _ => 4,
        }
    }

    pub fn root_level(self) -> TableLevel {
        match self.levels() {
            2 => TableLevel::Pd,
            3 => TableLevel::Pdp,
            _ => TableLevel::Pml4,
        }
    }

    /// The root covers only as many entries as the address width needs.
    pub fn root_entries(self) -> usize {
        1usize << (self.address_bits - self.root_level().shift())
    }

    /// Size of the virtual address space.
    pub fn span(self) -> u64 {
        1u64 << self.address_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_count_follows_width() {
        let cases = [
            (22, 2, TableLevel::Pd, 2),
            (30, 2, TableLevel::Pd, 512),
            (32, 3, TableLevel::Pdp, 4),
            (39, 3, TableLevel::Pdp, 512),
            (47, 4, TableLevel::Pml4, 256),
            (48, 4, TableLevel::Pml4, 512),
        ];
        for (bits, levels, root, entries) in cases {
            let layout = PpgttLayout::for_address_bits(bits).unwrap();
            assert_eq!(layout.levels(), levels, "{bits} bits");
            assert_eq!(layout.root_level(), root, "{bits} bits");
            assert_eq!(layout.root_entries(), entries, "{bits} bits");
        }
    }

    #[test]
    fn unsupported_widths() {
        for bits in [0, 21, 49, 57] {
            assert_eq!(
                PpgttLayout::for_address_bits(bits),
                Err(PagingError::UnsupportedAddressWidth { bits })
            );
        }
    }
}
