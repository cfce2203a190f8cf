use core::fmt;

use crate::MemoryBank;

/// GPU product families known to the trace header and the registry.
///
/// `Unknown` keeps the caller's raw code so it can be logged; it is written to traces as `"UNK"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProductFamily {
    Skl,
    Kbl,
    Glk,
    Cfl,
    Icl,
    Tgl,
    Dg1,
    XeHp,
    Dg2,
    Pvc,
    Mtl,
    Unknown(u32),
}

impl ProductFamily {
    pub const KNOWN: [ProductFamily; 11] = [
        Self::Skl,
        Self::Kbl,
        Self::Glk,
        Self::Cfl,
        Self::Icl,
        Self::Tgl,
        Self::Dg1,
        Self::XeHp,
        Self::Dg2,
        Self::Pvc,
        Self::Mtl,
    ];

    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Skl,
            2 => Self::Kbl,
            3 => Self::Glk,
            4 => Self::Cfl,
            5 => Self::Icl,
            6 => Self::Tgl,
            7 => Self::Dg1,
            8 => Self::XeHp,
            9 => Self::Dg2,
            10 => Self::Pvc,
            11 => Self::Mtl,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Skl => 1,
            Self::Kbl => 2,
            Self::Glk => 3,
            Self::Cfl => 4,
            Self::Icl => 5,
            Self::Tgl => 6,
            Self::Dg1 => 7,
            Self::XeHp => 8,
            Self::Dg2 => 9,
            Self::Pvc => 10,
            Self::Mtl => 11,
            Self::Unknown(code) => code,
        }
    }

    /// Capitalized 3- or 4-character product tag used in trace headers.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Skl => "SKL",
            Self::Kbl => "KBL",
            Self::Glk => "GLK",
            Self::Cfl => "CFL",
            Self::Icl => "ICL",
            Self::Tgl => "TGL",
            Self::Dg1 => "DG1",
            Self::XeHp => "XEHP",
            Self::Dg2 => "DG2",
            Self::Pvc => "PVC",
            Self::Mtl => "MTL",
            Self::Unknown(_) => "UNK",
        }
    }

    /// Case-insensitive lookup by tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::KNOWN
            .into_iter()
            .find(|family| family.tag().eq_ignore_ascii_case(tag))
    }
}

impl fmt::Display for ProductFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "UNK({code})"),
            known => f.write_str(known.tag()),
        }
    }
}

/// Levels of the translation hierarchy, from the roots down to data pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableLevel {
    /// Flat global table; indexes 4 KiB pages directly.
    Ggtt,
    Pml4,
    Pdp,
    Pd,
    Pt,
    /// 4 KiB data page.
    Page4K,
    /// 2 MiB data page mapped directly from a `Pd` entry.
    Page2M,
}

impl TableLevel {
    /// Lowest virtual-address bit this level indexes.
    pub fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdp => 30,
            Self::Pd => 21,
            Self::Ggtt | Self::Pt | Self::Page4K => 12,
            Self::Page2M => 21,
        }
    }

    /// The table level below this one, if it is a table.
    pub fn next_table(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdp),
            Self::Pdp => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Ggtt | Self::Pt | Self::Page4K | Self::Page2M => None,
        }
    }

    pub fn is_data_page(self) -> bool {
        matches!(self, Self::Page4K | Self::Page2M)
    }
}

/// Per-family capability consumed by the core.
///
/// Implementations live with the per-family data tables, outside this workspace; the core only
/// ever holds `Arc<dyn GpuDescriptor>` and never interprets the bits it receives.
pub trait GpuDescriptor: fmt::Debug + Send + Sync {
    fn family(&self) -> ProductFamily;

    fn device_id(&self) -> u32;

    /// Optional 8-byte product abbreviation written to the trace header.
    fn product_abbreviation(&self) -> Option<[u8; 8]> {
        None
    }

    /// Number of local memory banks the device exposes (0 for integrated parts).
    fn local_memory_banks(&self) -> u32 {
        0
    }

    /// Virtual address width of per-process tables.
    fn ppgtt_address_bits(&self) -> u32 {
        48
    }

    /// Family-specific bits OR-ed into an entry that points at a node of `level`.
    ///
    /// GGTT slots arrive as [`TableLevel::Ggtt`] rather than as the 4 KiB page they map.
    fn extra_entry_bits(&self, level: TableLevel, bank: MemoryBank, uncached: bool) -> u64 {
        let _ = (level, bank, uncached);
        0
    }
}

/// A descriptor assembled from plain values.
///
/// Used as the registry default when no richer per-family implementation is registered, and in
/// tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicGpu {
    pub family: ProductFamily,
    pub device_id: u32,
    pub abbreviation: Option<[u8; 8]>,
    pub local_banks: u32,
    pub address_bits: u32,
    pub extra_bits: u64,
    pub uncached_bits: u64,
}

impl BasicGpu {
    pub fn new(family: ProductFamily) -> Self {
        Self {
            family,
            device_id: 0,
            abbreviation: None,
            local_banks: 0,
            address_bits: 48,
            extra_bits: 0,
            uncached_bits: 0,
        }
    }
}

impl GpuDescriptor for BasicGpu {
    fn family(&self) -> ProductFamily {
        self.family
    }

    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn product_abbreviation(&self) -> Option<[u8; 8]> {
        self.abbreviation
    }

    fn local_memory_banks(&self) -> u32 {
        self.local_banks
    }

    fn ppgtt_address_bits(&self) -> u32 {
        self.address_bits
    }

    fn extra_entry_bits(&self, level: TableLevel, _bank: MemoryBank, uncached: bool) -> u64 {
        if level == TableLevel::Ggtt {
            return 0;
        }
        if uncached {
            self.extra_bits | self.uncached_bits
        } else {
            self.extra_bits
        }
    }
}
