use aubstream_types::MemoryBank;

pub const AUB_TYPE: u32 = 7;
pub const AUB_OPCODE: u32 = 0x2E;

pub const AUB_FILE_VERSION: u32 = 1;

/// Recording method stored in the version record for traces written by this crate.
pub const RECORDING_METHOD_LIBRARY: u32 = 1;

/// Largest payload the 16-bit dword count can describe.
pub const MAX_RECORD_DWORDS: usize = 0xFFFF;

/// Contiguous writes and compares larger than this are split across several records.
pub const MAX_CONTIGUOUS_CHUNK: usize = 0x3F000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    RegisterPoll = 0x02,
    RegisterWrite = 0x03,
    MemoryCompare = 0x04,
    MemoryWrite = 0x06,
    Comment = 0x08,
    MemoryDump = 0x0A,
    MemoryWriteDiscontiguous = 0x0B,
    ContinuousRegion = 0x0D,
    Version = 0x0E,
    ContextDeclaration = 0x10,
    SurfaceDump = 0x11,
}

impl RecordKind {
    pub fn from_sub_opcode(value: u8) -> Option<Self> {
        match value {
            0x02 => Some(Self::RegisterPoll),
            0x03 => Some(Self::RegisterWrite),
            0x04 => Some(Self::MemoryCompare),
            0x06 => Some(Self::MemoryWrite),
            0x08 => Some(Self::Comment),
            0x0A => Some(Self::MemoryDump),
            0x0B => Some(Self::MemoryWriteDiscontiguous),
            0x0D => Some(Self::ContinuousRegion),
            0x0E => Some(Self::Version),
            0x10 => Some(Self::ContextDeclaration),
            0x11 => Some(Self::SurfaceDump),
            _ => None,
        }
    }

    pub fn sub_opcode(self) -> u8 {
        self as u8
    }
}

/// Builds a record header. `dwords` must already be checked against [`MAX_RECORD_DWORDS`].
pub fn header_dword(kind: RecordKind, dwords: u16) -> u32 {
    (AUB_TYPE << 29) | (AUB_OPCODE << 23) | ((kind.sub_opcode() as u32) << 16) | dwords as u32
}

/// Splits a header dword into `(type, opcode, sub-opcode, dword count)`.
pub fn split_header(header: u32) -> (u32, u32, u8, u16) {
    (
        header >> 29,
        (header >> 23) & 0x3F,
        ((header >> 16) & 0x7F) as u8,
        (header & 0xFFFF) as u16,
    )
}

/// Address space tag carried in bits 28..=31 of memory record flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AddressSpace {
    GttGraphics = 0,
    Local = 1,
    Nonlocal = 2,
    GttEntry = 4,
    PpgttEntry = 5,
    PpgttGraphics = 6,
}

impl AddressSpace {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::GttGraphics),
            1 => Some(Self::Local),
            2 => Some(Self::Nonlocal),
            4 => Some(Self::GttEntry),
            5 => Some(Self::PpgttEntry),
            6 => Some(Self::PpgttGraphics),
            _ => None,
        }
    }

    /// Physical address space for memory in `bank`.
    pub fn for_bank(bank: MemoryBank) -> Self {
        if bank.is_local() {
            Self::Local
        } else {
            Self::Nonlocal
        }
    }

    pub(crate) fn to_flags(self) -> u32 {
        (self as u32) << 28
    }

    pub(crate) fn from_flags(flags: u32) -> Option<Self> {
        Self::from_u8((flags >> 28) as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompareOp {
    #[default]
    Equal = 0,
    NotEqual = 1,
}

impl CompareOp {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Equal),
            1 => Some(Self::NotEqual),
            _ => None,
        }
    }
}

/// Register access width code stored in bits 0..=1 of register record flags.
pub(crate) const REGISTER_SIZE_32: u32 = 2;

/// Context declaration record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextDeclaration {
    pub handle: u32,
    pub engine: u32,
    /// The context translates through a PPGTT instead of the GGTT.
    pub ppgtt: bool,
    /// PPGTT depth; ignored for GGTT contexts.
    pub levels: u8,
    pub page_table_root: u64,
    pub context_image: u64,
    pub image_size: u32,
}

impl ContextDeclaration {
    pub(crate) const DWORDS: usize = 8;

    pub(crate) fn flags(&self) -> u32 {
        (self.ppgtt as u32) | ((self.levels as u32 & 0xF) << 4)
    }
}

/// Surface dump record payload, including the compression metadata a replayer needs to decode
/// the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDump {
    pub base: u64,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub format: u32,
    pub tiling: u8,
    pub compressed: bool,
    pub space: AddressSpace,
    pub aux_base: u64,
    pub aux_pitch: u32,
    pub qpitch: u32,
    pub clear_color_address: u64,
    pub mode: u32,
}

impl SurfaceDump {
    pub(crate) const DWORDS: usize = 14;

    pub(crate) fn flags(&self) -> u32 {
        (self.tiling as u32 & 0xF) | ((self.compressed as u32) << 4) | self.space.to_flags()
    }
}
