use std::io::{self, Read};

use aubstream_types::DataHint;
use thiserror::Error;

use crate::format::{
    split_header, AddressSpace, CompareOp, ContextDeclaration, RecordKind, SurfaceDump, AUB_OPCODE,
    AUB_TYPE,
};

#[derive(Debug, Error)]
pub enum AubReadError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("trace ends inside the record at offset {offset}")]
    Truncated { offset: u64 },

    #[error("invalid record header 0x{header:08x} at offset {offset}")]
    BadHeader { offset: u64, header: u32 },

    #[error("unknown sub-opcode 0x{sub_opcode:02x} at offset {offset}")]
    UnknownSubOpcode { offset: u64, sub_opcode: u8 },

    #[error("malformed {kind:?} record: {reason}")]
    Malformed {
        kind: RecordKind,
        reason: &'static str,
    },

    #[error("{kind:?} record has non-zero padding")]
    NonZeroPadding { kind: RecordKind },
}

type Result<T> = std::result::Result<T, AubReadError>;

/// A framed record before payload decoding. `payload.len()` is always `4 * N`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub offset: u64,
    pub kind: RecordKind,
    pub header: u32,
    pub payload: Vec<u8>,
}

impl RawRecord {
    pub fn dword_count(&self) -> u16 {
        split_header(self.header).3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscontiguousEntry {
    pub address: u64,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AubRecord {
    Version {
        file_version: u32,
        tag: [u8; 4],
        stepping: u32,
        device_id: u32,
        recording_method: u32,
        abbreviation: Option<[u8; 8]>,
    },
    Comment {
        text: String,
    },
    RegisterWrite {
        offset: u32,
        mask: u32,
        value: u32,
    },
    RegisterPoll {
        offset: u32,
        mask: u32,
        value: u32,
        not_equal: bool,
        timeout_action: u8,
    },
    MemoryCompare {
        address: u64,
        space: AddressSpace,
        op: CompareOp,
        data: Vec<u8>,
    },
    MemoryWrite {
        address: u64,
        space: AddressSpace,
        hint: DataHint,
        data: Vec<u8>,
    },
    MemoryWriteDiscontiguous {
        space: AddressSpace,
        hint: DataHint,
        entries: Vec<DiscontiguousEntry>,
        data: Vec<u8>,
    },
    ContinuousRegion {
        address: u64,
        space: AddressSpace,
        size: u64,
    },
    MemoryDump {
        address: u64,
        space: AddressSpace,
        size: u64,
        file_name: String,
    },
    SurfaceDump(SurfaceDump),
    ContextDeclaration(ContextDeclaration),
}

/// Sequential AUB record reader.
pub struct AubReader<R> {
    reader: R,
    offset: u64,
}

impl<R: Read> AubReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, offset: 0 }
    }

    /// Byte offset of the next record.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads the next framed record, or `None` at a clean end of file.
    pub fn next_raw(&mut self) -> Result<Option<RawRecord>> {
        let offset = self.offset;
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            match self.reader.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(AubReadError::Truncated { offset }),
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        let header = u32::from_le_bytes(header);
        let (ty, opcode, sub_opcode, dwords) = split_header(header);
        if ty != AUB_TYPE || opcode != AUB_OPCODE {
            return Err(AubReadError::BadHeader { offset, header });
        }
        let kind = RecordKind::from_sub_opcode(sub_opcode)
            .ok_or(AubReadError::UnknownSubOpcode { offset, sub_opcode })?;

        let mut payload = vec![0u8; dwords as usize * 4];
        self.reader.read_exact(&mut payload).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                AubReadError::Truncated { offset }
            } else {
                err.into()
            }
        })?;
        self.offset += 4 + payload.len() as u64;
        Ok(Some(RawRecord {
            offset,
            kind,
            header,
            payload,
        }))
    }

    pub fn next_record(&mut self) -> Result<Option<AubRecord>> {
        match self.next_raw()? {
            Some(raw) => decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    pub fn read_all(mut self) -> Result<Vec<AubRecord>> {
        let mut out = Vec::new();
        while let Some(record) = self.next_record()? {
            out.push(record);
        }
        Ok(out)
    }
}

struct Payload<'a> {
    kind: RecordKind,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Payload<'a> {
    fn malformed(&self, reason: &'static str) -> AubReadError {
        AubReadError::Malformed {
            kind: self.kind,
            reason,
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| self.malformed("payload shorter than its fields"))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let lo = self.u32()? as u64;
        let hi = self.u32()? as u64;
        Ok(lo | (hi << 32))
    }

    fn space(&self, flags: u32) -> Result<AddressSpace> {
        AddressSpace::from_flags(flags).ok_or_else(|| self.malformed("unknown address space"))
    }

    fn text(&mut self) -> Result<String> {
        let rest = &self.bytes[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.malformed("text is not NUL terminated"))?;
        let text = String::from_utf8(rest[..len].to_vec())
            .map_err(|_| self.malformed("text is not UTF-8"))?;
        self.pos += len + 1;
        Ok(text)
    }

    /// Whatever is left must be zero padding shorter than a dword.
    fn finish(&self) -> Result<()> {
        let rest = &self.bytes[self.pos..];
        if rest.len() >= 4 {
            return Err(self.malformed("trailing data after payload"));
        }
        if rest.iter().any(|&b| b != 0) {
            return Err(AubReadError::NonZeroPadding { kind: self.kind });
        }
        Ok(())
    }
}

/// Decodes the payload of a framed record.
pub fn decode(raw: &RawRecord) -> Result<AubRecord> {
    let mut p = Payload {
        kind: raw.kind,
        bytes: &raw.payload,
        pos: 0,
    };
    let record = match raw.kind {
        RecordKind::Version => {
            let dwords = raw.dword_count();
            if dwords != 5 && dwords != 7 {
                return Err(p.malformed("version record must have 5 or 7 dwords"));
            }
            let file_version = p.u32()?;
            let mut tag = [0u8; 4];
            tag.copy_from_slice(p.take(4)?);
            let stepping = p.u32()?;
            let device_id = p.u32()?;
            let recording_method = p.u32()?;
            let abbreviation = if dwords == 7 {
                let mut abbreviation = [0u8; 8];
                abbreviation.copy_from_slice(p.take(8)?);
                Some(abbreviation)
            } else {
                None
            };
            AubRecord::Version {
                file_version,
                tag,
                stepping,
                device_id,
                recording_method,
                abbreviation,
            }
        }
        RecordKind::Comment => {
            let _flags = p.u32()?;
            AubRecord::Comment { text: p.text()? }
        }
        RecordKind::RegisterWrite => {
            let offset = p.u32()?;
            let _flags = p.u32()?;
            let mask = p.u32()?;
            let value = p.u32()?;
            AubRecord::RegisterWrite {
                offset,
                mask,
                value,
            }
        }
        RecordKind::RegisterPoll => {
            let offset = p.u32()?;
            let flags = p.u32()?;
            let mask = p.u32()?;
            let value = p.u32()?;
            AubRecord::RegisterPoll {
                offset,
                mask,
                value,
                not_equal: flags & (1 << 2) != 0,
                timeout_action: (flags >> 8) as u8,
            }
        }
        RecordKind::MemoryCompare => {
            let address = p.u64()?;
            let flags = p.u32()?;
            let size = p.u32()? as usize;
            let space = p.space(flags)?;
            let op = CompareOp::from_u8(flags as u8)
                .ok_or_else(|| p.malformed("unknown compare operation"))?;
            AubRecord::MemoryCompare {
                address,
                space,
                op,
                data: p.take(size)?.to_vec(),
            }
        }
        RecordKind::MemoryWrite => {
            let address = p.u64()?;
            let flags = p.u32()?;
            let size = p.u32()? as usize;
            AubRecord::MemoryWrite {
                address,
                space: p.space(flags)?,
                hint: DataHint(flags as u8),
                data: p.take(size)?.to_vec(),
            }
        }
        RecordKind::MemoryWriteDiscontiguous => {
            let flags = p.u32()?;
            let count = p.u32()? as usize;
            let mut entries = Vec::with_capacity(count.min(raw.payload.len() / 12));
            let mut total = 0usize;
            for _ in 0..count {
                let address = p.u64()?;
                let size = p.u32()?;
                total += size as usize;
                entries.push(DiscontiguousEntry { address, size });
            }
            AubRecord::MemoryWriteDiscontiguous {
                space: p.space(flags)?,
                hint: DataHint(flags as u8),
                entries,
                data: p.take(total)?.to_vec(),
            }
        }
        RecordKind::ContinuousRegion => {
            let address = p.u64()?;
            let flags = p.u32()?;
            let size = p.u64()?;
            AubRecord::ContinuousRegion {
                address,
                space: p.space(flags)?,
                size,
            }
        }
        RecordKind::MemoryDump => {
            let address = p.u64()?;
            let flags = p.u32()?;
            let size = p.u64()?;
            AubRecord::MemoryDump {
                address,
                space: p.space(flags)?,
                size,
                file_name: p.text()?,
            }
        }
        RecordKind::SurfaceDump => {
            if raw.payload.len() != SurfaceDump::DWORDS * 4 {
                return Err(p.malformed("surface dump has the wrong length"));
            }
            let base = p.u64()?;
            let width = p.u32()?;
            let height = p.u32()?;
            let pitch = p.u32()?;
            let format = p.u32()?;
            let flags = p.u32()?;
            AubRecord::SurfaceDump(SurfaceDump {
                base,
                width,
                height,
                pitch,
                format,
                tiling: (flags & 0xF) as u8,
                compressed: flags & (1 << 4) != 0,
                space: p.space(flags)?,
                aux_base: p.u64()?,
                aux_pitch: p.u32()?,
                qpitch: p.u32()?,
                clear_color_address: p.u64()?,
                mode: p.u32()?,
            })
        }
        RecordKind::ContextDeclaration => {
            if raw.payload.len() != ContextDeclaration::DWORDS * 4 {
                return Err(p.malformed("context declaration has the wrong length"));
            }
            let handle = p.u32()?;
            let engine = p.u32()?;
            let flags = p.u32()?;
            AubRecord::ContextDeclaration(ContextDeclaration {
                handle,
                engine,
                ppgtt: flags & 1 != 0,
                levels: ((flags >> 4) & 0xF) as u8,
                page_table_root: p.u64()?,
                context_image: p.u64()?,
                image_size: p.u32()?,
            })
        }
    };
    p.finish()?;
    Ok(record)
}
