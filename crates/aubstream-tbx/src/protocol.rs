//! TBX message codec.
//!
//! Every message is a 12-byte header followed by a body of little-endian `u32` words. Memory
//! write requests and memory read responses carry raw data after the body words.
//!
//! ```text
//! 0            4                 8            12
//! +------------+-----------------+------------+
//! | type (u32) | trans_id (u32)  | size (u32) |  header
//! +------------+-----------------+------------+
//! | body words (+ trailing data)  size bytes  |
//! +-------------------------------------------+
//! ```
//!
//! `size` counts everything after the header.

use core::fmt;

use bitflags::bitflags;

pub const HEADER_LEN: usize = 12;

/// Largest data payload accepted in a single message.
pub const MAX_DATA_LEN: usize = 256 * 1024 * 1024;

pub const MSG_MMIO_REQ: u32 = 0;
pub const MSG_MMIO_RES: u32 = 1;
pub const MSG_GTT_REQ: u32 = 2;
pub const MSG_GTT_RES: u32 = 3;
pub const MSG_WRITE_DATA_REQ: u32 = 4;
pub const MSG_READ_DATA_REQ: u32 = 5;
pub const MSG_READ_DATA_RES: u32 = 6;
pub const MSG_CONTROL_REQ: u32 = 7;
pub const MSG_PCICFG_REQ: u32 = 8;
pub const MSG_PCICFG_RES: u32 = 9;
pub const MSG_GTT64_REQ: u32 = 10;
pub const MSG_GTT64_RES: u32 = 11;
pub const MSG_WRITE_DATA_EXT_REQ: u32 = 12;
pub const MSG_READ_DATA_EXT_REQ: u32 = 13;
pub const MSG_READ_DATA_EXT_RES: u32 = 14;
pub const MSG_MARKER_REQ: u32 = 15;
pub const MSG_MARKER_RES: u32 = 16;

const ACCESS_WRITE: u32 = 1 << 0;
const ACCESS_SIZE_SHIFT: u32 = 1;
const ACCESS_SIZE_MASK: u32 = 0xF;

bitflags! {
    /// Control word bits. A control request carries one word of values and one word selecting
    /// which of those values the simulator should apply.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ControlFlags: u32 {
        const RESET = 1 << 0;
        /// Host-and-simulator mode.
        const HAS = 1 << 1;
        const TIME_ADVANCE = 1 << 2;
        const ASYNC = 1 << 3;
    }
}

bitflags! {
    /// Flags word of memory read/write requests.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct DataFlags: u32 {
        /// The address is physical rather than graphics virtual.
        const PHYSICAL = 1 << 0;
        const MASK_EXIST = 1 << 1;
        const FRONTDOOR = 1 << 2;
        const OWNERSHIP = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: u32,
    pub trans_id: u32,
    pub size: u32,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.msg_type.to_le_bytes());
        out[4..8].copy_from_slice(&self.trans_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            msg_type: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            trans_id: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            size: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }
}

/// PCI configuration space function address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    fn to_flags(self) -> u32 {
        ((self.bus as u32) << 8)
            | ((self.device as u32 & 0x1F) << 16)
            | ((self.function as u32 & 0x7) << 21)
    }

    fn from_flags(flags: u32) -> Self {
        Self {
            bus: (flags >> 8) as u8,
            device: ((flags >> 16) & 0x1F) as u8,
            function: ((flags >> 21) & 0x7) as u8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Mmio {
        write: bool,
        size: u8,
        offset: u32,
        data: u32,
    },
    MmioResponse {
        data: u32,
    },
    Gtt32 {
        write: bool,
        index: u32,
        data: u32,
    },
    Gtt32Response {
        data: u32,
    },
    WriteData {
        flags: DataFlags,
        address: u32,
        data: Vec<u8>,
    },
    ReadData {
        flags: DataFlags,
        address: u32,
        size: u32,
    },
    ReadDataResponse {
        flags: DataFlags,
        address: u32,
        data: Vec<u8>,
    },
    Control {
        values: ControlFlags,
        mask: ControlFlags,
    },
    PciCfg {
        write: bool,
        size: u8,
        function: PciAddress,
        offset: u32,
        data: u32,
    },
    PciCfgResponse {
        data: u32,
    },
    Gtt64 {
        write: bool,
        index: u32,
        data: u64,
    },
    Gtt64Response {
        data: u64,
    },
    WriteDataExt {
        flags: DataFlags,
        address: u64,
        data: Vec<u8>,
    },
    ReadDataExt {
        flags: DataFlags,
        address: u64,
        size: u32,
    },
    ReadDataExtResponse {
        flags: DataFlags,
        address: u64,
        data: Vec<u8>,
    },
    Marker {
        value: u32,
    },
    MarkerResponse {
        value: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    UnknownType { msg_type: u32 },
    BodyTooShort { msg_type: u32, len: usize, need: usize },
    TrailingBytes { msg_type: u32, trailing: usize },
    DataTooLarge { len: usize, max: usize },
    DataLengthMismatch { declared: u32, got: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnknownType { msg_type } => write!(f, "unknown TBX message type {msg_type}"),
            Error::BodyTooShort {
                msg_type,
                len,
                need,
            } => write!(
                f,
                "TBX message type {msg_type} body too short: {len} < {need} bytes"
            ),
            Error::TrailingBytes { msg_type, trailing } => write!(
                f,
                "TBX message type {msg_type} has {trailing} trailing bytes"
            ),
            Error::DataTooLarge { len, max } => {
                write!(f, "TBX data payload too large: {len} > {max}")
            }
            Error::DataLengthMismatch { declared, got } => write!(
                f,
                "TBX data length mismatch: body declares {declared} bytes, message carries {got}"
            ),
        }
    }
}

impl std::error::Error for Error {}

fn access_flags(write: bool, size: u8) -> u32 {
    (write as u32) | ((size as u32 & ACCESS_SIZE_MASK) << ACCESS_SIZE_SHIFT)
}

fn access_write(flags: u32) -> bool {
    flags & ACCESS_WRITE != 0
}

fn access_size(flags: u32) -> u8 {
    ((flags >> ACCESS_SIZE_SHIFT) & ACCESS_SIZE_MASK) as u8
}

fn low(value: u64) -> u32 {
    value as u32
}

fn high(value: u64) -> u32 {
    (value >> 32) as u32
}

fn join(lo: u32, hi: u32) -> u64 {
    lo as u64 | ((hi as u64) << 32)
}

impl Message {
    pub fn msg_type(&self) -> u32 {
        match self {
            Message::Mmio { .. } => MSG_MMIO_REQ,
            Message::MmioResponse { .. } => MSG_MMIO_RES,
            Message::Gtt32 { .. } => MSG_GTT_REQ,
            Message::Gtt32Response { .. } => MSG_GTT_RES,
            Message::WriteData { .. } => MSG_WRITE_DATA_REQ,
            Message::ReadData { .. } => MSG_READ_DATA_REQ,
            Message::ReadDataResponse { .. } => MSG_READ_DATA_RES,
            Message::Control { .. } => MSG_CONTROL_REQ,
            Message::PciCfg { .. } => MSG_PCICFG_REQ,
            Message::PciCfgResponse { .. } => MSG_PCICFG_RES,
            Message::Gtt64 { .. } => MSG_GTT64_REQ,
            Message::Gtt64Response { .. } => MSG_GTT64_RES,
            Message::WriteDataExt { .. } => MSG_WRITE_DATA_EXT_REQ,
            Message::ReadDataExt { .. } => MSG_READ_DATA_EXT_REQ,
            Message::ReadDataExtResponse { .. } => MSG_READ_DATA_EXT_RES,
            Message::Marker { .. } => MSG_MARKER_REQ,
            Message::MarkerResponse { .. } => MSG_MARKER_RES,
        }
    }

    /// The response type a request expects, or `None` for one-way messages.
    pub fn response_type(&self) -> Option<u32> {
        match self {
            Message::Mmio { write: false, .. } => Some(MSG_MMIO_RES),
            Message::Gtt32 { write: false, .. } => Some(MSG_GTT_RES),
            Message::Gtt64 { write: false, .. } => Some(MSG_GTT64_RES),
            Message::PciCfg { write: false, .. } => Some(MSG_PCICFG_RES),
            Message::ReadData { .. } => Some(MSG_READ_DATA_RES),
            Message::ReadDataExt { .. } => Some(MSG_READ_DATA_EXT_RES),
            Message::Marker { .. } => Some(MSG_MARKER_RES),
            _ => None,
        }
    }

    fn words(&self) -> Vec<u32> {
        match self {
            Message::Mmio {
                write,
                size,
                offset,
                data,
            } => vec![access_flags(*write, *size), *offset, *data],
            Message::MmioResponse { data }
            | Message::Gtt32Response { data }
            | Message::PciCfgResponse { data } => vec![*data],
            Message::Gtt32 { write, index, data } => vec![access_flags(*write, 4), *index, *data],
            Message::WriteData {
                flags,
                address,
                data,
            }
            | Message::ReadDataResponse {
                flags,
                address,
                data,
            } => vec![flags.bits(), *address, data.len() as u32],
            Message::ReadData {
                flags,
                address,
                size,
            } => vec![flags.bits(), *address, *size],
            Message::Control { values, mask } => vec![values.bits(), mask.bits()],
            Message::PciCfg {
                write,
                size,
                function,
                offset,
                data,
            } => vec![
                access_flags(*write, *size) | function.to_flags(),
                *offset,
                *data,
            ],
            Message::Gtt64 { write, index, data } => {
                vec![access_flags(*write, 8), *index, low(*data), high(*data)]
            }
            Message::Gtt64Response { data } => vec![low(*data), high(*data)],
            Message::WriteDataExt {
                flags,
                address,
                data,
            }
            | Message::ReadDataExtResponse {
                flags,
                address,
                data,
            } => vec![flags.bits(), low(*address), high(*address), data.len() as u32],
            Message::ReadDataExt {
                flags,
                address,
                size,
            } => vec![flags.bits(), low(*address), high(*address), *size],
            Message::Marker { value } | Message::MarkerResponse { value } => vec![*value],
        }
    }

    fn data(&self) -> &[u8] {
        match self {
            Message::WriteData { data, .. }
            | Message::ReadDataResponse { data, .. }
            | Message::WriteDataExt { data, .. }
            | Message::ReadDataExtResponse { data, .. } => data,
            _ => &[],
        }
    }

    /// Encodes header, body and data into one buffer.
    pub fn encode(&self, trans_id: u32) -> Result<Vec<u8>, Error> {
        let data = self.data();
        if data.len() > MAX_DATA_LEN {
            return Err(Error::DataTooLarge {
                len: data.len(),
                max: MAX_DATA_LEN,
            });
        }
        let words = self.words();
        let size = words.len() * 4 + data.len();
        let header = Header {
            msg_type: self.msg_type(),
            trans_id,
            size: size as u32,
        };

        let mut out = Vec::with_capacity(HEADER_LEN + size);
        out.extend_from_slice(&header.encode());
        for word in words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(data);
        Ok(out)
    }

    /// Decodes the part of a message that follows its header.
    pub fn decode(msg_type: u32, body: &[u8]) -> Result<Self, Error> {
        let mut r = Body {
            msg_type,
            buf: body,
            pos: 0,
        };
        let message = match msg_type {
            MSG_MMIO_REQ => {
                let flags = r.u32()?;
                Message::Mmio {
                    write: access_write(flags),
                    size: access_size(flags),
                    offset: r.u32()?,
                    data: r.u32()?,
                }
            }
            MSG_MMIO_RES => Message::MmioResponse { data: r.u32()? },
            MSG_GTT_REQ => {
                let flags = r.u32()?;
                Message::Gtt32 {
                    write: access_write(flags),
                    index: r.u32()?,
                    data: r.u32()?,
                }
            }
            MSG_GTT_RES => Message::Gtt32Response { data: r.u32()? },
            MSG_WRITE_DATA_REQ | MSG_READ_DATA_RES => {
                let flags = DataFlags::from_bits_retain(r.u32()?);
                let address = r.u32()?;
                let size = r.u32()?;
                let data = r.data(size)?;
                if msg_type == MSG_WRITE_DATA_REQ {
                    Message::WriteData {
                        flags,
                        address,
                        data,
                    }
                } else {
                    Message::ReadDataResponse {
                        flags,
                        address,
                        data,
                    }
                }
            }
            MSG_READ_DATA_REQ => Message::ReadData {
                flags: DataFlags::from_bits_retain(r.u32()?),
                address: r.u32()?,
                size: r.u32()?,
            },
            MSG_CONTROL_REQ => Message::Control {
                values: ControlFlags::from_bits_retain(r.u32()?),
                mask: ControlFlags::from_bits_retain(r.u32()?),
            },
            MSG_PCICFG_REQ => {
                let flags = r.u32()?;
                Message::PciCfg {
                    write: access_write(flags),
                    size: access_size(flags),
                    function: PciAddress::from_flags(flags),
                    offset: r.u32()?,
                    data: r.u32()?,
                }
            }
            MSG_PCICFG_RES => Message::PciCfgResponse { data: r.u32()? },
            MSG_GTT64_REQ => {
                let flags = r.u32()?;
                let index = r.u32()?;
                let lo = r.u32()?;
                let hi = r.u32()?;
                Message::Gtt64 {
                    write: access_write(flags),
                    index,
                    data: join(lo, hi),
                }
            }
            MSG_GTT64_RES => {
                let lo = r.u32()?;
                let hi = r.u32()?;
                Message::Gtt64Response { data: join(lo, hi) }
            }
            MSG_WRITE_DATA_EXT_REQ | MSG_READ_DATA_EXT_RES => {
                let flags = DataFlags::from_bits_retain(r.u32()?);
                let lo = r.u32()?;
                let hi = r.u32()?;
                let size = r.u32()?;
                let data = r.data(size)?;
                let address = join(lo, hi);
                if msg_type == MSG_WRITE_DATA_EXT_REQ {
                    Message::WriteDataExt {
                        flags,
                        address,
                        data,
                    }
                } else {
                    Message::ReadDataExtResponse {
                        flags,
                        address,
                        data,
                    }
                }
            }
            MSG_READ_DATA_EXT_REQ => {
                let flags = DataFlags::from_bits_retain(r.u32()?);
                let lo = r.u32()?;
                let hi = r.u32()?;
                Message::ReadDataExt {
                    flags,
                    address: join(lo, hi),
                    size: r.u32()?,
                }
            }
            MSG_MARKER_REQ => Message::Marker { value: r.u32()? },
            MSG_MARKER_RES => Message::MarkerResponse { value: r.u32()? },
            other => return Err(Error::UnknownType { msg_type: other }),
        };
        r.finish()?;
        Ok(message)
    }
}

struct Body<'a> {
    msg_type: u32,
    buf: &'a [u8],
    pos: usize,
}

impl Body<'_> {
    fn u32(&mut self) -> Result<u32, Error> {
        let need = self.pos + 4;
        if self.buf.len() < need {
            return Err(Error::BodyTooShort {
                msg_type: self.msg_type,
                len: self.buf.len(),
                need,
            });
        }
        let b = &self.buf[self.pos..need];
        self.pos = need;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn data(&mut self, declared: u32) -> Result<Vec<u8>, Error> {
        let rest = &self.buf[self.pos..];
        if rest.len() != declared as usize {
            return Err(Error::DataLengthMismatch {
                declared,
                got: rest.len(),
            });
        }
        self.pos = self.buf.len();
        Ok(rest.to_vec())
    }

    fn finish(&self) -> Result<(), Error> {
        if self.pos != self.buf.len() {
            return Err(Error::TrailingBytes {
                msg_type: self.msg_type,
                trailing: self.buf.len() - self.pos,
            });
        }
        Ok(())
    }
}

/// The control request that switches the simulator into host-and-simulator mode.
pub fn handshake() -> Message {
    let mask = ControlFlags::HAS | ControlFlags::TIME_ADVANCE | ControlFlags::ASYNC;
    Message::Control {
        values: ControlFlags::HAS,
        mask,
    }
}
