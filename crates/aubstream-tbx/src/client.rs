use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;

use aubstream_types::{FailurePolicy, MemoryBank};

use crate::config::{TbxConfig, CONNECT_RETRY_INTERVAL};
use crate::protocol::{self, DataFlags, Header, Message, PciAddress, HEADER_LEN, MAX_DATA_LEN};
use crate::{Result, TbxError};

/// PCI function whose BAR2 holds the local memory base in frontdoor mode.
pub const LMEMBAR_PCI_FUNCTION: PciAddress = PciAddress::new(0, 2, 0);
const LMEMBAR_LOW_OFFSET: u32 = 0x18;
const LMEMBAR_HIGH_OFFSET: u32 = 0x1C;

/// Used when the simulator reports a zero BAR.
pub const DEFAULT_LMEMBAR: u64 = 0x40_0000_0000;

const MARKER_VALUE: u32 = 0x7B7B_0001;

/// Largest response body: the widest fixed body plus the data limit.
const MAX_BODY_LEN: usize = 16 + MAX_DATA_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// A transport or protocol failure desynchronised the session. Sticky.
    Error,
}

struct Inner<T> {
    io: Option<T>,
    next_id: u32,
    state: ConnectionState,
}

pub struct TbxClient<T> {
    inner: Mutex<Inner<T>>,
    frontdoor: bool,
    lmembar: u64,
    policy: FailurePolicy,
}

impl<T> core::fmt::Debug for TbxClient<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TbxClient")
            .field("state", &self.state())
            .field("frontdoor", &self.frontdoor)
            .field("lmembar", &self.lmembar)
            .finish()
    }
}

impl<T> TbxClient<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_frontdoor(&self) -> bool {
        self.frontdoor
    }

    /// Local memory base added to local addresses in frontdoor mode (0 otherwise).
    pub fn lmembar(&self) -> u64 {
        self.lmembar
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }
}

impl TbxClient<TcpStream> {
    /// Connects to the simulator described by `config` and performs the handshake.
    ///
    /// The host is resolved once. After `connect_delay` the connect is retried until
    /// `connect_timeout` elapses.
    pub fn connect(config: &TbxConfig, policy: FailurePolicy) -> Result<Self> {
        let stream = policy.apply(open(config))?;
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(error = %err, "failed to set TCP_NODELAY on simulator socket");
        }
        tracing::info!(
            host = %config.host,
            port = config.port,
            frontdoor = config.frontdoor,
            "connected to simulator"
        );
        Self::establish(stream, config.frontdoor, policy)
    }
}

fn open(config: &TbxConfig) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|source| TbxError::Resolve {
            host: config.host.clone(),
            port: config.port,
            source,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(TbxError::Resolve {
            host: config.host.clone(),
            port: config.port,
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
        });
    }

    if !config.connect_delay.is_zero() {
        tracing::debug!(delay = ?config.connect_delay, "delaying simulator connect");
        thread::sleep(config.connect_delay);
    }

    let deadline = Instant::now() + config.connect_timeout;
    loop {
        let err = match connect_any(&addrs) {
            Ok(stream) => return Ok(stream),
            Err(err) => err,
        };
        let now = Instant::now();
        if now >= deadline {
            return Err(TbxError::Connect {
                host: config.host.clone(),
                port: config.port,
                source: err,
            });
        }
        tracing::debug!(error = %err, "simulator not reachable yet, retrying");
        thread::sleep(CONNECT_RETRY_INTERVAL.min(deadline - now));
    }
}

fn connect_any(addrs: &[SocketAddr]) -> io::Result<TcpStream> {
    let mut last = io::Error::new(io::ErrorKind::NotFound, "no addresses");
    for addr in addrs {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(err) => last = err,
        }
    }
    Err(last)
}

/// Writes all of `buf`, retrying short writes.
fn send_all<W: Write>(io: &mut W, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match io.write(buf) {
            Ok(0) => return Err(TbxError::PeerClosed),
            Ok(n) => buf = &buf[n..],
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    io.flush()?;
    Ok(())
}

/// Fills `buf`, retrying short reads.
fn recv_exact<R: Read>(io: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match io.read(&mut buf[filled..]) {
            Ok(0) => return Err(TbxError::PeerClosed),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn unexpected(message: &Message) -> TbxError {
    TbxError::ProtocolViolation(format!("unexpected response {message:?}"))
}

impl<T: Read + Write> TbxClient<T> {
    /// Wraps an already connected transport and performs the handshake.
    ///
    /// In frontdoor mode the local memory BAR is read from the simulator's PCI configuration
    /// space as part of the handshake.
    pub fn establish(io: T, frontdoor: bool, policy: FailurePolicy) -> Result<Self> {
        let mut client = Self {
            inner: Mutex::new(Inner {
                io: Some(io),
                next_id: 0,
                state: ConnectionState::Connecting,
            }),
            frontdoor,
            lmembar: 0,
            policy,
        };
        let result = client.handshake();
        policy.apply(result)?;
        Ok(client)
    }

    fn handshake(&mut self) -> Result<()> {
        self.post(&protocol::handshake())?;
        if self.frontdoor {
            self.lmembar = self.query_lmembar()?;
        }
        self.lock().state = ConnectionState::Connected;
        tracing::debug!(
            frontdoor = self.frontdoor,
            lmembar = self.lmembar,
            "simulator handshake complete"
        );
        Ok(())
    }

    fn query_lmembar(&self) -> Result<u64> {
        let low = self.pci_cfg_read(LMEMBAR_PCI_FUNCTION, LMEMBAR_LOW_OFFSET)?;
        let high = self.pci_cfg_read(LMEMBAR_PCI_FUNCTION, LMEMBAR_HIGH_OFFSET)?;
        let bar = (low as u64 | ((high as u64) << 32)) & !0xF;
        if bar == 0 {
            tracing::warn!(
                fallback = DEFAULT_LMEMBAR,
                "simulator reported a zero local memory BAR"
            );
            return Ok(DEFAULT_LMEMBAR);
        }
        Ok(bar)
    }

    /// Sends `request` and, if it expects one, waits for the matching response.
    ///
    /// The lock is held for the whole round trip so exchanges from different threads never
    /// interleave on the wire.
    fn exchange(&self, request: &Message) -> Result<Option<Message>> {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Error {
            return Err(TbxError::SessionFailed);
        }
        if inner.io.is_none() {
            return Err(TbxError::NotConnected);
        }
        let trans_id = inner.next_id;
        let bytes = request.encode(trans_id)?;
        inner.next_id = trans_id.wrapping_add(1);

        let result = round_trip(&mut inner, trans_id, request, &bytes);
        if let Err(err) = &result {
            inner.state = ConnectionState::Error;
            tracing::error!(trans_id, error = %err, "simulator session failed");
        }
        result
    }

    fn post(&self, request: &Message) -> Result<()> {
        self.exchange(request).map(|_| ())
    }

    fn call(&self, request: &Message) -> Result<Message> {
        self.exchange(request)?
            .ok_or_else(|| TbxError::ProtocolViolation("request has no response".into()))
    }

    /// Moves the session into the error state after a response failed validation.
    fn poison(&self, err: TbxError) -> TbxError {
        self.lock().state = ConnectionState::Error;
        tracing::error!(error = %err, "simulator session failed");
        err
    }

    pub fn read_mmio(&self, offset: u32) -> Result<u32> {
        let result = self
            .call(&Message::Mmio {
                write: false,
                size: 4,
                offset,
                data: 0,
            })
            .and_then(|response| match response {
                Message::MmioResponse { data } => Ok(data),
                other => Err(unexpected(&other)),
            });
        self.policy.apply(result)
    }

    pub fn write_mmio(&self, offset: u32, value: u32) -> Result<()> {
        let result = self.post(&Message::Mmio {
            write: true,
            size: 4,
            offset,
            data: value,
        });
        self.policy.apply(result)
    }

    fn pci_cfg_read(&self, function: PciAddress, offset: u32) -> Result<u32> {
        let response = self.call(&Message::PciCfg {
            write: false,
            size: 4,
            function,
            offset,
            data: 0,
        })?;
        match response {
            Message::PciCfgResponse { data } => Ok(data),
            other => Err(unexpected(&other)),
        }
    }

    pub fn read_pci_cfg(&self, function: PciAddress, offset: u32) -> Result<u32> {
        let result = self.pci_cfg_read(function, offset);
        self.policy.apply(result)
    }

    pub fn write_pci_cfg(&self, function: PciAddress, offset: u32, value: u32) -> Result<()> {
        let result = self.post(&Message::PciCfg {
            write: true,
            size: 4,
            function,
            offset,
            data: value,
        });
        self.policy.apply(result)
    }

    /// Chooses flags, wire address and message width for a memory access.
    fn route(&self, address: u64, bank: MemoryBank) -> (DataFlags, u64, bool) {
        if self.frontdoor && bank.is_local() {
            (
                DataFlags::PHYSICAL | DataFlags::FRONTDOOR,
                address + self.lmembar,
                true,
            )
        } else {
            (DataFlags::PHYSICAL, address, address > u32::MAX as u64)
        }
    }

    pub fn write_memory(&self, address: u64, bank: MemoryBank, data: &[u8]) -> Result<()> {
        let (flags, address, extended) = self.route(address, bank);
        let request = if extended {
            Message::WriteDataExt {
                flags,
                address,
                data: data.to_vec(),
            }
        } else {
            Message::WriteData {
                flags,
                address: address as u32,
                data: data.to_vec(),
            }
        };
        tracing::trace!(address, len = data.len(), extended, "simulator memory write");
        let result = self.post(&request);
        self.policy.apply(result)
    }

    pub fn read_memory(&self, address: u64, bank: MemoryBank, buf: &mut [u8]) -> Result<()> {
        let result = self.read_memory_inner(address, bank, buf);
        self.policy.apply(result)
    }

    fn read_memory_inner(&self, address: u64, bank: MemoryBank, buf: &mut [u8]) -> Result<()> {
        let (flags, address, extended) = self.route(address, bank);
        let size = u32::try_from(buf.len()).map_err(|_| protocol::Error::DataTooLarge {
            len: buf.len(),
            max: MAX_DATA_LEN,
        })?;
        let request = if extended {
            Message::ReadDataExt {
                flags,
                address,
                size,
            }
        } else {
            Message::ReadData {
                flags,
                address: address as u32,
                size,
            }
        };
        let data = match self.call(&request)? {
            Message::ReadDataResponse { data, .. } | Message::ReadDataExtResponse { data, .. } => {
                data
            }
            other => return Err(unexpected(&other)),
        };
        if data.len() != buf.len() {
            return Err(self.poison(TbxError::ProtocolViolation(format!(
                "read of {} bytes returned {}",
                buf.len(),
                data.len()
            ))));
        }
        buf.copy_from_slice(&data);
        Ok(())
    }

    pub fn read_gtt32(&self, index: u32) -> Result<u32> {
        let result = self
            .call(&Message::Gtt32 {
                write: false,
                index,
                data: 0,
            })
            .and_then(|response| match response {
                Message::Gtt32Response { data } => Ok(data),
                other => Err(unexpected(&other)),
            });
        self.policy.apply(result)
    }

    pub fn write_gtt32(&self, index: u32, value: u32) -> Result<()> {
        let result = self.post(&Message::Gtt32 {
            write: true,
            index,
            data: value,
        });
        self.policy.apply(result)
    }

    pub fn read_gtt64(&self, index: u32) -> Result<u64> {
        let result = self
            .call(&Message::Gtt64 {
                write: false,
                index,
                data: 0,
            })
            .and_then(|response| match response {
                Message::Gtt64Response { data } => Ok(data),
                other => Err(unexpected(&other)),
            });
        self.policy.apply(result)
    }

    pub fn write_gtt64(&self, index: u32, value: u64) -> Result<()> {
        let result = self.post(&Message::Gtt64 {
            write: true,
            index,
            data: value,
        });
        self.policy.apply(result)
    }

    /// Writes a 64-bit GGTT entry.
    pub fn write_gtt(&self, index: u32, value: u64) -> Result<()> {
        self.write_gtt64(index, value)
    }

    /// Pings the simulator with a marker message.
    pub fn still_connected(&self) -> bool {
        match self.call(&Message::Marker {
            value: MARKER_VALUE,
        }) {
            Ok(Message::MarkerResponse {
                value: MARKER_VALUE,
            }) => true,
            Ok(other) => {
                self.poison(unexpected(&other));
                false
            }
            Err(err) => {
                tracing::debug!(error = %err, "simulator marker ping failed");
                false
            }
        }
    }

    /// Releases the transport. Later operations fail with [`TbxError::NotConnected`] (or
    /// [`TbxError::SessionFailed`] if the session had already failed). Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        let Some(mut io) = inner.io.take() else {
            return Ok(());
        };
        if inner.state != ConnectionState::Error {
            inner.state = ConnectionState::Disconnected;
        }
        drop(inner);
        tracing::info!("closing simulator connection");
        let result = io.flush().map_err(TbxError::from);
        self.policy.apply(result)
    }
}

impl<T> Drop for TbxClient<T> {
    fn drop(&mut self) {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if inner.io.take().is_some() {
            if inner.state != ConnectionState::Error {
                inner.state = ConnectionState::Disconnected;
            }
            tracing::debug!("simulator connection dropped without close");
        }
    }
}

fn round_trip<T: Read + Write>(
    inner: &mut Inner<T>,
    trans_id: u32,
    request: &Message,
    bytes: &[u8],
) -> Result<Option<Message>> {
    let io = inner.io.as_mut().ok_or(TbxError::NotConnected)?;
    send_all(io, bytes)?;
    tracing::trace!(trans_id, msg_type = request.msg_type(), "sent TBX message");

    let Some(expected) = request.response_type() else {
        return Ok(None);
    };
    let mut header = [0u8; HEADER_LEN];
    recv_exact(io, &mut header)?;
    let header = Header::decode(&header);
    if header.trans_id != trans_id || header.msg_type != expected {
        return Err(TbxError::ProtocolViolation(format!(
            "expected type {expected} id {trans_id}, got type {} id {}",
            header.msg_type, header.trans_id
        )));
    }
    let size = header.size as usize;
    if size > MAX_BODY_LEN {
        return Err(protocol::Error::DataTooLarge {
            len: size,
            max: MAX_BODY_LEN,
        }
        .into());
    }
    let mut body = vec![0u8; size];
    recv_exact(io, &mut body)?;
    Ok(Some(Message::decode(header.msg_type, &body)?))
}
