//! Tor cell protocol
//!
//! Implements the cell framing used on a link connection to a guard.
//! Cells are the basic unit of communication in the Tor protocol.
//!
//! ## Framing
//!
//! ```text
//! fixed:    CIRCID (4) | COMMAND (1) | BODY (509)
//! variable: CIRCID (4) | COMMAND (1) | LENGTH (2) | BODY (LENGTH)
//! ```
//!
//! VERSIONS is the only cell whose circuit id is 2 bytes wide, since it is
//! sent before a link protocol version has been agreed on. A command is
//! fixed-length iff `command < 128 && command != VERSIONS`.

use super::certs::CertsCell;
use crate::error::{Result, TorError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - used for padding
    Padding = 0,
    /// CREATE - create a circuit (TAP, unsupported)
    Create = 1,
    /// CREATED - circuit created (TAP, unsupported)
    Created = 2,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - destroy a circuit
    Destroy = 4,
    /// CREATE_FAST - create the first hop without public-key crypto
    CreateFast = 5,
    /// CREATED_FAST - reply to CREATE_FAST
    CreatedFast = 6,
    /// VERSIONS - negotiate versions
    Versions = 7,
    /// NETINFO - network info exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell that can be sent early
    RelayEarly = 9,
    /// CREATE2 - create a circuit (current)
    Create2 = 10,
    /// CREATED2 - circuit created (current)
    Created2 = 11,
    /// PADDING_NEGOTIATE - negotiate padding
    PaddingNegotiate = 12,
    /// VPADDING - variable-length padding
    Vpadding = 128,
    /// CERTS - certificate cell
    Certs = 129,
    /// AUTH_CHALLENGE - authentication challenge
    AuthChallenge = 130,
    /// AUTHENTICATE - authenticate
    Authenticate = 131,
    /// AUTHORIZE - authorize
    Authorize = 132,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// Whether cells with this command use the fixed 509-byte body
    pub fn is_fixed_length(self) -> bool {
        is_fixed_length(self as u8)
    }
}

/// Fixed-length classification on the raw command byte
pub fn is_fixed_length(command: u8) -> bool {
    command < 128 && command != CellCommand::Versions as u8
}

/// Tor cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID (4 bytes for v4+ protocol, 2 bytes on the wire for VERSIONS)
    pub circuit_id: u32,

    /// Command
    pub command: CellCommand,

    /// Body (padded to 509 bytes on the wire for fixed-length cells)
    pub payload: Vec<u8>,
}

impl Cell {
    /// Cell size (514 bytes total: 4 circuit_id + 1 command + 509 payload)
    pub const SIZE: usize = 514;

    /// Payload size for fixed-length cells
    pub const PAYLOAD_SIZE: usize = 509;

    /// Create a new cell
    pub fn new(circuit_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    /// Create a RELAY (or RELAY_EARLY) cell around an already encrypted body
    pub fn relay(circuit_id: u32, relay_payload: Vec<u8>, early: bool) -> Self {
        let command = if early {
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };
        Self::new(circuit_id, command, relay_payload)
    }

    /// Width of the circuit id field for this cell
    pub fn circ_id_len(&self) -> usize {
        if self.command == CellCommand::Versions {
            2
        } else {
            4
        }
    }

    /// Serialize cell to bytes
    ///
    /// Variable-length bodies longer than a 16-bit length can describe are
    /// rejected.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let fixed = self.command.is_fixed_length();
        let mut buf = Vec::with_capacity(Self::SIZE);

        if self.circ_id_len() == 2 {
            buf.extend_from_slice(&(self.circuit_id as u16).to_be_bytes());
        } else {
            buf.extend_from_slice(&self.circuit_id.to_be_bytes());
        }
        buf.push(self.command as u8);

        if fixed {
            let body_len = self.payload.len().min(Self::PAYLOAD_SIZE);
            buf.extend_from_slice(&self.payload[..body_len]);
            buf.resize(buf.len() + Self::PAYLOAD_SIZE - body_len, 0);
        } else {
            let len = u16::try_from(self.payload.len()).map_err(|_| {
                TorError::ProtocolError(format!(
                    "{:?} body of {} bytes does not fit a variable-length cell",
                    self.command,
                    self.payload.len()
                ))
            })?;
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(&self.payload);
        }

        Ok(buf)
    }

    /// Parse a single cell from an in-memory buffer
    ///
    /// Returns the cell and the number of bytes consumed.
    pub fn from_bytes(data: &[u8], circ_id_len: usize) -> Result<(Self, usize)> {
        let header = circ_id_len + 1;
        if data.len() < header {
            return Err(TorError::ProtocolError("Cell too short".into()));
        }

        let circuit_id = read_circ_id(&data[..circ_id_len]);
        let raw_command = data[circ_id_len];
        let command =
            CellCommand::from_u8(raw_command).ok_or(TorError::UnknownCommand(raw_command))?;

        let (body_start, body_len) = if command.is_fixed_length() {
            (header, Self::PAYLOAD_SIZE)
        } else {
            if data.len() < header + 2 {
                return Err(TorError::ProtocolError("Variable cell length missing".into()));
            }
            let len = u16::from_be_bytes([data[header], data[header + 1]]) as usize;
            (header + 2, len)
        };

        if data.len() < body_start + body_len {
            return Err(TorError::ProtocolError(format!(
                "Cell body truncated: need {} bytes, have {}",
                body_len,
                data.len() - body_start
            )));
        }

        let payload = data[body_start..body_start + body_len].to_vec();
        Ok((Self::new(circuit_id, command, payload), body_start + body_len))
    }
}

fn read_circ_id(bytes: &[u8]) -> u32 {
    match bytes.len() {
        2 => u16::from_be_bytes([bytes[0], bytes[1]]) as u32,
        _ => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}

/// Read one cell from a byte stream
///
/// Unknown commands fail with [`TorError::UnknownCommand`] after the command
/// byte; the stream position is then undefined and the connection must be
/// torn down.
pub async fn read_cell<R>(reader: &mut R, circ_id_len: usize) -> Result<Cell>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut circ_id = [0u8; 4];
    reader.read_exact(&mut circ_id[..circ_id_len]).await?;
    let circuit_id = read_circ_id(&circ_id[..circ_id_len]);

    let raw_command = reader.read_u8().await?;
    let command =
        CellCommand::from_u8(raw_command).ok_or(TorError::UnknownCommand(raw_command))?;

    let body_len = if command.is_fixed_length() {
        Cell::PAYLOAD_SIZE
    } else {
        reader.read_u16().await? as usize
    };

    let mut payload = vec![0u8; body_len];
    reader.read_exact(&mut payload).await?;

    log::trace!(
        "📥 cell circ={:#010x} cmd={:?} len={}",
        circuit_id,
        command,
        body_len
    );

    Ok(Cell::new(circuit_id, command, payload))
}

/// Write one cell to a byte stream and flush it
pub async fn write_cell<W>(writer: &mut W, cell: &Cell) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&cell.to_bytes()?).await?;
    writer.flush().await?;
    Ok(())
}

/// VERSIONS cell body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionsCell {
    pub versions: Vec<u16>,
}

impl VersionsCell {
    pub fn new(versions: &[u16]) -> Self {
        Self {
            versions: versions.to_vec(),
        }
    }

    pub fn parse(body: &[u8]) -> Self {
        let versions = body
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Self { versions }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.versions.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    /// Highest version present in both lists, or `None` if there is none
    pub fn highest_shared(&self, ours: &[u16]) -> Option<u16> {
        self.versions
            .iter()
            .filter(|v| ours.contains(v))
            .max()
            .copied()
    }

    pub fn to_cell(&self) -> Cell {
        Cell::new(0, CellCommand::Versions, self.encode())
    }
}

/// AUTH_CHALLENGE cell body
///
/// Clients never authenticate, so this is parsed only to check its framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallengeCell {
    pub challenge: [u8; 32],
    pub methods: Vec<u16>,
}

impl AuthChallengeCell {
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 34 {
            return Err(TorError::ProtocolError("AUTH_CHALLENGE too short".into()));
        }
        let mut challenge = [0u8; 32];
        challenge.copy_from_slice(&body[..32]);
        let n_methods = u16::from_be_bytes([body[32], body[33]]) as usize;
        let methods = body[34..]
            .chunks_exact(2)
            .take(n_methods)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Ok(Self { challenge, methods })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.challenge.to_vec();
        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for m in &self.methods {
            out.extend_from_slice(&m.to_be_bytes());
        }
        out
    }
}

/// Address as carried in a NETINFO cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddress {
    pub address_type: u8,
    pub address: Vec<u8>,
}

impl NetAddress {
    pub const IPV4: u8 = 4;
    pub const IPV6: u8 = 6;

    pub fn ipv4(octets: [u8; 4]) -> Self {
        Self {
            address_type: Self::IPV4,
            address: octets.to_vec(),
        }
    }
}

/// NETINFO cell body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInfoCell {
    /// Sender's clock (clients send 0)
    pub timestamp: u32,
    /// Address of the receiving side, as seen by the sender
    pub other_address: NetAddress,
    /// Sender's own addresses
    pub my_addresses: Vec<NetAddress>,
}

impl NetInfoCell {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(body);
        let timestamp = reader.u32()?;
        let other_address = reader.net_address()?;
        let n = reader.u8()?;
        let mut my_addresses = Vec::with_capacity(n as usize);
        for _ in 0..n {
            my_addresses.push(reader.net_address()?);
        }
        Ok(Self {
            timestamp,
            other_address,
            my_addresses,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        push_address(&mut out, &self.other_address);
        out.push(self.my_addresses.len() as u8);
        for a in &self.my_addresses {
            push_address(&mut out, a);
        }
        out
    }

    pub fn to_cell(&self) -> Cell {
        Cell::new(0, CellCommand::Netinfo, self.encode())
    }
}

fn push_address(out: &mut Vec<u8>, address: &NetAddress) {
    out.push(address.address_type);
    out.push(address.address.len() as u8);
    out.extend_from_slice(&address.address);
}

/// DESTROY cell reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DestroyReason {
    None = 0,
    Protocol = 1,
    Internal = 2,
    Requested = 3,
    Hibernating = 4,
    ResourceLimit = 5,
    ConnectFailed = 6,
    OrIdentity = 7,
    ChannelClosed = 8,
    Finished = 9,
    Timeout = 10,
    Destroyed = 11,
    NoSuchService = 12,
}

/// CREATE_FAST cell: 20 bytes of client key material
pub fn create_fast_cell(circuit_id: u32, x: &[u8; 20]) -> Cell {
    Cell::new(circuit_id, CellCommand::CreateFast, x.to_vec())
}

/// CREATE2 cell: HTYPE (2) | HLEN (2) | HDATA
pub fn create2_cell(circuit_id: u32, handshake_type: u16, hdata: &[u8]) -> Cell {
    let mut body = Vec::with_capacity(4 + hdata.len());
    body.extend_from_slice(&handshake_type.to_be_bytes());
    body.extend_from_slice(&(hdata.len() as u16).to_be_bytes());
    body.extend_from_slice(hdata);
    Cell::new(circuit_id, CellCommand::Create2, body)
}

/// DESTROY cell with a single reason byte
pub fn destroy_cell(circuit_id: u32, reason: DestroyReason) -> Cell {
    Cell::new(circuit_id, CellCommand::Destroy, vec![reason as u8])
}

/// Typed view of a received cell
#[derive(Debug)]
pub enum ChannelMessage {
    Versions(VersionsCell),
    Certs(CertsCell),
    AuthChallenge(AuthChallengeCell),
    NetInfo(NetInfoCell),
    /// CREATED_FAST: Y (20) | KH (20)
    CreatedFast { y: [u8; 20], kh: [u8; 20] },
    /// CREATED2: handshake data, interpreted by the handshake that was sent
    Created2 { hdata: Vec<u8> },
    Destroy { reason: u8 },
    /// Still-encrypted RELAY or RELAY_EARLY body
    Relay { body: Vec<u8>, early: bool },
}

impl ChannelMessage {
    /// Interpret a cell body by its command
    ///
    /// Padding cells yield `Ok(None)`. Commands a client never receives are
    /// reported as [`TorError::UnexpectedCell`].
    pub fn parse(cell: Cell) -> Result<Option<Self>> {
        let body = cell.payload;
        let message = match cell.command {
            CellCommand::Padding | CellCommand::Vpadding | CellCommand::PaddingNegotiate => {
                return Ok(None)
            }
            CellCommand::Versions => ChannelMessage::Versions(VersionsCell::parse(&body)),
            CellCommand::Certs => ChannelMessage::Certs(CertsCell::parse(&body)?),
            CellCommand::AuthChallenge => {
                ChannelMessage::AuthChallenge(AuthChallengeCell::parse(&body)?)
            }
            CellCommand::Netinfo => ChannelMessage::NetInfo(NetInfoCell::parse(&body)?),
            CellCommand::CreatedFast => {
                if body.len() < 40 {
                    return Err(TorError::ProtocolError("CREATED_FAST too short".into()));
                }
                let mut y = [0u8; 20];
                let mut kh = [0u8; 20];
                y.copy_from_slice(&body[..20]);
                kh.copy_from_slice(&body[20..40]);
                ChannelMessage::CreatedFast { y, kh }
            }
            CellCommand::Created2 => {
                if body.len() < 2 {
                    return Err(TorError::ProtocolError("CREATED2 too short".into()));
                }
                let hlen = u16::from_be_bytes([body[0], body[1]]) as usize;
                let end = (2 + hlen).min(body.len());
                ChannelMessage::Created2 {
                    hdata: body[2..end].to_vec(),
                }
            }
            CellCommand::Destroy => ChannelMessage::Destroy {
                reason: body.first().copied().unwrap_or(0),
            },
            CellCommand::Relay => ChannelMessage::Relay { body, early: false },
            CellCommand::RelayEarly => ChannelMessage::Relay { body, early: true },
            other => {
                return Err(TorError::UnexpectedCell {
                    expected: "client-bound cell".into(),
                    got: format!("{:?}", other),
                })
            }
        };
        Ok(Some(message))
    }

    /// Short name for logging and error messages
    pub fn name(&self) -> &'static str {
        match self {
            ChannelMessage::Versions(_) => "VERSIONS",
            ChannelMessage::Certs(_) => "CERTS",
            ChannelMessage::AuthChallenge(_) => "AUTH_CHALLENGE",
            ChannelMessage::NetInfo(_) => "NETINFO",
            ChannelMessage::CreatedFast { .. } => "CREATED_FAST",
            ChannelMessage::Created2 { .. } => "CREATED2",
            ChannelMessage::Destroy { .. } => "DESTROY",
            ChannelMessage::Relay { .. } => "RELAY",
        }
    }
}

/// Minimal big-endian cursor used by the cell parsers
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(TorError::ProtocolError(format!(
                "Truncated field: need {} bytes, have {}",
                n,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn net_address(&mut self) -> Result<NetAddress> {
        let address_type = self.u8()?;
        let len = self.u8()? as usize;
        let address = self.take(len)?.to_vec();
        Ok(NetAddress {
            address_type,
            address,
        })
    }
}
