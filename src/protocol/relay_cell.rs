//! Relay cell sub-protocol
//!
//! A decrypted RELAY body is always 509 bytes:
//!
//! ```text
//! COMMAND (1) | RECOGNIZED (2) | STREAM_ID (2) | DIGEST (4) | LENGTH (2) | DATA | PADDING
//! ```
//!
//! This module lays out and reads that header and maps the data field to a
//! typed [`RelayMessage`]. The digest field is left zeroed here; the circuit
//! fills it in on the way out.

use super::cell::{ByteReader, Cell};
use super::handshake::HandshakeReply;
use crate::error::{Result, TorError};
use rand::RngCore;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin = 1,
    /// DATA - relay data
    Data = 2,
    /// END - close stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control
    Sendme = 5,
    /// EXTEND - extend circuit (deprecated)
    Extend = 6,
    /// EXTENDED - circuit extended (deprecated)
    Extended = 7,
    /// TRUNCATE - truncate circuit
    Truncate = 8,
    /// TRUNCATED - circuit truncated
    Truncated = 9,
    /// DROP - drop cell
    Drop = 10,
    /// RESOLVE - DNS resolve
    Resolve = 11,
    /// RESOLVED - DNS resolved
    Resolved = 12,
    /// BEGIN_DIR - begin directory connection
    BeginDir = 13,
    /// EXTEND2 - extend circuit (current)
    Extend2 = 14,
    /// EXTENDED2 - circuit extended (current)
    Extended2 = 15,
    /// ESTABLISH_RENDEZVOUS - ask a relay to act as rendezvous point
    EstablishRendezvous = 33,
    /// INTRODUCE1 - introduction request to a service's intro point
    Introduce1 = 34,
    /// RENDEZVOUS2 - service handshake forwarded by the rendezvous point
    Rendezvous2 = 37,
    /// RENDEZVOUS_ESTABLISHED - rendezvous point accepted the cookie
    RendezvousEstablished = 39,
    /// INTRODUCE_ACK - intro point's reply to INTRODUCE1
    IntroduceAck = 40,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            33 => Some(RelayCommand::EstablishRendezvous),
            34 => Some(RelayCommand::Introduce1),
            37 => Some(RelayCommand::Rendezvous2),
            39 => Some(RelayCommand::RendezvousEstablished),
            40 => Some(RelayCommand::IntroduceAck),
            _ => None,
        }
    }
}

/// END cell reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndReason {
    Misc = 1,
    ResolveFailed = 2,
    ConnectRefused = 3,
    ExitPolicy = 4,
    Destroy = 5,
    Done = 6,
    Timeout = 7,
    NoRoute = 8,
    Hibernating = 9,
    Internal = 10,
    ResourceLimit = 11,
    ConnReset = 12,
    TorProtocol = 13,
    NotDirectory = 14,
}

/// Relay cell header plus data, as carried inside a RELAY body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Recognized (always 0 for outgoing)
    pub recognized: u16,

    /// Stream ID (0 for circuit-level messages)
    pub stream_id: u16,

    /// Digest (4 bytes)
    pub digest: [u8; 4],

    /// Data (up to 498 bytes)
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Maximum data size in relay cell
    pub const MAX_DATA_SIZE: usize = Cell::PAYLOAD_SIZE - Self::HEADER_SIZE;

    pub const HEADER_SIZE: usize = 11;

    /// Byte range of the digest field inside the body
    pub const DIGEST_RANGE: std::ops::Range<usize> = 5..9;

    /// Create a new relay cell
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        }
    }

    /// Build a cell from a typed message
    pub fn from_message(stream_id: u16, message: &RelayMessage) -> Self {
        Self::new(message.command(), stream_id, message.encode())
    }

    /// Serialize to a full 509-byte body
    ///
    /// Data longer than [`Self::MAX_DATA_SIZE`] is truncated. Padding is four
    /// zero bytes followed by random bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let data_len = self.data.len().min(Self::MAX_DATA_SIZE);
        let mut buf = Vec::with_capacity(Cell::PAYLOAD_SIZE);

        buf.push(self.command as u8);
        buf.extend_from_slice(&self.recognized.to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.digest);
        buf.extend_from_slice(&(data_len as u16).to_be_bytes());
        buf.extend_from_slice(&self.data[..data_len]);

        let padding_start = buf.len();
        buf.resize(Cell::PAYLOAD_SIZE, 0);
        let random_start = (padding_start + 4).min(Cell::PAYLOAD_SIZE);
        rand::thread_rng().fill_bytes(&mut buf[random_start..]);

        buf
    }

    /// Parse relay cell from a decrypted body
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let raw_command = reader.u8()?;
        let recognized = reader.u16()?;
        let stream_id = reader.u16()?;
        let digest = reader.array::<4>()?;
        let length = reader.u16()? as usize;

        let command =
            RelayCommand::from_u8(raw_command).ok_or(TorError::UnknownRelayCommand(raw_command))?;

        if length > Self::MAX_DATA_SIZE {
            return Err(TorError::ProtocolError(format!(
                "Relay length {} exceeds cell body",
                length
            )));
        }
        let cell_data = reader
            .take(length)
            .map_err(|_| TorError::ProtocolError("Relay cell data truncated".into()))?
            .to_vec();

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: cell_data,
        })
    }

    /// Interpret the data field
    pub fn message(&self) -> Result<RelayMessage> {
        RelayMessage::decode(self.command, &self.data)
    }
}

/// Address returned in a CONNECTED cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectedAddress {
    /// Empty body (BEGIN_DIR, or exits that report nothing)
    None,
    Ipv4 { address: Ipv4Addr, ttl: u32 },
    Ipv6 { address: Ipv6Addr, ttl: u32 },
    /// Body present but not in either known layout
    Invalid,
}

impl ConnectedAddress {
    fn parse(data: &[u8]) -> Self {
        match data.len() {
            0 => ConnectedAddress::None,
            8 => {
                let octets = [data[0], data[1], data[2], data[3]];
                let ttl = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
                ConnectedAddress::Ipv4 {
                    address: Ipv4Addr::from(octets),
                    ttl,
                }
            }
            25 if data[..4] == [0; 4] && data[4] == 6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[5..21]);
                let ttl = u32::from_be_bytes([data[21], data[22], data[23], data[24]]);
                ConnectedAddress::Ipv6 {
                    address: Ipv6Addr::from(octets),
                    ttl,
                }
            }
            _ => ConnectedAddress::Invalid,
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            ConnectedAddress::None | ConnectedAddress::Invalid => Vec::new(),
            ConnectedAddress::Ipv4 { address, ttl } => {
                let mut out = address.octets().to_vec();
                out.extend_from_slice(&ttl.to_be_bytes());
                out
            }
            ConnectedAddress::Ipv6 { address, ttl } => {
                let mut out = vec![0, 0, 0, 0, 6];
                out.extend_from_slice(&address.octets());
                out.extend_from_slice(&ttl.to_be_bytes());
                out
            }
        }
    }
}

/// SENDME body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendmeMessage {
    pub version: u8,
    /// Digest being acknowledged (version 1 only)
    pub digest: Option<Vec<u8>>,
}

impl SendmeMessage {
    /// Version 0: a single zero byte
    pub fn v0() -> Self {
        Self {
            version: 0,
            digest: None,
        }
    }

    /// Version 1: authenticated with the digest of the last cell received
    pub fn v1(digest: Vec<u8>) -> Self {
        Self {
            version: 1,
            digest: Some(digest),
        }
    }

    fn parse(data: &[u8]) -> Self {
        let mut reader = ByteReader::new(data);
        let version = match reader.u8() {
            Ok(v) => v,
            Err(_) => return Self::v0(),
        };
        if version == 0 {
            return Self::v0();
        }
        let digest = reader
            .u16()
            .and_then(|len| reader.take(len as usize))
            .map(|d| d.to_vec())
            .ok();
        Self { version, digest }
    }

    fn encode(&self) -> Vec<u8> {
        match &self.digest {
            Some(digest) if self.version >= 1 => {
                let mut out = vec![self.version];
                out.extend_from_slice(&(digest.len() as u16).to_be_bytes());
                out.extend_from_slice(digest);
                out
            }
            _ => vec![0],
        }
    }
}

/// Link specifier, as used in EXTEND2 and INTRODUCE1
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpecifier {
    Ipv4 { address: Ipv4Addr, port: u16 },
    Ipv6 { address: Ipv6Addr, port: u16 },
    LegacyId([u8; 20]),
    Ed25519Id([u8; 32]),
    /// Types this client does not interpret, kept verbatim
    Unrecognized { ls_type: u8, data: Vec<u8> },
}

impl LinkSpecifier {
    pub const TYPE_IPV4: u8 = 0;
    pub const TYPE_IPV6: u8 = 1;
    pub const TYPE_LEGACY_ID: u8 = 2;
    pub const TYPE_ED25519_ID: u8 = 3;

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            LinkSpecifier::Ipv4 { address, port } => {
                out.extend_from_slice(&[Self::TYPE_IPV4, 6]);
                out.extend_from_slice(&address.octets());
                out.extend_from_slice(&port.to_be_bytes());
            }
            LinkSpecifier::Ipv6 { address, port } => {
                out.extend_from_slice(&[Self::TYPE_IPV6, 18]);
                out.extend_from_slice(&address.octets());
                out.extend_from_slice(&port.to_be_bytes());
            }
            LinkSpecifier::LegacyId(id) => {
                out.extend_from_slice(&[Self::TYPE_LEGACY_ID, 20]);
                out.extend_from_slice(id);
            }
            LinkSpecifier::Ed25519Id(id) => {
                out.extend_from_slice(&[Self::TYPE_ED25519_ID, 32]);
                out.extend_from_slice(id);
            }
            LinkSpecifier::Unrecognized { ls_type, data } => {
                out.push(*ls_type);
                out.push(data.len() as u8);
                out.extend_from_slice(data);
            }
        }
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let ls_type = reader.u8()?;
        let len = reader.u8()? as usize;
        let data = reader.take(len)?;
        let spec = match (ls_type, len) {
            (Self::TYPE_IPV4, 6) => LinkSpecifier::Ipv4 {
                address: Ipv4Addr::new(data[0], data[1], data[2], data[3]),
                port: u16::from_be_bytes([data[4], data[5]]),
            },
            (Self::TYPE_IPV6, 18) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[..16]);
                LinkSpecifier::Ipv6 {
                    address: Ipv6Addr::from(octets),
                    port: u16::from_be_bytes([data[16], data[17]]),
                }
            }
            (Self::TYPE_LEGACY_ID, 20) => {
                let mut id = [0u8; 20];
                id.copy_from_slice(data);
                LinkSpecifier::LegacyId(id)
            }
            (Self::TYPE_ED25519_ID, 32) => {
                let mut id = [0u8; 32];
                id.copy_from_slice(data);
                LinkSpecifier::Ed25519Id(id)
            }
            _ => LinkSpecifier::Unrecognized {
                ls_type,
                data: data.to_vec(),
            },
        };
        Ok(spec)
    }

    /// Encode a list as `NSPEC (1) | specifiers`
    pub fn encode_list(specs: &[LinkSpecifier]) -> Vec<u8> {
        let mut out = vec![specs.len() as u8];
        for spec in specs {
            spec.write(&mut out);
        }
        out
    }

    /// Decode a `NSPEC (1) | specifiers` block
    pub fn decode_list(data: &[u8]) -> Result<Vec<LinkSpecifier>> {
        let mut reader = ByteReader::new(data);
        let n = reader.u8()?;
        (0..n).map(|_| Self::read(&mut reader)).collect()
    }
}

/// EXTEND2 body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extend2Message {
    pub link_specifiers: Vec<LinkSpecifier>,
    pub handshake_type: u16,
    pub handshake_data: Vec<u8>,
}

impl Extend2Message {
    fn encode(&self) -> Vec<u8> {
        let mut out = LinkSpecifier::encode_list(&self.link_specifiers);
        out.extend_from_slice(&self.handshake_type.to_be_bytes());
        out.extend_from_slice(&(self.handshake_data.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.handshake_data);
        out
    }

    fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let n = reader.u8()?;
        let link_specifiers = (0..n)
            .map(|_| LinkSpecifier::read(&mut reader))
            .collect::<Result<Vec<_>>>()?;
        let handshake_type = reader.u16()?;
        let hlen = reader.u16()? as usize;
        let handshake_data = reader.take(hlen)?.to_vec();
        Ok(Self {
            link_specifiers,
            handshake_type,
            handshake_data,
        })
    }
}

/// INTRODUCE_ACK status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntroduceAckStatus {
    Success,
    UnrecognizedServiceId,
    BadMessageFormat,
    CantRelay,
    Other(u16),
}

impl From<u16> for IntroduceAckStatus {
    fn from(v: u16) -> Self {
        match v {
            0 => IntroduceAckStatus::Success,
            1 => IntroduceAckStatus::UnrecognizedServiceId,
            2 => IntroduceAckStatus::BadMessageFormat,
            3 => IntroduceAckStatus::CantRelay,
            other => IntroduceAckStatus::Other(other),
        }
    }
}

impl From<IntroduceAckStatus> for u16 {
    fn from(s: IntroduceAckStatus) -> u16 {
        match s {
            IntroduceAckStatus::Success => 0,
            IntroduceAckStatus::UnrecognizedServiceId => 1,
            IntroduceAckStatus::BadMessageFormat => 2,
            IntroduceAckStatus::CantRelay => 3,
            IntroduceAckStatus::Other(v) => v,
        }
    }
}

/// Typed relay message, one variant per command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// BEGIN: "host:port\0"
    Begin { target: String },
    BeginDir,
    Data(Vec<u8>),
    End { reason: u8 },
    Connected(ConnectedAddress),
    Sendme(SendmeMessage),
    Extend2(Extend2Message),
    Extended2(HandshakeReply),
    Truncate,
    Truncated { reason: u8 },
    Drop,
    EstablishRendezvous { cookie: [u8; 20] },
    RendezvousEstablished,
    /// INTRODUCE1 payload, built by the hidden-service layer
    Introduce1(Vec<u8>),
    IntroduceAck { status: IntroduceAckStatus },
    Rendezvous2(HandshakeReply),
    /// Known command with no client-side interpretation (RESOLVE, EXTEND, ...)
    Unhandled { command: RelayCommand, data: Vec<u8> },
}

impl RelayMessage {
    pub fn command(&self) -> RelayCommand {
        match self {
            RelayMessage::Begin { .. } => RelayCommand::Begin,
            RelayMessage::BeginDir => RelayCommand::BeginDir,
            RelayMessage::Data(_) => RelayCommand::Data,
            RelayMessage::End { .. } => RelayCommand::End,
            RelayMessage::Connected(_) => RelayCommand::Connected,
            RelayMessage::Sendme(_) => RelayCommand::Sendme,
            RelayMessage::Extend2(_) => RelayCommand::Extend2,
            RelayMessage::Extended2(_) => RelayCommand::Extended2,
            RelayMessage::Truncate => RelayCommand::Truncate,
            RelayMessage::Truncated { .. } => RelayCommand::Truncated,
            RelayMessage::Drop => RelayCommand::Drop,
            RelayMessage::EstablishRendezvous { .. } => RelayCommand::EstablishRendezvous,
            RelayMessage::RendezvousEstablished => RelayCommand::RendezvousEstablished,
            RelayMessage::Introduce1(_) => RelayCommand::Introduce1,
            RelayMessage::IntroduceAck { .. } => RelayCommand::IntroduceAck,
            RelayMessage::Rendezvous2(_) => RelayCommand::Rendezvous2,
            RelayMessage::Unhandled { command, .. } => *command,
        }
    }

    /// Encode the data field
    pub fn encode(&self) -> Vec<u8> {
        match self {
            RelayMessage::Begin { target } => {
                let mut out = target.as_bytes().to_vec();
                out.push(0);
                out
            }
            RelayMessage::BeginDir
            | RelayMessage::Drop
            | RelayMessage::RendezvousEstablished => Vec::new(),
            RelayMessage::Data(data) => data.clone(),
            RelayMessage::End { reason } | RelayMessage::Truncated { reason } => vec![*reason],
            RelayMessage::Connected(address) => address.encode(),
            RelayMessage::Sendme(sendme) => sendme.encode(),
            RelayMessage::Extend2(extend) => extend.encode(),
            RelayMessage::Extended2(reply) => {
                let hdata = reply.to_bytes();
                let mut out = (hdata.len() as u16).to_be_bytes().to_vec();
                out.extend_from_slice(&hdata);
                out
            }
            RelayMessage::Truncate => vec![0],
            RelayMessage::EstablishRendezvous { cookie } => cookie.to_vec(),
            RelayMessage::Introduce1(payload) => payload.clone(),
            RelayMessage::IntroduceAck { status } => {
                let mut out = u16::from(*status).to_be_bytes().to_vec();
                out.push(0);
                out
            }
            RelayMessage::Rendezvous2(reply) => reply.to_bytes(),
            RelayMessage::Unhandled { data, .. } => data.clone(),
        }
    }

    /// Decode the data field for a given command
    ///
    /// Short or missing bodies fall back to a default variant instead of
    /// failing; only framing errors in EXTEND2 bodies are reported.
    pub fn decode(command: RelayCommand, data: &[u8]) -> Result<Self> {
        let message = match command {
            RelayCommand::Begin => {
                let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                RelayMessage::Begin {
                    target: String::from_utf8_lossy(&data[..end]).into_owned(),
                }
            }
            RelayCommand::BeginDir => RelayMessage::BeginDir,
            RelayCommand::Data => RelayMessage::Data(data.to_vec()),
            RelayCommand::End => RelayMessage::End {
                reason: data.first().copied().unwrap_or(EndReason::Misc as u8),
            },
            RelayCommand::Connected => RelayMessage::Connected(ConnectedAddress::parse(data)),
            RelayCommand::Sendme => RelayMessage::Sendme(SendmeMessage::parse(data)),
            RelayCommand::Extend2 => RelayMessage::Extend2(Extend2Message::parse(data)?),
            RelayCommand::Extended2 => {
                let hdata = match data {
                    [hi, lo, rest @ ..] => {
                        let hlen = u16::from_be_bytes([*hi, *lo]) as usize;
                        &rest[..hlen.min(rest.len())]
                    }
                    _ => &[],
                };
                RelayMessage::Extended2(HandshakeReply::from_bytes(hdata))
            }
            RelayCommand::Truncate => RelayMessage::Truncate,
            RelayCommand::Truncated => RelayMessage::Truncated {
                reason: data.first().copied().unwrap_or(0),
            },
            RelayCommand::Drop => RelayMessage::Drop,
            RelayCommand::EstablishRendezvous => {
                let mut cookie = [0u8; 20];
                let n = data.len().min(20);
                cookie[..n].copy_from_slice(&data[..n]);
                RelayMessage::EstablishRendezvous { cookie }
            }
            RelayCommand::RendezvousEstablished => RelayMessage::RendezvousEstablished,
            RelayCommand::Introduce1 => RelayMessage::Introduce1(data.to_vec()),
            RelayCommand::IntroduceAck => {
                let status = match data {
                    [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
                    _ => u16::from(IntroduceAckStatus::BadMessageFormat),
                };
                RelayMessage::IntroduceAck {
                    status: status.into(),
                }
            }
            RelayCommand::Rendezvous2 => RelayMessage::Rendezvous2(HandshakeReply::from_bytes(data)),
            other @ (RelayCommand::Extend
            | RelayCommand::Extended
            | RelayCommand::Resolve
            | RelayCommand::Resolved) => RelayMessage::Unhandled {
                command: other,
                data: data.to_vec(),
            },
        };
        Ok(message)
    }
}
