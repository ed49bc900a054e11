//! Onion routing protocol implementation
//!
//! This module implements the client side of the relay protocol, including:
//! - Cell framing (fixed and variable length)
//! - Link handshake and CERTS verification
//! - Circuit key agreement (CREATE_FAST, ntor, ntor-v3, hs-ntor)
//! - The onion pipeline, SENDME flow control and streams

pub mod cell;
pub mod certs;
pub mod channel;
pub mod circuit;
pub mod crypto;
pub mod flow_control;
pub mod handshake;
pub mod relay;
pub mod relay_cell;
pub mod stream;

pub use cell::{Cell, CellCommand, ChannelMessage, DestroyReason};
pub use certs::CertsCell;
pub use channel::{Channel, LinkStream, Transport, TransportStream};
pub use circuit::{Circuit, CircuitSettings, CircuitStatus};
pub use crypto::KeyMaterial;
pub use flow_control::{CircuitFlowControl, StreamFlowControl};
pub use handshake::{ClientHandshake, HandshakeReply, HandshakeType, HsNtorClient};
pub use relay::{ExitPolicy, IntroductionPoint, RelayFlags, RelaySelector, RouterDescriptor};
pub use relay_cell::{IntroduceAckStatus, LinkSpecifier, RelayCell, RelayCommand, RelayMessage};
pub use stream::TorStream;
