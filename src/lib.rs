//! # Onion Client
//!
//! Client core of an onion-routing network: link handshake, cells, onion
//! crypto, circuits, streams, guard/vanguard selection and hidden-service
//! rendezvous.
//!
//! ## Architecture
//!
//! ```text
//! CircuitManager
//!   ↓                       ↘
//! Circuit (onion pipeline)    VanguardsLite → GuardSystem
//!   ↓
//! Channel (link to the guard: writer + listener tasks)
//!   ↓
//! Transport (TLS over TCP, supplied by the caller)
//! ```
//!
//! Directory fetching and consensus parsing are not part of this crate:
//! callers supply [`RouterDescriptor`]s and, for hidden services,
//! [`IntroductionPoint`]s.

pub mod circuit_manager;
pub mod config;
mod error;
pub mod guards;
pub mod hs;
pub mod protocol;
pub mod storage;
pub mod vanguards;

pub use circuit_manager::{CircuitManager, RendezvousInfo};
pub use config::ClientConfig;
pub use error::{ErrorCode, Result, TorError};
pub use guards::{GuardConnector, GuardPoolState, GuardSystem};
pub use hs::OnionAddress;
pub use protocol::{
    Channel, Circuit, CircuitStatus, IntroductionPoint, RelaySelector, RouterDescriptor,
    TorStream, Transport, TransportStream,
};
pub use storage::{JsonFileStore, MemoryStore, StateStore};
pub use vanguards::{PoolState, Vanguard, VanguardLayer, VanguardsLite};
