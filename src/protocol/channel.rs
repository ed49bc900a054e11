//! Guard link connections
//!
//! A [`Channel`] is one authenticated link to a guard relay. Opening it runs
//! the link handshake:
//!
//! 1. VERSIONS out, VERSIONS back; the highest shared version wins
//! 2. CERTS, verified against the peer's TLS leaf certificate
//! 3. AUTH_CHALLENGE (clients never authenticate, it is only read)
//! 4. NETINFO in, NETINFO out
//!
//! Afterwards two tasks own the split stream: a writer draining the outbound
//! cell queue and a listener dispatching received cells into the circuit
//! table. Cells for unknown circuit ids are dropped.

use super::cell::{
    read_cell, write_cell, Cell, CellCommand, ChannelMessage, NetInfoCell, VersionsCell,
};
use super::circuit::{Circuit, CircuitSettings, CircuitTable, ChannelLink};
use super::relay::RouterDescriptor;
use crate::config::ClientConfig;
use crate::error::{Result, TorError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Byte stream a link runs over (TLS over TCP in practice)
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkStream for T {}

/// A connected transport plus the peer's leaf certificate (DER)
pub struct TransportStream {
    pub stream: Box<dyn LinkStream>,
    pub peer_certificate: Vec<u8>,
}

/// Opens transports to relays
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, router: &RouterDescriptor) -> Result<TransportStream>;
}

/// Authenticated link to a guard relay
pub struct Channel {
    router: RouterDescriptor,
    link_version: u16,
    peer_identity: [u8; 32],
    sender: mpsc::UnboundedSender<Cell>,
    circuits: CircuitTable,
    connected: Arc<AtomicBool>,
    settings: CircuitSettings,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("router", &self.router.nickname)
            .field("link_version", &self.link_version)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Channel {
    /// Connect to `router` through `transport` and run the link handshake
    pub async fn connect(
        transport: &dyn Transport,
        router: &RouterDescriptor,
        config: &ClientConfig,
    ) -> Result<Self> {
        log::info!(
            "📡 Connecting to guard {} ({})",
            router.nickname,
            router.socket_addr()
        );
        let TransportStream {
            stream,
            peer_certificate,
        } = transport.connect(router).await?;
        Self::handshake(stream, &peer_certificate, router, config).await
    }

    /// Run the link handshake over an already-connected stream
    ///
    /// On failure the stream is shut down and dropped.
    pub async fn handshake(
        mut stream: Box<dyn LinkStream>,
        peer_certificate: &[u8],
        router: &RouterDescriptor,
        config: &ClientConfig,
    ) -> Result<Self> {
        let negotiated = tokio::time::timeout(
            config.cell_timeout,
            negotiate(&mut stream, peer_certificate, &config.link_versions),
        )
        .await
        .unwrap_or_else(|_| Err(TorError::Timeout("link handshake".into())));

        let (link_version, peer_identity) = match negotiated {
            Ok(result) => result,
            Err(e) => {
                log::warn!("⚠️ Link handshake with {} failed: {}", router.nickname, e);
                if let Err(e) = stream.shutdown().await {
                    log::debug!("Link shutdown: {}", e);
                }
                return Err(e);
            }
        };
        log::info!(
            "✅ Link to {} established (link protocol v{})",
            router.nickname,
            link_version
        );

        let (reader, writer) = tokio::io::split(stream);
        let (sender, outgoing) = mpsc::unbounded_channel();
        let circuits: CircuitTable = Default::default();
        let connected = Arc::new(AtomicBool::new(true));

        let tasks = vec![
            tokio::spawn(write_loop(
                writer,
                outgoing,
                circuits.clone(),
                connected.clone(),
            )),
            tokio::spawn(read_loop(reader, circuits.clone(), connected.clone())),
        ];

        Ok(Self {
            router: router.clone(),
            link_version,
            peer_identity,
            sender,
            circuits,
            connected,
            settings: CircuitSettings::from(config),
            tasks,
        })
    }

    pub fn router(&self) -> &RouterDescriptor {
        &self.router
    }

    pub fn link_version(&self) -> u16 {
        self.link_version
    }

    /// Ed25519 identity proven by the CERTS cell
    pub fn peer_identity(&self) -> &[u8; 32] {
        &self.peer_identity
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn circuit_count(&self) -> usize {
        self.circuits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Register a new circuit on this link
    ///
    /// `raw_id` gets the client bit forced on; a collision with a live
    /// circuit is an error so the caller can draw another id.
    pub fn new_circuit(&self, raw_id: u32) -> Result<Circuit> {
        let circuit = Circuit::new(
            raw_id,
            self.router.clone(),
            ChannelLink {
                sender: self.sender.clone(),
                table: Arc::downgrade(&self.circuits),
            },
            self.settings.clone(),
        );

        let mut table = self
            .circuits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Checked under the lock: teardown clears the flag before draining
        if !self.is_connected() {
            return Err(TorError::ConnectionClosed);
        }
        if table.contains_key(&circuit.id()) {
            return Err(TorError::InvalidState(format!(
                "Circuit id {:#x} already in use",
                circuit.id()
            )));
        }
        table.insert(circuit.id(), circuit.clone());
        log::debug!(
            "Registered circuit {:#x} on {}",
            circuit.id(),
            self.router.nickname
        );
        Ok(circuit)
    }

    /// Close the link; every circuit on it becomes disconnected
    pub fn terminate(&mut self) {
        if !self.connected.swap(false, Ordering::SeqCst) && self.tasks.is_empty() {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        disconnect_all(&self.circuits);
        log::info!("🔌 Link to {} terminated", self.router.nickname);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Client side of VERSIONS / CERTS / AUTH_CHALLENGE / NETINFO
async fn negotiate(
    stream: &mut Box<dyn LinkStream>,
    peer_certificate: &[u8],
    our_versions: &[u16],
) -> Result<(u16, [u8; 32])> {
    log::debug!("  🤝 Sending VERSIONS {:?}", our_versions);
    write_cell(stream, &VersionsCell::new(our_versions).to_cell()).await?;

    let versions = match ChannelMessage::parse(read_cell(stream, 2).await?)? {
        Some(ChannelMessage::Versions(versions)) => versions,
        other => return Err(unexpected("VERSIONS", other.as_ref())),
    };
    let link_version = versions.highest_shared(our_versions).ok_or_else(|| {
        TorError::HandshakeFailed(format!(
            "No shared link protocol version (relay offers {:?})",
            versions.versions
        ))
    })?;

    let certs = match next_link_message(stream).await? {
        ChannelMessage::Certs(certs) => certs,
        other => return Err(unexpected("CERTS", Some(&other))),
    };
    let peer_identity = certs.verify(peer_certificate)?;

    match next_link_message(stream).await? {
        ChannelMessage::AuthChallenge(challenge) => {
            log::trace!("AUTH_CHALLENGE offers methods {:?}", challenge.methods)
        }
        other => return Err(unexpected("AUTH_CHALLENGE", Some(&other))),
    }

    let netinfo = match next_link_message(stream).await? {
        ChannelMessage::NetInfo(netinfo) => netinfo,
        other => return Err(unexpected("NETINFO", Some(&other))),
    };
    let relay_address = netinfo.my_addresses.first().cloned().ok_or_else(|| {
        TorError::HandshakeFailed("NETINFO carries no relay address".into())
    })?;

    let reply = NetInfoCell {
        timestamp: 0,
        other_address: relay_address,
        my_addresses: Vec::new(),
    };
    write_cell(stream, &reply.to_cell()).await?;

    Ok((link_version, peer_identity))
}

/// Next non-padding cell during the handshake (4-byte circuit ids)
async fn next_link_message(stream: &mut Box<dyn LinkStream>) -> Result<ChannelMessage> {
    loop {
        if let Some(message) = ChannelMessage::parse(read_cell(stream, 4).await?)? {
            return Ok(message);
        }
    }
}

fn unexpected(expected: &str, got: Option<&ChannelMessage>) -> TorError {
    TorError::UnexpectedCell {
        expected: expected.into(),
        got: got.map(|m| m.name()).unwrap_or("PADDING").into(),
    }
}

async fn write_loop(
    mut writer: WriteHalf<Box<dyn LinkStream>>,
    mut outgoing: mpsc::UnboundedReceiver<Cell>,
    circuits: CircuitTable,
    connected: Arc<AtomicBool>,
) {
    while let Some(cell) = outgoing.recv().await {
        if let Err(e) = write_cell(&mut writer, &cell).await {
            log::warn!("⚠️ Link write failed: {}", e);
            break;
        }
    }
    connected.store(false, Ordering::SeqCst);
    disconnect_all(&circuits);
    if let Err(e) = writer.shutdown().await {
        log::debug!("Link shutdown: {}", e);
    }
}

async fn read_loop(
    mut reader: ReadHalf<Box<dyn LinkStream>>,
    circuits: CircuitTable,
    connected: Arc<AtomicBool>,
) {
    loop {
        let cell = match read_cell(&mut reader, 4).await {
            Ok(cell) => cell,
            Err(TorError::ConnectionClosed) => {
                log::info!("🔌 Guard closed the link");
                break;
            }
            Err(e) => {
                log::warn!("⚠️ Link read failed: {}", e);
                break;
            }
        };

        let circuit_id = cell.circuit_id;
        let command = cell.command;
        let circuit = circuits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&circuit_id)
            .cloned();

        match (ChannelMessage::parse(cell), circuit) {
            (Ok(None), _) => {}
            (Ok(Some(message)), Some(circuit)) => circuit.add_cell(message),
            (Ok(Some(message)), None) => {
                log::debug!(
                    "Dropping {} for unknown circuit {:#x}",
                    message.name(),
                    circuit_id
                );
            }
            (Err(e), Some(circuit)) => circuit.fail(e),
            (Err(e), None) if command == CellCommand::Versions => {
                log::debug!("Ignoring late VERSIONS: {}", e);
            }
            (Err(e), None) => {
                log::warn!("⚠️ Malformed cell on circuit {:#x}: {}", circuit_id, e);
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    disconnect_all(&circuits);
}

fn disconnect_all(circuits: &CircuitTable) {
    let drained: Vec<Circuit> = circuits
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .drain()
        .map(|(_, circuit)| circuit)
        .collect();
    for circuit in drained {
        circuit.disconnected();
    }
}
