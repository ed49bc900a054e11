//! Circuits
//!
//! A [`Circuit`] is a cheap handle onto state shared with the guard's
//! listener task. The listener feeds received cells in through
//! [`Circuit::add_cell`]; callers block in [`Circuit::wait_for_relay`] and
//! friends until a matching cell is queued, the circuit goes away, or the
//! cell timeout expires.
//!
//! ## Onion pipeline
//!
//! Outbound, a relay body is digested with the forward digest of the hop it
//! is addressed to and then encrypted from that hop down to the guard.
//! Inbound, every hop's backward layer is stripped in order and the embedded
//! digest is checked against the last hop's backward digest. A mismatch
//! destroys the circuit.

use super::cell::{create2_cell, create_fast_cell, destroy_cell, Cell, ChannelMessage, DestroyReason};
use super::crypto::{HopCrypto, KeyMaterial};
use super::flow_control::{CircuitFlowControl, StreamFlowControl};
use super::handshake::{ClientHandshake, FastClient, HandshakeReply, HsNtorClient};
use super::relay::{IntroductionPoint, RouterDescriptor};
use super::relay_cell::{
    EndReason, Extend2Message, IntroduceAckStatus, RelayCell, RelayCommand, RelayMessage,
    SendmeMessage,
};
use super::stream::TorStream;
use crate::config::ClientConfig;
use crate::error::{Result, TorError};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Circuit id → circuit, owned by the guard connection
pub type CircuitTable = Arc<Mutex<HashMap<u32, Circuit>>>;

/// High bit marking a circuit id as client-chosen
pub const CLIENT_CIRCUIT_BIT: u32 = 0x8000_0000;

/// SENDME v1 acknowledges the first 20 bytes of a relay digest
const SENDME_DIGEST_LEN: usize = 20;

/// Force the client bit onto a raw circuit id
pub fn client_circuit_id(raw: u32) -> u32 {
    raw | CLIENT_CIRCUIT_BIT
}

/// Lifecycle of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    /// No CREATE exchanged yet
    NotSet,
    /// At least one hop established
    Connected,
    /// Torn down locally or by a DESTROY carrying this reason
    Destroyed(u8),
    /// The guard connection went away
    Disconnected,
}

/// Per-circuit knobs taken from [`ClientConfig`]
#[derive(Debug, Clone)]
pub struct CircuitSettings {
    pub cell_timeout: Duration,
    pub sendme_version: u8,
    pub circuit_window: u32,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for CircuitSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            cell_timeout: config.cell_timeout,
            sendme_version: config.sendme_version,
            circuit_window: config.circuit_window,
        }
    }
}

/// Outbound side of the guard link a circuit rides on
#[derive(Clone)]
pub(crate) struct ChannelLink {
    pub(crate) sender: mpsc::UnboundedSender<Cell>,
    pub(crate) table: Weak<Mutex<HashMap<u32, Circuit>>>,
}

struct Hop {
    /// `None` for the virtual hop appended after a rendezvous
    router: Option<RouterDescriptor>,
    crypto: HopCrypto,
    window: CircuitFlowControl,
    /// Digests of DATA cells this hop will acknowledge with a circuit SENDME,
    /// oldest first
    sendme_digests: VecDeque<Vec<u8>>,
}

enum PendingCell {
    CreatedFast { y: [u8; 20], kh: [u8; 20] },
    Created2 { hdata: Vec<u8> },
    Relay { stream_id: u16, message: RelayMessage },
}

struct CircuitState {
    status: CircuitStatus,
    /// Error that destroyed the circuit, reported to waiters
    failure: Option<TorError>,
    hops: Vec<Hop>,
    pending: VecDeque<PendingCell>,
    streams: HashMap<u16, StreamFlowControl>,
}

impl CircuitState {
    fn closed_error(&self) -> Option<TorError> {
        match self.status {
            CircuitStatus::NotSet | CircuitStatus::Connected => None,
            CircuitStatus::Destroyed(reason) => Some(
                self.failure
                    .clone()
                    .unwrap_or_else(|| TorError::circuit_destroyed(reason)),
            ),
            CircuitStatus::Disconnected => Some(TorError::ConnectionClosed),
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.status, CircuitStatus::NotSet | CircuitStatus::Connected)
    }

    fn take_pending(&mut self, matches: impl Fn(&PendingCell) -> bool) -> Option<PendingCell> {
        let index = self.pending.iter().position(matches)?;
        self.pending.remove(index)
    }

    fn take_relay(&mut self, stream_id: u16, commands: &[RelayCommand]) -> Option<RelayMessage> {
        let found = self.take_pending(|cell| match cell {
            PendingCell::Relay {
                stream_id: id,
                message,
            } => *id == stream_id && commands.contains(&message.command()),
            _ => false,
        });
        match found {
            Some(PendingCell::Relay { message, .. }) => Some(message),
            _ => None,
        }
    }

    /// Digest and onion-encrypt a relay message addressed to `level`
    ///
    /// DATA to the last hop is charged to its circuit window.
    fn encrypt_relay(
        &mut self,
        circuit_id: u32,
        stream_id: u16,
        message: &RelayMessage,
        level: usize,
    ) -> Result<Cell> {
        if level >= self.hops.len() {
            return Err(TorError::InvalidState(format!(
                "No hop {} on a {}-hop circuit",
                level,
                self.hops.len()
            )));
        }

        let mut body = RelayCell::from_message(stream_id, message).to_bytes();
        let last = self.hops.len() - 1;

        let hop = &mut self.hops[level];
        let closes_increment = match message {
            RelayMessage::Data(_) if level == last => hop.window.on_package()?,
            _ => false,
        };
        hop.crypto.forward_digest.update(&body);
        let digest = hop.crypto.forward_digest.current();
        body[RelayCell::DIGEST_RANGE].copy_from_slice(&digest[..4]);
        if closes_increment {
            hop.sendme_digests
                .push_back(digest[..SENDME_DIGEST_LEN.min(digest.len())].to_vec());
        }

        for hop in self.hops[..=level].iter_mut().rev() {
            hop.crypto.forward_cipher.apply(&mut body);
        }

        let early = matches!(message, RelayMessage::Extend2(_));
        Ok(Cell::relay(circuit_id, body, early))
    }

    /// Strip every layer and verify against the last hop's backward digest
    fn decrypt_relay(&mut self, mut body: Vec<u8>) -> Result<(RelayCell, Vec<u8>)> {
        if self.hops.is_empty() {
            return Err(TorError::ProtocolError(
                "RELAY cell on a circuit with no hops".into(),
            ));
        }
        if body.len() != Cell::PAYLOAD_SIZE {
            return Err(TorError::ProtocolError(format!(
                "RELAY body of {} bytes",
                body.len()
            )));
        }

        for hop in self.hops.iter_mut() {
            hop.crypto.backward_cipher.apply(&mut body);
        }

        let mut received = [0u8; 4];
        received.copy_from_slice(&body[RelayCell::DIGEST_RANGE]);
        body[RelayCell::DIGEST_RANGE].fill(0);

        let last = self.hops.len() - 1;
        let hop = &mut self.hops[last];
        hop.crypto.backward_digest.update(&body);
        let digest = hop.crypto.backward_digest.current();

        if body[1..3] != [0, 0] || digest[..4] != received {
            log::warn!(
                "⚠️ Relay digest mismatch: received {:02x?}, expected {:02x?}",
                received,
                &digest[..4]
            );
            return Err(TorError::DigestMismatch);
        }

        let cell = RelayCell::from_bytes(&body)?;
        Ok((cell, digest))
    }

    fn can_package(&self, stream_id: u16) -> Option<Result<()>> {
        let stream = match self.streams.get(&stream_id) {
            Some(stream) => stream,
            None => {
                return Some(Err(TorError::Stream(format!(
                    "Stream {} is not open",
                    stream_id
                ))))
            }
        };
        let circuit_ok = self
            .hops
            .last()
            .map_or(false, |hop| hop.window.package.can_send());
        (stream.package.can_send() && circuit_ok).then_some(Ok(()))
    }
}

struct CircuitShared {
    id: u32,
    guard: RouterDescriptor,
    link: ChannelLink,
    settings: CircuitSettings,
    state: Mutex<CircuitState>,
    notify: Notify,
}

/// Handle onto a circuit
#[derive(Clone)]
pub struct Circuit {
    shared: Arc<CircuitShared>,
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &format_args!("{:#010x}", self.shared.id))
            .field("status", &self.status())
            .finish()
    }
}

impl Circuit {
    pub(crate) fn new(
        id: u32,
        guard: RouterDescriptor,
        link: ChannelLink,
        settings: CircuitSettings,
    ) -> Self {
        Self {
            shared: Arc::new(CircuitShared {
                id: client_circuit_id(id),
                guard,
                link,
                settings,
                state: Mutex::new(CircuitState {
                    status: CircuitStatus::NotSet,
                    failure: None,
                    hops: Vec::new(),
                    pending: VecDeque::new(),
                    streams: HashMap::new(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CircuitState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn status(&self) -> CircuitStatus {
        self.state().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == CircuitStatus::Connected
    }

    /// Number of established hops, virtual hops included
    pub fn hop_count(&self) -> usize {
        self.state().hops.len()
    }

    /// Routers of the established hops, guard first
    pub fn path(&self) -> Vec<RouterDescriptor> {
        self.state()
            .hops
            .iter()
            .filter_map(|hop| hop.router.clone())
            .collect()
    }

    pub fn guard(&self) -> &RouterDescriptor {
        &self.shared.guard
    }

    fn send_cell(&self, cell: Cell) -> Result<()> {
        self.shared
            .link
            .sender
            .send(cell)
            .map_err(|_| TorError::ConnectionClosed)
    }

    /// Send a relay message to the last hop
    pub fn send_relay(&self, stream_id: u16, message: &RelayMessage) -> Result<()> {
        let mut state = self.state();
        let level = state
            .hops
            .len()
            .checked_sub(1)
            .ok_or_else(|| TorError::InvalidState("Circuit has no hops".into()))?;
        self.send_relay_locked(&mut state, stream_id, message, level)
    }

    fn send_relay_locked(
        &self,
        state: &mut CircuitState,
        stream_id: u16,
        message: &RelayMessage,
        level: usize,
    ) -> Result<()> {
        if let Some(err) = state.closed_error() {
            return Err(err);
        }
        let cell = state.encrypt_relay(self.id(), stream_id, message, level)?;
        log::trace!(
            "📤 {:?} on circuit {:#x} stream {} via hop {}",
            message.command(),
            self.id(),
            stream_id,
            level
        );
        self.send_cell(cell)
    }

    /// Dispatch a cell received for this circuit
    ///
    /// Protocol violations destroy the circuit; waiters see the error.
    pub(crate) fn add_cell(&self, message: ChannelMessage) {
        let outcome = {
            let mut state = self.state();
            match message {
                ChannelMessage::CreatedFast { y, kh } => {
                    state.pending.push_back(PendingCell::CreatedFast { y, kh });
                    Ok(())
                }
                ChannelMessage::Created2 { hdata } => {
                    state.pending.push_back(PendingCell::Created2 { hdata });
                    Ok(())
                }
                ChannelMessage::Relay { body, .. } => self.handle_relay(&mut state, body),
                ChannelMessage::Destroy { reason } => {
                    drop(state);
                    self.destroyed(reason);
                    return;
                }
                other => {
                    log::warn!(
                        "⚠️ Ignoring {} addressed to circuit {:#x}",
                        other.name(),
                        self.id()
                    );
                    Ok(())
                }
            }
        };

        match outcome {
            Ok(()) => self.shared.notify.notify_waiters(),
            Err(e) => {
                log::warn!("⚠️ Circuit {:#x} protocol violation: {}", self.id(), e);
                self.tear_down(Some(e));
            }
        }
    }

    fn handle_relay(&self, state: &mut CircuitState, body: Vec<u8>) -> Result<()> {
        let (relay, digest) = state.decrypt_relay(body)?;
        let stream_id = relay.stream_id;
        let message = relay.message()?;
        let last = state.hops.len() - 1;

        match message {
            RelayMessage::Data(_) => {
                let stream = state.streams.get_mut(&stream_id).ok_or_else(|| {
                    TorError::ProtocolError(format!("DATA for unknown stream {}", stream_id))
                })?;
                if stream.on_receive_data() {
                    let sendme = RelayMessage::Sendme(SendmeMessage::v0());
                    self.send_relay_locked(state, stream_id, &sendme, last)?;
                }
                if state.hops[last].window.on_receive() {
                    let sendme = if self.shared.settings.sendme_version >= 1 {
                        SendmeMessage::v1(digest[..SENDME_DIGEST_LEN.min(digest.len())].to_vec())
                    } else {
                        SendmeMessage::v0()
                    };
                    self.send_relay_locked(state, 0, &RelayMessage::Sendme(sendme), last)?;
                }
                state.pending.push_back(PendingCell::Relay { stream_id, message });
            }
            RelayMessage::End { reason } => {
                log::debug!("Stream {} ended by peer (reason {})", stream_id, reason);
                state.streams.remove(&stream_id);
                state.pending.push_back(PendingCell::Relay { stream_id, message });
            }
            RelayMessage::Sendme(sendme) => {
                if stream_id == 0 {
                    let hop = &mut state.hops[last];
                    let expected = hop.sendme_digests.pop_front().ok_or_else(|| {
                        TorError::ProtocolError("Circuit SENDME with no DATA outstanding".into())
                    })?;
                    if sendme.version >= 1 && sendme.digest.as_deref() != Some(expected.as_slice()) {
                        return Err(TorError::ProtocolError(
                            "SENDME acknowledges a digest that was never sent".into(),
                        ));
                    }
                    hop.window.package.on_sendme();
                } else if let Some(stream) = state.streams.get_mut(&stream_id) {
                    stream.package.on_sendme();
                }
            }
            message => state.pending.push_back(PendingCell::Relay { stream_id, message }),
        }
        Ok(())
    }

    /// Wait until `take` extracts something from the state
    ///
    /// Queued cells are still delivered after the circuit closes. Running
    /// out of time tears the circuit down.
    async fn wait_for<T>(
        &self,
        what: &str,
        mut take: impl FnMut(&mut CircuitState) -> Option<T>,
    ) -> Result<T> {
        let deadline = tokio::time::Instant::now() + self.shared.settings.cell_timeout;
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(found) = take(&mut *state) {
                    return Ok(found);
                }
                if let Some(err) = state.closed_error() {
                    return Err(err);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                log::warn!("⏰ Circuit {:#x} timed out waiting for {}", self.id(), what);
                self.tear_down(Some(TorError::Timeout(what.to_string())));
                return Err(TorError::Timeout(what.to_string()));
            }
        }
    }

    /// Wait for a relay message with one of `commands` on `stream_id`
    pub async fn wait_for_relay(
        &self,
        stream_id: u16,
        commands: &[RelayCommand],
    ) -> Result<RelayMessage> {
        let what = format!("{:?} on stream {}", commands, stream_id);
        self.wait_for(&what, |state| state.take_relay(stream_id, commands))
            .await
    }

    fn expect_status(&self, expected: CircuitStatus) -> Result<()> {
        let state = self.state();
        if let Some(err) = state.closed_error() {
            return Err(err);
        }
        if state.status != expected {
            return Err(TorError::InvalidState(format!(
                "Circuit {:#x} is {:?}, expected {:?}",
                self.id(),
                state.status,
                expected
            )));
        }
        Ok(())
    }

    /// Append a hop from handshake output, or tear down when there are no keys
    fn finish_hop(
        &self,
        router: Option<RouterDescriptor>,
        keys: Option<KeyMaterial>,
        handshake: &str,
    ) -> Result<()> {
        let keys = match keys {
            Some(keys) => keys,
            None => {
                let err = TorError::HandshakeFailed(format!("{} reply did not verify", handshake));
                self.tear_down(Some(err.clone()));
                return Err(err);
            }
        };
        self.append_hop(router, keys)?;
        log::info!(
            "    ✅ {} complete on circuit {:#x} (now {} hops)",
            handshake,
            self.id(),
            self.hop_count()
        );
        Ok(())
    }

    pub(crate) fn append_hop(
        &self,
        router: Option<RouterDescriptor>,
        keys: KeyMaterial,
    ) -> Result<()> {
        let crypto = keys.into_hop()?;
        let mut state = self.state();
        state.hops.push(Hop {
            router,
            crypto,
            window: CircuitFlowControl::with_window(self.shared.settings.circuit_window),
            sendme_digests: VecDeque::new(),
        });
        state.status = CircuitStatus::Connected;
        Ok(())
    }

    /// Establish the first hop with CREATE_FAST
    pub async fn create_fast(&self) -> Result<()> {
        self.expect_status(CircuitStatus::NotSet)?;
        let fast = FastClient::new();
        log::info!("    🤝 CREATE_FAST on circuit {:#x}", self.id());
        self.send_cell(create_fast_cell(self.id(), fast.x()))?;

        let (y, kh) = self
            .wait_for("CREATED_FAST", |state| {
                match state.take_pending(|c| matches!(c, PendingCell::CreatedFast { .. })) {
                    Some(PendingCell::CreatedFast { y, kh }) => Some((y, kh)),
                    _ => None,
                }
            })
            .await?;

        let keys = fast.complete(&y, &kh);
        self.finish_hop(Some(self.shared.guard.clone()), keys, "CREATE_FAST")
    }

    /// Establish the first hop with CREATE2, using ntor-v3 when the guard
    /// advertises an Ed25519 identity
    pub async fn create2(&self) -> Result<()> {
        let handshake = ClientHandshake::for_router(&self.shared.guard);
        self.create2_with(handshake).await
    }

    pub async fn create2_with(&self, handshake: ClientHandshake) -> Result<()> {
        self.expect_status(CircuitStatus::NotSet)?;
        log::info!(
            "    🤝 CREATE2 ({:?}) to {} on circuit {:#x}",
            handshake.handshake_type(),
            self.shared.guard.nickname,
            self.id()
        );
        self.send_cell(create2_cell(
            self.id(),
            handshake.handshake_type() as u16,
            &handshake.onionskin(),
        ))?;

        let hdata = self
            .wait_for("CREATED2", |state| {
                match state.take_pending(|c| matches!(c, PendingCell::Created2 { .. })) {
                    Some(PendingCell::Created2 { hdata }) => Some(hdata),
                    _ => None,
                }
            })
            .await?;

        let keys = handshake.complete(&HandshakeReply::from_bytes(&hdata));
        self.finish_hop(Some(self.shared.guard.clone()), keys, "CREATE2")
    }

    /// Extend to `router`, using ntor-v3 when it advertises an Ed25519 identity
    pub async fn extend2(&self, router: &RouterDescriptor) -> Result<()> {
        self.extend2_with(router, ClientHandshake::for_router(router))
            .await
    }

    pub async fn extend2_with(
        &self,
        router: &RouterDescriptor,
        handshake: ClientHandshake,
    ) -> Result<()> {
        self.expect_status(CircuitStatus::Connected)?;
        log::info!(
            "    📡 Extending circuit {:#x} to {} ({:?})",
            self.id(),
            router.nickname,
            handshake.handshake_type()
        );

        let extend = RelayMessage::Extend2(Extend2Message {
            link_specifiers: router.link_specifiers(),
            handshake_type: handshake.handshake_type() as u16,
            handshake_data: handshake.onionskin(),
        });
        self.send_relay(0, &extend)?;

        match self
            .wait_for_relay(0, &[RelayCommand::Extended2, RelayCommand::Truncated])
            .await?
        {
            RelayMessage::Extended2(reply) => {
                let keys = handshake.complete(&reply);
                self.finish_hop(Some(router.clone()), keys, "EXTEND2")
            }
            other => {
                let err = TorError::CircuitBuildFailed(format!(
                    "Extension to {} refused: {:?}",
                    router.nickname, other
                ));
                self.tear_down(Some(err.clone()));
                Err(err)
            }
        }
    }

    /// Extend to a hidden service's introduction point
    pub async fn extend_to_introduction_point(&self, intro: &IntroductionPoint) -> Result<()> {
        let router = intro.router()?;
        self.extend2(&router).await
    }

    /// Drop the last `level + 1` hops
    ///
    /// TRUNCATE goes to the hop that becomes the new last hop; success means
    /// it answered TRUNCATED with reason REQUESTED.
    pub async fn truncate(&self, level: usize) -> Result<()> {
        {
            let mut state = self.state();
            let hops = state.hops.len();
            if level + 2 > hops {
                return Err(TorError::InvalidState(format!(
                    "Cannot truncate {} hops of a {}-hop circuit",
                    level + 1,
                    hops
                )));
            }
            let target = hops - 2 - level;
            self.send_relay_locked(&mut state, 0, &RelayMessage::Truncate, target)?;
            state.hops.truncate(target + 1);
        }
        log::info!("    ✂️ Truncated circuit {:#x} by {} hops", self.id(), level + 1);

        match self.wait_for_relay(0, &[RelayCommand::Truncated]).await? {
            RelayMessage::Truncated { reason } if reason == DestroyReason::Requested as u8 => Ok(()),
            RelayMessage::Truncated { reason } => Err(TorError::circuit_destroyed(reason)),
            other => Err(TorError::UnexpectedCell {
                expected: "TRUNCATED".into(),
                got: format!("{:?}", other.command()),
            }),
        }
    }

    /// Send DESTROY and drop the circuit from the guard's table
    pub fn destroy(&self) {
        self.tear_down(None);
    }

    /// A malformed cell arrived for this circuit
    pub(crate) fn fail(&self, err: TorError) {
        log::warn!("⚠️ Circuit {:#x} protocol violation: {}", self.id(), err);
        self.tear_down(Some(err));
    }

    fn tear_down(&self, failure: Option<TorError>) {
        {
            let mut state = self.state();
            if !state.is_open() {
                return;
            }
            state.status = CircuitStatus::Destroyed(DestroyReason::None as u8);
            state.failure = failure;
            state.streams.clear();
        }
        self.remove_from_table();
        self.shared.notify.notify_waiters();

        // Clients always send NONE as the DESTROY reason
        if self
            .send_cell(destroy_cell(self.id(), DestroyReason::None))
            .is_err()
        {
            log::debug!("Guard link gone while destroying circuit {:#x}", self.id());
        }
        log::info!("🗑️ Circuit {:#x} destroyed", self.id());
    }

    /// The guard sent DESTROY
    pub(crate) fn destroyed(&self, reason: u8) {
        {
            let mut state = self.state();
            state.status = CircuitStatus::Destroyed(reason);
            state.streams.clear();
        }
        log::warn!(
            "⚠️ Circuit {:#x} destroyed by relay: {}",
            self.id(),
            TorError::circuit_destroyed(reason)
        );
        self.remove_from_table();
        self.shared.notify.notify_waiters();
    }

    /// The guard connection is gone
    pub(crate) fn disconnected(&self) {
        {
            let mut state = self.state();
            if state.is_open() {
                state.status = CircuitStatus::Disconnected;
            }
            state.streams.clear();
        }
        self.shared.notify.notify_waiters();
    }

    fn remove_from_table(&self) {
        if let Some(table) = self.shared.link.table.upgrade() {
            table
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&self.id());
        }
    }

    // ===== Hidden services =====

    /// ESTABLISH_RENDEZVOUS with `cookie`, waiting for RENDEZVOUS_ESTABLISHED
    pub async fn establish_rendezvous(&self, cookie: [u8; 20]) -> Result<()> {
        self.send_relay(0, &RelayMessage::EstablishRendezvous { cookie })?;
        self.wait_for_relay(0, &[RelayCommand::RendezvousEstablished])
            .await?;
        log::info!("    🤝 Rendezvous point ready on circuit {:#x}", self.id());
        Ok(())
    }

    /// Send an INTRODUCE1 payload and return the INTRODUCE_ACK status
    pub async fn introduce1(&self, payload: Vec<u8>) -> Result<IntroduceAckStatus> {
        self.send_relay(0, &RelayMessage::Introduce1(payload))?;
        match self
            .wait_for_relay(0, &[RelayCommand::IntroduceAck])
            .await?
        {
            RelayMessage::IntroduceAck { status } => Ok(status),
            other => Err(TorError::UnexpectedCell {
                expected: "INTRODUCE_ACK".into(),
                got: format!("{:?}", other.command()),
            }),
        }
    }

    /// Wait for RENDEZVOUS2 and append the service as a virtual hop
    pub async fn rendezvous(&self, client: &HsNtorClient) -> Result<()> {
        match self.wait_for_relay(0, &[RelayCommand::Rendezvous2]).await? {
            RelayMessage::Rendezvous2(reply) => {
                self.finish_hop(None, client.complete(&reply), "RENDEZVOUS2")
            }
            other => Err(TorError::UnexpectedCell {
                expected: "RENDEZVOUS2".into(),
                got: format!("{:?}", other.command()),
            }),
        }
    }

    // ===== Streams =====

    /// BEGIN to `host:port` at the last hop
    pub async fn open_stream(&self, stream_id: u16, host: &str, port: u16) -> Result<TorStream> {
        let target = format!("{}:{}", host, port);
        self.begin(stream_id, RelayMessage::Begin { target }).await
    }

    /// BEGIN to a port of the hidden service at the end of this circuit
    pub async fn open_hs_stream(&self, stream_id: u16, port: u16) -> Result<TorStream> {
        self.open_stream(stream_id, "", port).await
    }

    /// BEGIN_DIR to the last hop's directory port
    pub async fn open_dir_stream(&self, stream_id: u16) -> Result<TorStream> {
        self.begin(stream_id, RelayMessage::BeginDir).await
    }

    async fn begin(&self, stream_id: u16, message: RelayMessage) -> Result<TorStream> {
        if stream_id == 0 {
            return Err(TorError::Stream("Stream id 0 is reserved".into()));
        }
        {
            let mut state = self.state();
            if state.status != CircuitStatus::Connected {
                return Err(state.closed_error().unwrap_or_else(|| {
                    TorError::InvalidState("Circuit has no hops".into())
                }));
            }
            if state.streams.contains_key(&stream_id) {
                return Err(TorError::Stream(format!("Stream {} already open", stream_id)));
            }
            state
                .streams
                .insert(stream_id, StreamFlowControl::new(stream_id));
            let level = state.hops.len() - 1;
            self.send_relay_locked(&mut state, stream_id, &message, level)?;
        }

        match self
            .wait_for_relay(stream_id, &[RelayCommand::Connected, RelayCommand::End])
            .await?
        {
            RelayMessage::Connected(address) => {
                log::info!("    ✅ Stream {} open on circuit {:#x}", stream_id, self.id());
                Ok(TorStream::new(self.clone(), stream_id, address))
            }
            RelayMessage::End { reason } => Err(TorError::stream_ended(stream_id, reason)),
            other => Err(TorError::UnexpectedCell {
                expected: "CONNECTED or END".into(),
                got: format!("{:?}", other.command()),
            }),
        }
    }

    /// Fragment `data` into DATA cells, waiting on the package windows
    pub async fn send_data(&self, stream_id: u16, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(RelayCell::MAX_DATA_SIZE) {
            self.wait_for("package window", |state| state.can_package(stream_id))
                .await??;

            let mut state = self.state();
            let level = state.hops.len() - 1;
            if let Some(stream) = state.streams.get_mut(&stream_id) {
                stream.package.on_package()?;
            }
            let message = RelayMessage::Data(chunk.to_vec());
            self.send_relay_locked(&mut state, stream_id, &message, level)?;
        }
        Ok(())
    }

    /// Next DATA payload on `stream_id`; `None` once the stream has ended
    pub async fn receive_data(&self, stream_id: u16) -> Result<Option<Vec<u8>>> {
        self.wait_for("DATA", |state| {
            match state.take_relay(stream_id, &[RelayCommand::Data, RelayCommand::End]) {
                Some(RelayMessage::Data(data)) => Some(Some(data)),
                Some(_) => Some(None),
                None if state.is_open() && !state.streams.contains_key(&stream_id) => Some(None),
                None => None,
            }
        })
        .await
    }

    /// Send END (DONE) and forget the stream
    pub fn close_stream(&self, stream_id: u16) -> Result<()> {
        let mut state = self.state();
        if state.streams.remove(&stream_id).is_none() || !state.is_open() {
            return Ok(());
        }
        let level = state.hops.len() - 1;
        let end = RelayMessage::End {
            reason: EndReason::Done as u8,
        };
        self.send_relay_locked(&mut state, stream_id, &end, level)
    }

    /// Receive windows of an open stream as `(deliver, package)`
    pub fn stream_windows(&self, stream_id: u16) -> Option<(u32, u32)> {
        self.state()
            .streams
            .get(&stream_id)
            .map(|s| (s.deliver.value(), s.package.value()))
    }
}
