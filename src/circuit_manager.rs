//! Circuit management
//!
//! [`CircuitManager`] owns the guard links, the guard/vanguard selector and
//! every circuit it has built. Circuits are addressed by id; streams are
//! opened on a circuit by id and handed back as [`TorStream`]s.
//!
//! Default circuits are `guard → second-layer vanguard → exit`. With a
//! `last_node` the exit is replaced by that node, or (when `reserve` is set)
//! a fourth hop to it is added after a randomly chosen third hop.

use crate::config::ClientConfig;
use crate::error::{Result, TorError};
use crate::guards::GuardConnector;
use crate::hs::{self, OnionAddress};
use crate::protocol::channel::{Channel, Transport};
use crate::protocol::circuit::{client_circuit_id, Circuit, CircuitStatus};
use crate::protocol::handshake::HsNtorClient;
use crate::protocol::relay::{IntroductionPoint, RelaySelector, RouterDescriptor};
use crate::protocol::relay_cell::IntroduceAckStatus;
use crate::protocol::stream::TorStream;
use crate::storage::StateStore;
use crate::vanguards::VanguardsLite;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Circuit ids drawn before giving up on finding a free one
const MAX_CIRCUIT_ID_DRAWS: usize = 64;

/// A rendezvous circuit waiting for the service
#[derive(Debug, Clone)]
pub struct RendezvousInfo {
    pub circuit_id: u32,
    pub rendezvous_point: RouterDescriptor,
    pub cookie: [u8; 20],
}

/// Builds circuits and opens streams over them
pub struct CircuitManager {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    selector: VanguardsLite,
    /// Guard links by RSA fingerprint
    channels: Mutex<HashMap<[u8; 20], Arc<Channel>>>,
    circuits: Mutex<HashMap<u32, Circuit>>,
    rng: Mutex<StdRng>,
}

/// Opens (or reuses) guard links for guard selection
struct ChannelConnector<'a> {
    manager: &'a CircuitManager,
}

#[async_trait]
impl<'a> GuardConnector for ChannelConnector<'a> {
    type Connection = Arc<Channel>;

    async fn connect(&self, guard: &RouterDescriptor) -> Result<Arc<Channel>> {
        self.manager.channel_for(guard).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CircuitManager {
    /// Fresh guard and vanguard selection over `relays`
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        relays: RelaySelector,
        mut rng: StdRng,
    ) -> Result<Self> {
        config.validate()?;
        let selector_rng = StdRng::from_rng(&mut rng).map_err(|e| TorError::Internal(e.to_string()))?;
        let selector = VanguardsLite::new(relays, &config, selector_rng);
        Ok(Self::with_selector(config, transport, selector, rng))
    }

    /// Restore guard and vanguard state from `store`, or start fresh if it is empty
    pub async fn bootstrap(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        relays: RelaySelector,
        store: &dyn StateStore,
        mut rng: StdRng,
    ) -> Result<Self> {
        config.validate()?;
        let selector_rng = StdRng::from_rng(&mut rng).map_err(|e| TorError::Internal(e.to_string()))?;
        let selector = match store.load().await? {
            Some(state) => VanguardsLite::restore(&state, relays, &config, selector_rng),
            None => {
                log::info!("📂 No saved guard state, sampling fresh guards");
                VanguardsLite::new(relays, &config, selector_rng)
            }
        };
        Ok(Self::with_selector(config, transport, selector, rng))
    }

    fn with_selector(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        selector: VanguardsLite,
        rng: StdRng,
    ) -> Self {
        Self {
            config,
            transport,
            selector,
            channels: Mutex::new(HashMap::new()),
            circuits: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
        }
    }

    /// Write the current guard and vanguard state to `store`
    pub async fn save_state(&self, store: &dyn StateStore) -> Result<()> {
        store.save(&self.selector.state()).await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn selector(&self) -> &VanguardsLite {
        &self.selector
    }

    /// Circuit by id, if the manager still holds it
    pub fn circuit(&self, circuit_id: u32) -> Option<Circuit> {
        lock(&self.circuits).get(&circuit_id).cloned()
    }

    pub fn circuit_count(&self) -> usize {
        lock(&self.circuits).len()
    }

    /// Number of live guard links
    pub fn channel_count(&self) -> usize {
        let mut channels = lock(&self.channels);
        channels.retain(|_, c| c.is_connected());
        channels.len()
    }

    /// Live link to `guard`; links that went away are evicted first
    fn live_channel(&self, guard: &RouterDescriptor) -> Option<Arc<Channel>> {
        let mut channels = lock(&self.channels);
        channels.retain(|_, c| c.is_connected());
        channels.get(&guard.fingerprint).cloned()
    }

    /// A connected link to `guard`, opening one if needed
    ///
    /// When a concurrent build opened a link to the same guard first, that
    /// link wins and ours is closed.
    async fn channel_for(&self, guard: &RouterDescriptor) -> Result<Arc<Channel>> {
        if let Some(channel) = self.live_channel(guard) {
            return Ok(channel);
        }

        let channel = Arc::new(Channel::connect(&*self.transport, guard, &self.config).await?);
        let mut channels = lock(&self.channels);
        channels.retain(|_, c| c.is_connected());
        if let Some(existing) = channels.get(&guard.fingerprint) {
            log::debug!("Reusing concurrent link to {}", guard.nickname);
            return Ok(existing.clone());
        }
        channels.insert(guard.fingerprint, channel.clone());
        Ok(channel)
    }

    /// Register a circuit with an id unused on both the link and this manager
    ///
    /// Closed circuits still holding an id are forgotten first.
    fn register_circuit(&self, channel: &Channel) -> Result<Circuit> {
        let mut circuits = lock(&self.circuits);
        circuits.retain(|_, c| {
            matches!(c.status(), CircuitStatus::NotSet | CircuitStatus::Connected)
        });

        for _ in 0..MAX_CIRCUIT_ID_DRAWS {
            let raw: u32 = lock(&self.rng).gen();
            if circuits.contains_key(&client_circuit_id(raw)) {
                continue;
            }
            match channel.new_circuit(raw) {
                Ok(circuit) => {
                    circuits.insert(circuit.id(), circuit.clone());
                    return Ok(circuit);
                }
                Err(TorError::InvalidState(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(TorError::Internal("no free circuit id".into()))
    }

    fn forget(&self, circuit: &Circuit) {
        lock(&self.circuits).remove(&circuit.id());
    }

    /// Third hop: an exit accepting `port`, or any relay when there is no port
    fn pick_exit(
        &self,
        port: Option<u16>,
        exclude: &[&RouterDescriptor],
    ) -> Result<RouterDescriptor> {
        let relays = self.selector.relays();
        let mut rng = lock(&self.rng);
        let picked = match port {
            Some(port) => relays.select_exit(&mut *rng, port, exclude),
            None => relays.select_any(&mut *rng, exclude),
        };
        picked.cloned().ok_or_else(|| match port {
            Some(port) => TorError::NoRelaysAvailable(format!("no exit accepts port {}", port)),
            None => TorError::NoRelaysAvailable("no relay for the third hop".into()),
        })
    }

    async fn extend_path(
        &self,
        circuit: &Circuit,
        guard: &RouterDescriptor,
        port: Option<u16>,
        last_node: Option<&RouterDescriptor>,
        reserve: bool,
    ) -> Result<()> {
        circuit.create2().await?;

        let mut used: Vec<&RouterDescriptor> = vec![guard];
        used.extend(last_node);
        let vanguard = self.selector.get_second_layer_vanguard(&used)?;
        circuit.extend2(&vanguard).await?;

        let third = match last_node {
            Some(node) if !reserve => node.clone(),
            _ => {
                used.push(&vanguard);
                self.pick_exit(port, &used)?
            }
        };
        circuit.extend2(&third).await?;

        if reserve {
            if let Some(node) = last_node {
                circuit.extend2(node).await?;
            }
        }
        Ok(())
    }

    /// Build a circuit and return its id
    ///
    /// `port` picks an exit whose policy accepts it (`None`: any relay).
    /// `last_node` replaces the exit; with `reserve` it is appended as a
    /// fourth hop instead. Up to `circuit_build_attempts` attempts are made;
    /// running out of vanguards ends the attempts immediately.
    pub async fn create_default_circuit(
        &self,
        port: Option<u16>,
        last_node: Option<&RouterDescriptor>,
        reserve: bool,
    ) -> Result<u32> {
        let connector = ChannelConnector { manager: self };
        let avoid: Vec<&RouterDescriptor> = last_node.into_iter().collect();
        let mut last_error = TorError::CircuitBuildFailed("no attempts made".into());

        for attempt in 1..=self.config.circuit_build_attempts {
            log::info!(
                "🔨 Building circuit (attempt {}/{})",
                attempt,
                self.config.circuit_build_attempts
            );
            let (guard, channel) = match self.selector.get_entry_guard(&connector, &avoid).await {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("⚠️ No entry guard: {}", e);
                    last_error = e;
                    continue;
                }
            };
            let circuit = self.register_circuit(&channel)?;

            let built = tokio::time::timeout(
                self.config.circuit_build_timeout,
                self.extend_path(&circuit, &guard, port, last_node, reserve),
            )
            .await
            .unwrap_or_else(|_| Err(TorError::Timeout("circuit build".into())));

            match built {
                Ok(()) => {
                    log::info!(
                        "✅ Circuit {:#x} built: {}",
                        circuit.id(),
                        circuit
                            .path()
                            .iter()
                            .map(|r| r.nickname.as_str())
                            .collect::<Vec<_>>()
                            .join(" → ")
                    );
                    return Ok(circuit.id());
                }
                Err(e) => {
                    circuit.destroy();
                    self.forget(&circuit);
                    if let TorError::NoRelaysAvailable(_) = e {
                        return Err(e);
                    }
                    log::warn!("⚠️ Circuit attempt {} failed: {}", attempt, e);
                    last_error = e;
                }
            }
        }

        Err(TorError::CircuitBuildFailed(format!(
            "gave up after {} attempts: {}",
            self.config.circuit_build_attempts, last_error
        )))
    }

    fn get_circuit(&self, circuit_id: u32) -> Result<Circuit> {
        self.circuit(circuit_id)
            .ok_or_else(|| TorError::InvalidState(format!("no circuit {:#x}", circuit_id)))
    }

    fn unused_stream_id(&self, circuit: &Circuit) -> u16 {
        let mut rng = lock(&self.rng);
        loop {
            let id: u16 = rng.gen();
            if id != 0 && circuit.stream_windows(id).is_none() {
                return id;
            }
        }
    }

    /// Open a stream to `host:port` through the exit of `circuit_id`
    pub async fn connect(&self, circuit_id: u32, host: &str, port: u16) -> Result<TorStream> {
        let circuit = self.get_circuit(circuit_id)?;
        let stream_id = self.unused_stream_id(&circuit);
        circuit.open_stream(stream_id, host, port).await
    }

    /// Open a stream to `port` of the hidden service joined on `circuit_id`
    pub async fn connect_hidden_service(&self, circuit_id: u32, port: u16) -> Result<TorStream> {
        let circuit = self.get_circuit(circuit_id)?;
        let stream_id = self.unused_stream_id(&circuit);
        circuit.open_hs_stream(stream_id, port).await
    }

    /// Build a circuit to a random rendezvous point and establish it there
    pub async fn establish_rendezvous(&self) -> Result<RendezvousInfo> {
        let rendezvous_point = {
            let mut rng = lock(&self.rng);
            self.selector
                .relays()
                .select_any(&mut *rng, &[])
                .cloned()
                .ok_or_else(|| TorError::NoRelaysAvailable("no rendezvous point".into()))?
        };
        let circuit_id = self
            .create_default_circuit(None, Some(&rendezvous_point), false)
            .await?;
        let circuit = self.get_circuit(circuit_id)?;

        let cookie = hs::rendezvous_cookie();
        if let Err(e) = circuit.establish_rendezvous(cookie).await {
            self.tear_circuit(circuit_id);
            return Err(e);
        }
        Ok(RendezvousInfo {
            circuit_id,
            rendezvous_point,
            cookie,
        })
    }

    /// hs-ntor client state for introducing to `intro` of `address`
    pub fn hs_client(address: &OnionAddress, intro: &IntroductionPoint) -> Result<HsNtorClient> {
        let subcredential = address.subcredential(hs::current_time_period())?;
        Ok(HsNtorClient::new(
            intro.auth_key,
            intro.encryption_key,
            subcredential,
        ))
    }

    /// Send INTRODUCE1 through `intro`, naming the rendezvous in `rendezvous`
    ///
    /// The introduction circuit reaches `intro` as a fourth hop and is
    /// destroyed once INTRODUCE_ACK arrives.
    pub async fn introduce(
        &self,
        client: &HsNtorClient,
        intro: &IntroductionPoint,
        rendezvous: &RendezvousInfo,
    ) -> Result<IntroduceAckStatus> {
        let intro_router = intro.router()?;
        let payload = hs::build_introduce1(
            intro,
            &rendezvous.rendezvous_point,
            &rendezvous.cookie,
            client,
        )?;
        let circuit_id = self
            .create_default_circuit(None, Some(&intro_router), true)
            .await?;
        let circuit = self.get_circuit(circuit_id)?;

        let status = circuit.introduce1(payload).await;
        self.tear_circuit(circuit_id);
        let status = status?;
        log::info!("📨 INTRODUCE_ACK from {}: {:?}", intro_router.nickname, status);
        Ok(status)
    }

    /// Wait for the service on the rendezvous circuit and join it
    pub async fn finish_rendezvous(&self, circuit_id: u32, client: &HsNtorClient) -> Result<()> {
        let circuit = self.get_circuit(circuit_id)?;
        if let Err(e) = circuit.rendezvous(client).await {
            self.tear_circuit(circuit_id);
            return Err(e);
        }
        log::info!("🧅 Rendezvous complete on circuit {:#x}", circuit_id);
        Ok(())
    }

    /// Reach `port` on the service at `address`, trying `intros` in order
    pub async fn open_onion_stream(
        &self,
        address: &OnionAddress,
        intros: &[IntroductionPoint],
        port: u16,
    ) -> Result<TorStream> {
        if intros.is_empty() {
            return Err(TorError::NoRelaysAvailable(format!(
                "{} has no introduction points",
                address
            )));
        }
        let rendezvous = self.establish_rendezvous().await?;

        let mut last_error = TorError::CircuitBuildFailed("no introduction attempted".into());
        for intro in intros {
            let client = Self::hs_client(address, intro)?;
            match self.introduce(&client, intro, &rendezvous).await {
                Ok(IntroduceAckStatus::Success) => {
                    self.finish_rendezvous(rendezvous.circuit_id, &client).await?;
                    return self
                        .connect_hidden_service(rendezvous.circuit_id, port)
                        .await;
                }
                Ok(status) => {
                    log::warn!("⚠️ Introduction refused: {:?}", status);
                    last_error =
                        TorError::CircuitBuildFailed(format!("introduction refused: {:?}", status));
                }
                Err(e) => {
                    log::warn!("⚠️ Introduction failed: {}", e);
                    last_error = e;
                }
            }
        }
        self.tear_circuit(rendezvous.circuit_id);
        Err(last_error)
    }

    /// Destroy a circuit; unknown ids are ignored
    pub fn tear_circuit(&self, circuit_id: u32) {
        let circuit = lock(&self.circuits).remove(&circuit_id);
        if let Some(circuit) = circuit {
            circuit.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guards::tests::guard_router;
    use crate::protocol::channel::TransportStream;
    use crate::protocol::relay::tests::test_router;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Refuses every connection, counting attempts
    #[derive(Default)]
    struct RefusingTransport {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Transport for RefusingTransport {
        async fn connect(&self, router: &RouterDescriptor) -> Result<TransportStream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TorError::ConnectionFailed(format!(
                "{} refused",
                router.nickname
            )))
        }
    }

    fn relays() -> RelaySelector {
        let mut relays: Vec<RouterDescriptor> = (1..=3).map(guard_router).collect();
        relays.extend((10..=15).map(test_router));
        RelaySelector::new(relays)
    }

    fn config() -> ClientConfig {
        ClientConfig {
            guard_sample_size: 3,
            circuit_build_attempts: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_build_gives_up_when_no_guard_reachable() {
        let transport = Arc::new(RefusingTransport::default());
        let manager = CircuitManager::new(
            config(),
            transport.clone(),
            relays(),
            StdRng::seed_from_u64(1),
        )
        .unwrap();

        let err = manager
            .create_default_circuit(Some(443), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TorError::CircuitBuildFailed(_)));
        // every sampled guard tried once per attempt
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 6);
        assert_eq!(manager.circuit_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_circuit() {
        let manager = CircuitManager::new(
            config(),
            Arc::new(RefusingTransport::default()),
            relays(),
            StdRng::seed_from_u64(2),
        )
        .unwrap();
        assert!(matches!(
            manager.connect(0x8000_0001, "example.com", 80).await,
            Err(TorError::InvalidState(_))
        ));
        manager.tear_circuit(0x8000_0001);
    }

    #[tokio::test]
    async fn test_bootstrap_restores_saved_state() {
        let store = MemoryStore::new();
        let first = CircuitManager::bootstrap(
            config(),
            Arc::new(RefusingTransport::default()),
            relays(),
            &store,
            StdRng::seed_from_u64(3),
        )
        .await
        .unwrap();
        first.save_state(&store).await.unwrap();

        let second = CircuitManager::bootstrap(
            config(),
            Arc::new(RefusingTransport::default()),
            relays(),
            &store,
            StdRng::seed_from_u64(99),
        )
        .await
        .unwrap();
        assert_eq!(second.selector().state(), first.selector().state());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClientConfig {
            link_versions: Vec::new(),
            ..Default::default()
        };
        assert!(CircuitManager::new(
            config,
            Arc::new(RefusingTransport::default()),
            relays(),
            StdRng::seed_from_u64(4),
        )
        .is_err());
    }
}
