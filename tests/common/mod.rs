//! In-process relay network for integration tests
//!
//! Every relay speaks the link handshake, answers CREATE2/EXTEND2 with the
//! server half of ntor, and keeps the relay-side onion state of each hop.
//! Exits understand a few magic hostnames:
//!
//! - `echo.test`: CONNECTED, then every DATA cell is echoed back
//! - `stream.test`: CONNECTED, 100 full DATA cells, END (DONE)
//! - `refused.test`: END (EXITPOLICY)

#![allow(dead_code)]

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use onion_client::protocol::cell::{
    destroy_cell, read_cell, write_cell, AuthChallengeCell, NetAddress, NetInfoCell, VersionsCell,
};
use onion_client::protocol::certs::{Certificate, CertsCell};
use onion_client::protocol::crypto::{
    hkdf_expand, hmac_sha256, KeyMaterial, RelayCipher, RunningDigest,
};
use onion_client::protocol::relay_cell::{ConnectedAddress, SendmeMessage};
use onion_client::protocol::{
    Cell, CellCommand, DestroyReason, ExitPolicy, HandshakeReply, LinkSpecifier, RelayCell,
    RelayFlags, RelayMessage, RouterDescriptor, Transport, TransportStream,
};
use onion_client::{ClientConfig, Result, TorError};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use x25519_dalek::{PublicKey, StaticSecret};

pub const TLS_CERT: &[u8] = b"mock relay tls certificate";

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Full DATA cells sent by `stream.test`
pub const STREAM_TEST_CELLS: usize = 100;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Client config with short waits
pub fn test_config() -> ClientConfig {
    ClientConfig {
        cell_timeout: Duration::from_secs(5),
        circuit_build_timeout: Duration::from_secs(10),
        guard_sample_size: 3,
        ..Default::default()
    }
}

/// What the mock network observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Link { relay: String },
    Created { circuit: u32, relay: String },
    Extended { circuit: u32, relay: String },
    Begin { circuit: u32, stream: u16, target: String },
    Data { circuit: u32, stream: u16, len: usize },
    /// `acked`: 1-based index of the DATA cell whose digest a v1 SENDME carries
    Sendme { circuit: u32, stream: u16, version: u8, acked: Option<usize> },
    End { circuit: u32, stream: u16 },
    Truncated { circuit: u32, hops: usize },
    Destroy { circuit: u32 },
}

/// Misbehaviour to inject
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Transport connections to these fingerprints fail
    pub refuse_connect: Vec<[u8; 20]>,
    /// ntor replies from these fingerprints carry a corrupted AUTH
    pub bad_auth: Vec<[u8; 20]>,
    /// Flip a ciphertext byte in every DATA cell sent to the client
    pub tamper_data: bool,
}

pub struct MockRelay {
    pub descriptor: RouterDescriptor,
    onion_secret: StaticSecret,
}

impl MockRelay {
    fn new(n: u8, role: &str, flags: &str, exit_policy: Option<&str>) -> Self {
        let onion_secret = StaticSecret::from([n; 32]);
        let descriptor = RouterDescriptor {
            nickname: format!("{}{}", role, n),
            fingerprint: [n; 20],
            ed25519_id: None,
            ntor_onion_key: *PublicKey::from(&onion_secret).as_bytes(),
            address: Ipv4Addr::new(10, 0, 0, n),
            or_port: 9001,
            ipv6: None,
            family: Vec::new(),
            exit_policy: exit_policy.map(|p| ExitPolicy::parse(p).unwrap()),
            flags: RelayFlags::from_string(flags),
            microdesc_digest: None,
        };
        Self {
            descriptor,
            onion_secret,
        }
    }
}

/// Relay-side state of one hop
struct MockHop {
    forward_digest: RunningDigest,
    backward_digest: RunningDigest,
    forward_cipher: RelayCipher,
    backward_cipher: RelayCipher,
}

impl MockHop {
    fn new(keys: &KeyMaterial) -> Self {
        Self {
            forward_digest: RunningDigest::sha1(&keys.forward_digest),
            backward_digest: RunningDigest::sha1(&keys.backward_digest),
            forward_cipher: RelayCipher::new(&keys.forward_key).unwrap(),
            backward_cipher: RelayCipher::new(&keys.backward_key).unwrap(),
        }
    }
}

#[derive(Default)]
struct MockCircuit {
    hops: Vec<MockHop>,
    /// First 20 bytes of the backward digest of each DATA cell sent
    data_digests: Vec<Vec<u8>>,
}

impl MockCircuit {
    /// Strip forward layers until one hop recognizes the cell
    fn recognize(&mut self, body: &mut [u8]) -> Option<(usize, RelayCell)> {
        for (level, hop) in self.hops.iter_mut().enumerate() {
            hop.forward_cipher.apply(body);
            if body[1..3] != [0, 0] {
                continue;
            }
            let mut zeroed = body.to_vec();
            zeroed[RelayCell::DIGEST_RANGE].fill(0);
            let mut digest = hop.forward_digest.clone();
            digest.update(&zeroed);
            if digest.current()[..4] == body[RelayCell::DIGEST_RANGE] {
                hop.forward_digest = digest;
                return RelayCell::from_bytes(&zeroed).ok().map(|cell| (level, cell));
            }
        }
        None
    }

    /// Encrypt a message as coming from the last hop
    fn package(&mut self, stream_id: u16, message: &RelayMessage, tamper: bool) -> Vec<u8> {
        let mut body = RelayCell::from_message(stream_id, message).to_bytes();
        let last = self.hops.len() - 1;
        self.hops[last].backward_digest.update(&body);
        let digest = self.hops[last].backward_digest.current();
        body[RelayCell::DIGEST_RANGE].copy_from_slice(&digest[..4]);
        if let RelayMessage::Data(_) = message {
            self.data_digests.push(digest[..20].to_vec());
        }
        for hop in self.hops.iter_mut().rev() {
            hop.backward_cipher.apply(&mut body);
        }
        if tamper {
            body[200] ^= 0x01;
        }
        body
    }
}

pub struct MockNetwork {
    pub relays: Vec<MockRelay>,
    faults: Faults,
    events: Mutex<Vec<Event>>,
}

impl MockNetwork {
    /// `guards` guards (1..), `middles` middles (50..) and one exit per
    /// policy (100..)
    pub fn new(guards: u8, middles: u8, exit_policies: &[&str], faults: Faults) -> Arc<Self> {
        let mut relays = Vec::new();
        for n in 1..=guards {
            relays.push(MockRelay::new(
                n,
                "guard",
                "Fast Guard Running Stable Valid V2Dir",
                None,
            ));
        }
        for n in 0..middles {
            relays.push(MockRelay::new(50 + n, "middle", "Fast Running Stable Valid", None));
        }
        for (n, policy) in exit_policies.iter().enumerate() {
            relays.push(MockRelay::new(
                100 + n as u8,
                "exit",
                "Exit Fast Running Stable Valid",
                Some(policy),
            ));
        }
        Arc::new(Self {
            relays,
            faults,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn standard(faults: Faults) -> Arc<Self> {
        Self::new(3, 3, &["accept 1-65535", "accept 1-65535"], faults)
    }

    pub fn descriptors(&self) -> Vec<RouterDescriptor> {
        self.relays.iter().map(|r| r.descriptor.clone()).collect()
    }

    pub fn relay(&self, nickname: &str) -> &MockRelay {
        self.relays
            .iter()
            .find(|r| r.descriptor.nickname == nickname)
            .unwrap()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn index_of(&self, fingerprint: &[u8; 20]) -> Option<usize> {
        self.relays
            .iter()
            .position(|r| &r.descriptor.fingerprint == fingerprint)
    }

    /// Server half of ntor for relay `index`: `(CREATED2 hdata, keys)`
    fn ntor(&self, index: usize, onionskin: &[u8]) -> Option<(HandshakeReply, KeyMaterial)> {
        if onionskin.len() < 84 {
            return None;
        }
        let relay = &self.relays[index];
        let relay_id = relay.descriptor.fingerprint;
        let b_pub = PublicKey::from(&relay.onion_secret);
        let mut x = [0u8; 32];
        x.copy_from_slice(&onionskin[52..84]);
        let client_public = PublicKey::from(x);

        let y = StaticSecret::random_from_rng(OsRng);
        let y_pub = PublicKey::from(&y);

        let mut secret_input = Vec::new();
        secret_input.extend_from_slice(y.diffie_hellman(&client_public).as_bytes());
        secret_input.extend_from_slice(relay.onion_secret.diffie_hellman(&client_public).as_bytes());
        secret_input.extend_from_slice(&relay_id);
        secret_input.extend_from_slice(b_pub.as_bytes());
        secret_input.extend_from_slice(client_public.as_bytes());
        secret_input.extend_from_slice(y_pub.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let key_seed = hmac_sha256(T_KEY, &secret_input);
        let verify = hmac_sha256(T_VERIFY, &secret_input);
        let mut auth_input = verify.to_vec();
        auth_input.extend_from_slice(&relay_id);
        auth_input.extend_from_slice(b_pub.as_bytes());
        auth_input.extend_from_slice(y_pub.as_bytes());
        auth_input.extend_from_slice(client_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let mut auth = hmac_sha256(T_MAC, &auth_input);
        if self.faults.bad_auth.contains(&relay_id) {
            auth[0] ^= 0xff;
        }
        let okm = hkdf_expand(&key_seed, M_EXPAND, 92).ok()?;
        let reply = HandshakeReply {
            public_key: *y_pub.as_bytes(),
            auth,
            encrypted_message: Vec::new(),
        };
        Some((reply, KeyMaterial::standard(&okm, None)))
    }

    fn handle(&self, guard: usize, circuits: &mut HashMap<u32, MockCircuit>, cell: Cell) -> Vec<Cell> {
        let id = cell.circuit_id;
        match cell.command {
            CellCommand::Create2 => {
                let body = &cell.payload;
                let hlen = u16::from_be_bytes([body[2], body[3]]) as usize;
                let hdata = &body[4..4 + hlen];
                match self.ntor(guard, hdata) {
                    Some((reply, keys)) => {
                        let mut circuit = MockCircuit::default();
                        circuit.hops.push(MockHop::new(&keys));
                        circuits.insert(id, circuit);
                        self.record(Event::Created {
                            circuit: id,
                            relay: self.relays[guard].descriptor.nickname.clone(),
                        });
                        let hdata = reply.to_bytes();
                        let mut payload = (hdata.len() as u16).to_be_bytes().to_vec();
                        payload.extend_from_slice(&hdata);
                        vec![Cell::new(id, CellCommand::Created2, payload)]
                    }
                    None => vec![destroy_cell(id, DestroyReason::Protocol)],
                }
            }
            CellCommand::Relay | CellCommand::RelayEarly => match circuits.get_mut(&id) {
                Some(circuit) => self
                    .handle_relay(id, circuit, cell.payload)
                    .into_iter()
                    .map(|body| Cell::relay(id, body, false))
                    .collect(),
                None => Vec::new(),
            },
            CellCommand::Destroy => {
                circuits.remove(&id);
                self.record(Event::Destroy { circuit: id });
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn handle_relay(&self, id: u32, circuit: &mut MockCircuit, mut body: Vec<u8>) -> Vec<Vec<u8>> {
        let (level, relay) = match circuit.recognize(&mut body) {
            Some(found) => found,
            None => return Vec::new(),
        };
        let stream = relay.stream_id;
        let message = match relay.message() {
            Ok(message) => message,
            Err(_) => return Vec::new(),
        };
        let tamper = self.faults.tamper_data;

        match message {
            RelayMessage::Extend2(extend) => {
                let target = extend.link_specifiers.iter().find_map(|spec| match spec {
                    LinkSpecifier::LegacyId(id) => Some(*id),
                    _ => None,
                });
                let handshake = target
                    .and_then(|fp| self.index_of(&fp))
                    .and_then(|index| Some((index, self.ntor(index, &extend.handshake_data)?)));
                match handshake {
                    Some((index, (reply, keys))) => {
                        let out = circuit.package(0, &RelayMessage::Extended2(reply), false);
                        circuit.hops.push(MockHop::new(&keys));
                        self.record(Event::Extended {
                            circuit: id,
                            relay: self.relays[index].descriptor.nickname.clone(),
                        });
                        vec![out]
                    }
                    None => vec![circuit.package(
                        0,
                        &RelayMessage::Truncated {
                            reason: DestroyReason::ConnectFailed as u8,
                        },
                        false,
                    )],
                }
            }
            RelayMessage::Truncate => {
                circuit.hops.truncate(level + 1);
                self.record(Event::Truncated {
                    circuit: id,
                    hops: circuit.hops.len(),
                });
                vec![circuit.package(
                    0,
                    &RelayMessage::Truncated {
                        reason: DestroyReason::Requested as u8,
                    },
                    false,
                )]
            }
            RelayMessage::Begin { target } => {
                let host = target.split(':').next().unwrap_or_default().to_string();
                self.record(Event::Begin {
                    circuit: id,
                    stream,
                    target,
                });
                let connected = RelayMessage::Connected(ConnectedAddress::Ipv4 {
                    address: Ipv4Addr::new(93, 184, 216, 34),
                    ttl: 300,
                });
                match host.as_str() {
                    "echo.test" | "" => vec![circuit.package(stream, &connected, false)],
                    "stream.test" => {
                        let mut out = vec![circuit.package(stream, &connected, false)];
                        for n in 0..STREAM_TEST_CELLS {
                            let data = RelayMessage::Data(vec![n as u8; RelayCell::MAX_DATA_SIZE]);
                            out.push(circuit.package(stream, &data, tamper));
                        }
                        out.push(circuit.package(stream, &RelayMessage::End { reason: 6 }, false));
                        out
                    }
                    "refused.test" => {
                        vec![circuit.package(stream, &RelayMessage::End { reason: 4 }, false)]
                    }
                    _ => vec![circuit.package(stream, &RelayMessage::End { reason: 2 }, false)],
                }
            }
            RelayMessage::Data(data) => {
                self.record(Event::Data {
                    circuit: id,
                    stream,
                    len: data.len(),
                });
                vec![circuit.package(stream, &RelayMessage::Data(data), tamper)]
            }
            RelayMessage::Sendme(SendmeMessage { version, digest }) => {
                let acked = digest.and_then(|d| {
                    circuit
                        .data_digests
                        .iter()
                        .position(|sent| *sent == d)
                        .map(|i| i + 1)
                });
                self.record(Event::Sendme {
                    circuit: id,
                    stream,
                    version,
                    acked,
                });
                Vec::new()
            }
            RelayMessage::End { .. } => {
                self.record(Event::End { circuit: id, stream });
                Vec::new()
            }
            RelayMessage::EstablishRendezvous { .. } => {
                vec![circuit.package(0, &RelayMessage::RendezvousEstablished, false)]
            }
            RelayMessage::Introduce1(_) => vec![circuit.package(
                0,
                &RelayMessage::IntroduceAck {
                    status: onion_client::protocol::IntroduceAckStatus::Success,
                },
                false,
            )],
            _ => Vec::new(),
        }
    }
}

fn make_cert(cert_type: u8, certified_key: [u8; 32], signer: &SigningKey, with_signer: bool) -> Vec<u8> {
    let mut body = vec![1, cert_type];
    body.extend_from_slice(&u32::MAX.to_be_bytes());
    body.push(1);
    body.extend_from_slice(&certified_key);
    if with_signer {
        // signed-with-ed25519-key extension
        body.push(1);
        body.extend_from_slice(&32u16.to_be_bytes());
        body.push(4);
        body.push(0);
        body.extend_from_slice(signer.verifying_key().as_bytes());
    } else {
        body.push(0);
    }
    let signature = signer.sign(&body);
    body.extend_from_slice(&signature.to_bytes());
    body
}

fn certs_cell() -> CertsCell {
    let identity = SigningKey::from_bytes(&[7u8; 32]);
    let signing = SigningKey::from_bytes(&[9u8; 32]);
    let tls_digest: [u8; 32] = Sha256::digest(TLS_CERT).into();
    CertsCell {
        certificates: vec![
            Certificate {
                cert_type: 4,
                data: make_cert(4, signing.verifying_key().to_bytes(), &identity, true),
            },
            Certificate {
                cert_type: 5,
                data: make_cert(5, tls_digest, &signing, false),
            },
        ],
    }
}

async fn serve_handshake(stream: &mut DuplexStream) -> Result<()> {
    let hello = read_cell(stream, 2).await?;
    if hello.command != CellCommand::Versions {
        return Err(TorError::ProtocolError("expected VERSIONS".into()));
    }
    write_cell(stream, &VersionsCell::new(&[4, 5]).to_cell()).await?;
    write_cell(stream, &Cell::new(0, CellCommand::Certs, certs_cell().encode())).await?;
    let challenge = AuthChallengeCell {
        challenge: [1; 32],
        methods: vec![1, 3],
    };
    write_cell(
        stream,
        &Cell::new(0, CellCommand::AuthChallenge, challenge.encode()),
    )
    .await?;
    let netinfo = NetInfoCell {
        timestamp: 1_700_000_000,
        other_address: NetAddress::ipv4([192, 0, 2, 7]),
        my_addresses: vec![NetAddress::ipv4([10, 0, 0, 1])],
    };
    write_cell(stream, &netinfo.to_cell()).await?;
    let reply = read_cell(stream, 4).await?;
    if reply.command != CellCommand::Netinfo {
        return Err(TorError::ProtocolError("expected NETINFO".into()));
    }
    Ok(())
}

async fn serve_link(network: Arc<MockNetwork>, guard: usize, mut stream: DuplexStream) {
    if serve_handshake(&mut stream).await.is_err() {
        return;
    }
    network.record(Event::Link {
        relay: network.relays[guard].descriptor.nickname.clone(),
    });

    let mut circuits = HashMap::new();
    while let Ok(cell) = read_cell(&mut stream, 4).await {
        for reply in network.handle(guard, &mut circuits, cell) {
            if write_cell(&mut stream, &reply).await.is_err() {
                return;
            }
        }
    }
}

/// Transport connecting straight into the mock network
pub struct MockTransport {
    network: Arc<MockNetwork>,
    attempts: AtomicUsize,
    links: Mutex<Vec<JoinHandle<()>>>,
}

impl MockTransport {
    pub fn new(network: Arc<MockNetwork>) -> Arc<Self> {
        Arc::new(Self {
            network,
            attempts: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Drop the relay end of every link opened so far
    pub fn sever_links(&self) {
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, router: &RouterDescriptor) -> Result<TransportStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.network.faults.refuse_connect.contains(&router.fingerprint) {
            return Err(TorError::ConnectionFailed(format!(
                "{} refused",
                router.nickname
            )));
        }
        let index = self
            .network
            .index_of(&router.fingerprint)
            .ok_or_else(|| TorError::ConnectionFailed("unknown relay".into()))?;
        let (client, server) = tokio::io::duplex(1 << 20);
        let link = tokio::spawn(serve_link(self.network.clone(), index, server));
        self.links.lock().unwrap().push(link);
        Ok(TransportStream {
            stream: Box::new(client),
            peer_certificate: TLS_CERT.to_vec(),
        })
    }
}

/// Poll `check` for up to a second
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
