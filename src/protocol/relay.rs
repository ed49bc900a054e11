//! Tor relay types and selection logic
//!
//! Router descriptors are supplied by the directory collaborator; this module
//! only describes them and picks among them. Nothing here fetches or parses
//! consensus documents.

use super::relay_cell::LinkSpecifier;
use crate::error::{Result, TorError};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV6};

/// A relay usable as a hop, guard or vanguard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterDescriptor {
    /// Relay nickname
    pub nickname: String,

    /// SHA-1 of the RSA identity key
    pub fingerprint: [u8; 20],

    /// Ed25519 identity key, when the relay advertises one
    pub ed25519_id: Option<[u8; 32]>,

    /// ntor onion key (curve25519)
    pub ntor_onion_key: [u8; 32],

    /// IPv4 address
    pub address: Ipv4Addr,

    /// OR (Onion Router) port
    pub or_port: u16,

    /// Optional IPv6 OR address
    #[serde(default)]
    pub ipv6: Option<SocketAddrV6>,

    /// Declared family members (fingerprints or nicknames)
    #[serde(default)]
    pub family: Vec<String>,

    /// Exit port summary, absent for non-exits
    #[serde(default)]
    pub exit_policy: Option<ExitPolicy>,

    /// Relay flags
    pub flags: RelayFlags,

    /// Microdescriptor digest, used as an alternate identity
    #[serde(default)]
    pub microdesc_digest: Option<String>,
}

impl RouterDescriptor {
    /// Get the SocketAddr for connecting to this relay
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address.into(), self.or_port)
    }

    /// Hex-encoded fingerprint, for logging and persistence
    pub fn fingerprint_hex(&self) -> String {
        hex::encode_upper(self.fingerprint)
    }

    /// Check if this relay can be used as a guard
    pub fn is_guard(&self) -> bool {
        self.flags.guard && self.flags.stable && self.flags.fast && self.flags.running
    }

    /// Check if this relay can be used as an exit
    pub fn is_exit(&self) -> bool {
        self.flags.exit && !self.flags.bad_exit && self.flags.running
    }

    /// Check if this relay is suitable as a middle relay
    pub fn is_middle(&self) -> bool {
        self.flags.fast && self.flags.running
    }

    /// Whether this relay's exit policy accepts connections to `port`
    pub fn allows_exit_port(&self, port: u16) -> bool {
        self.is_exit()
            && self
                .exit_policy
                .as_ref()
                .map(|p| p.allows(port))
                .unwrap_or(false)
    }

    /// Identity used to compare routers across descriptor refreshes
    pub fn identity(&self) -> RouterIdentity {
        RouterIdentity {
            fingerprint: self.fingerprint,
            ed25519_id: self.ed25519_id,
            microdesc_digest: self.microdesc_digest.clone(),
        }
    }

    /// Whether two descriptors describe the same router
    pub fn same_router(&self, other: &RouterDescriptor) -> bool {
        self.identity().matches(&other.identity())
    }

    /// Link specifiers in EXTEND2 order: IPv4, legacy id, Ed25519 id, IPv6
    pub fn link_specifiers(&self) -> Vec<LinkSpecifier> {
        let mut specs = vec![
            LinkSpecifier::Ipv4 {
                address: self.address,
                port: self.or_port,
            },
            LinkSpecifier::LegacyId(self.fingerprint),
        ];
        if let Some(ed) = self.ed25519_id {
            specs.push(LinkSpecifier::Ed25519Id(ed));
        }
        if let Some(v6) = self.ipv6 {
            specs.push(LinkSpecifier::Ipv6 {
                address: *v6.ip(),
                port: v6.port(),
            });
        }
        specs
    }
}

/// Router identity: any one matching key means "same router"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterIdentity {
    pub fingerprint: [u8; 20],
    #[serde(default)]
    pub ed25519_id: Option<[u8; 32]>,
    #[serde(default)]
    pub microdesc_digest: Option<String>,
}

impl RouterIdentity {
    pub fn matches(&self, other: &RouterIdentity) -> bool {
        if self.fingerprint == other.fingerprint {
            return true;
        }
        if let (Some(a), Some(b)) = (self.ed25519_id, other.ed25519_id) {
            if a == b {
                return true;
            }
        }
        matches!(
            (&self.microdesc_digest, &other.microdesc_digest),
            (Some(a), Some(b)) if a == b
        )
    }
}

/// Relay flags from consensus
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFlags {
    /// BadExit - should not be used as exit
    pub bad_exit: bool,

    /// Exit - allows exit traffic
    pub exit: bool,

    /// Fast - fast relay
    pub fast: bool,

    /// Guard - suitable as entry guard
    pub guard: bool,

    /// HSDir - hidden service directory
    pub hs_dir: bool,

    /// Running - currently running
    pub running: bool,

    /// Stable - stable relay
    pub stable: bool,

    /// V2Dir - version 2 directory protocol
    pub v2_dir: bool,

    /// Valid - valid relay descriptor
    pub valid: bool,
}

impl RelayFlags {
    /// Parse flags from consensus string
    pub fn from_string(flags: &str) -> Self {
        let mut relay_flags = RelayFlags::default();

        for flag in flags.split_whitespace() {
            match flag {
                "BadExit" => relay_flags.bad_exit = true,
                "Exit" => relay_flags.exit = true,
                "Fast" => relay_flags.fast = true,
                "Guard" => relay_flags.guard = true,
                "HSDir" => relay_flags.hs_dir = true,
                "Running" => relay_flags.running = true,
                "Stable" => relay_flags.stable = true,
                "V2Dir" => relay_flags.v2_dir = true,
                "Valid" => relay_flags.valid = true,
                _ => {} // Ignore unknown flags
            }
        }

        relay_flags
    }
}

/// Port summary from a microdescriptor `p` line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPolicy {
    /// true for "accept" lists, false for "reject" lists
    pub accept: bool,
    /// Inclusive port ranges
    pub ports: Vec<(u16, u16)>,
}

impl ExitPolicy {
    /// Parse "accept 80,443,1000-2000" / "reject 1-65535"
    pub fn parse(summary: &str) -> Result<Self> {
        let mut parts = summary.split_whitespace();
        let accept = match parts.next() {
            Some("accept") => true,
            Some("reject") => false,
            other => {
                return Err(TorError::InvalidRelay(format!(
                    "Bad exit policy keyword: {:?}",
                    other
                )))
            }
        };
        let list = parts
            .next()
            .ok_or_else(|| TorError::InvalidRelay("Exit policy has no ports".into()))?;

        let mut ports = Vec::new();
        for item in list.split(',') {
            let range = match item.split_once('-') {
                Some((lo, hi)) => (parse_port(lo)?, parse_port(hi)?),
                None => {
                    let p = parse_port(item)?;
                    (p, p)
                }
            };
            ports.push(range);
        }

        Ok(Self { accept, ports })
    }

    pub fn allows(&self, port: u16) -> bool {
        let listed = self
            .ports
            .iter()
            .any(|&(lo, hi)| (lo..=hi).contains(&port));
        listed == self.accept
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse()
        .map_err(|_| TorError::InvalidRelay(format!("Bad port in exit policy: {}", s)))
}

/// Introduction point from a hidden-service descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroductionPoint {
    pub link_specifiers: Vec<LinkSpecifier>,
    /// ntor key of the introduction relay itself
    pub ntor_onion_key: [u8; 32],
    /// Ed25519 auth key certified for this introduction point
    pub auth_key: [u8; 32],
    /// Service X25519 encryption key ("B" in hs-ntor)
    pub encryption_key: [u8; 32],
}

impl IntroductionPoint {
    /// Build a descriptor good enough to extend a circuit to the intro relay
    pub fn router(&self) -> Result<RouterDescriptor> {
        let mut address = None;
        let mut fingerprint = None;
        let mut ed25519_id = None;
        let mut ipv6 = None;
        for spec in &self.link_specifiers {
            match spec {
                LinkSpecifier::Ipv4 { address: a, port } => address = Some((*a, *port)),
                LinkSpecifier::LegacyId(id) => fingerprint = Some(*id),
                LinkSpecifier::Ed25519Id(id) => ed25519_id = Some(*id),
                LinkSpecifier::Ipv6 { address: a, port } => {
                    ipv6 = Some(SocketAddrV6::new(*a, *port, 0, 0))
                }
                LinkSpecifier::Unrecognized { .. } => {}
            }
        }
        let (address, or_port) = address.ok_or_else(|| {
            TorError::InvalidRelay("Introduction point has no IPv4 link specifier".into())
        })?;
        let fingerprint = fingerprint.ok_or_else(|| {
            TorError::InvalidRelay("Introduction point has no legacy identity".into())
        })?;

        Ok(RouterDescriptor {
            nickname: "introduction-point".into(),
            fingerprint,
            ed25519_id,
            ntor_onion_key: self.ntor_onion_key,
            address,
            or_port,
            ipv6,
            family: Vec::new(),
            exit_policy: None,
            flags: RelayFlags {
                running: true,
                valid: true,
                ..Default::default()
            },
            microdesc_digest: None,
        })
    }
}

/// Relay selection over the descriptors supplied by the directory layer
#[derive(Debug, Clone, Default)]
pub struct RelaySelector {
    relays: Vec<RouterDescriptor>,
}

impl RelaySelector {
    /// Create a new relay selector
    pub fn new(relays: Vec<RouterDescriptor>) -> Self {
        Self { relays }
    }

    pub fn relays(&self) -> &[RouterDescriptor] {
        &self.relays
    }

    /// Find the current descriptor for a router identity
    pub fn find(&self, identity: &RouterIdentity) -> Option<&RouterDescriptor> {
        self.relays.iter().find(|r| r.identity().matches(identity))
    }

    /// Get all guard-capable relays
    pub fn guards(&self) -> Vec<&RouterDescriptor> {
        self.relays.iter().filter(|r| r.is_guard()).collect()
    }

    /// Get all relays usable in the middle of a circuit
    pub fn middles(&self) -> Vec<&RouterDescriptor> {
        self.relays.iter().filter(|r| r.is_middle()).collect()
    }

    /// Pick a random exit that accepts `port`, skipping `exclude`
    pub fn select_exit<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        port: u16,
        exclude: &[&RouterDescriptor],
    ) -> Option<&RouterDescriptor> {
        let exits: Vec<&RouterDescriptor> = self
            .relays
            .iter()
            .filter(|r| r.allows_exit_port(port))
            .filter(|r| !exclude.iter().any(|e| e.same_router(r)))
            .collect();
        exits.choose(rng).copied()
    }

    /// Pick any running relay, skipping `exclude`
    pub fn select_any<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        exclude: &[&RouterDescriptor],
    ) -> Option<&RouterDescriptor> {
        let candidates: Vec<&RouterDescriptor> = self
            .relays
            .iter()
            .filter(|r| r.is_middle())
            .filter(|r| !exclude.iter().any(|e| e.same_router(r)))
            .collect();
        candidates.choose(rng).copied()
    }

    /// Get total number of relays
    pub fn count(&self) -> usize {
        self.relays.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    pub(crate) fn test_router(n: u8) -> RouterDescriptor {
        RouterDescriptor {
            nickname: format!("relay{}", n),
            fingerprint: [n; 20],
            ed25519_id: Some([n; 32]),
            ntor_onion_key: [n.wrapping_add(100); 32],
            address: Ipv4Addr::new(10, 0, 0, n),
            or_port: 9001,
            ipv6: None,
            family: Vec::new(),
            exit_policy: None,
            flags: RelayFlags::from_string("Fast Guard Running Stable Valid"),
            microdesc_digest: None,
        }
    }

    #[test]
    fn test_relay_flags_parsing() {
        let flags = RelayFlags::from_string("Fast Guard Running Stable Valid");
        assert!(flags.fast);
        assert!(flags.guard);
        assert!(flags.running);
        assert!(flags.stable);
        assert!(flags.valid);
        assert!(!flags.exit);
    }

    #[test]
    fn test_exit_policy() {
        let accept = ExitPolicy::parse("accept 80,443,1000-2000").unwrap();
        assert!(accept.allows(443));
        assert!(accept.allows(1500));
        assert!(!accept.allows(22));

        let reject = ExitPolicy::parse("reject 25,119").unwrap();
        assert!(reject.allows(80));
        assert!(!reject.allows(25));

        assert!(ExitPolicy::parse("allow 80").is_err());
    }

    #[test]
    fn test_identity_matching() {
        let a = test_router(1);
        let mut b = test_router(2);
        assert!(!a.same_router(&b));

        // same Ed25519 identity under a rotated RSA key
        b.ed25519_id = a.ed25519_id;
        assert!(a.same_router(&b));

        let mut c = test_router(3);
        let mut d = test_router(4);
        c.ed25519_id = None;
        d.ed25519_id = None;
        c.microdesc_digest = Some("abc".into());
        d.microdesc_digest = Some("abc".into());
        assert!(c.same_router(&d));
    }

    #[test]
    fn test_link_specifier_order() {
        let mut relay = test_router(5);
        relay.ipv6 = Some("[2001:db8::5]:9001".parse().unwrap());
        let specs = relay.link_specifiers();
        assert!(matches!(specs[0], LinkSpecifier::Ipv4 { .. }));
        assert!(matches!(specs[1], LinkSpecifier::LegacyId(_)));
        assert!(matches!(specs[2], LinkSpecifier::Ed25519Id(_)));
        assert!(matches!(specs[3], LinkSpecifier::Ipv6 { .. }));
    }

    #[test]
    fn test_select_exit_honours_policy_and_exclusions() {
        let mut exit_a = test_router(1);
        exit_a.flags.exit = true;
        exit_a.exit_policy = Some(ExitPolicy::parse("accept 443").unwrap());
        let mut exit_b = test_router(2);
        exit_b.flags.exit = true;
        exit_b.exit_policy = Some(ExitPolicy::parse("accept 80").unwrap());
        let selector = RelaySelector::new(vec![exit_a.clone(), exit_b, test_router(3)]);

        let mut rng = StdRng::seed_from_u64(7);
        let chosen = selector.select_exit(&mut rng, 443, &[]).unwrap();
        assert!(chosen.same_router(&exit_a));
        assert!(selector.select_exit(&mut rng, 443, &[&exit_a]).is_none());
    }

    #[test]
    fn test_intro_point_router() {
        let intro = IntroductionPoint {
            link_specifiers: test_router(9).link_specifiers(),
            ntor_onion_key: [1; 32],
            auth_key: [2; 32],
            encryption_key: [3; 32],
        };
        let router = intro.router().unwrap();
        assert_eq!(router.fingerprint, [9; 20]);
        assert_eq!(router.ed25519_id, Some([9; 32]));
        assert_eq!(router.ntor_onion_key, [1; 32]);
    }
}
