//! Hidden-service (v3 onion) helpers
//!
//! Address parsing, per-period key blinding and subcredentials, the HSDir
//! hash ring, and construction of the INTRODUCE1 body sent to an
//! introduction point. Descriptor fetching and decryption are not done here;
//! the caller supplies [`IntroductionPoint`]s.

use crate::error::{Result, TorError};
use crate::protocol::crypto::{aes256_ctr, sha3_256};
use crate::protocol::handshake::hs_ntor::hs_mac;
use crate::protocol::handshake::HsNtorClient;
use crate::protocol::relay::{IntroductionPoint, RouterDescriptor};
use crate::protocol::relay_cell::LinkSpecifier;
use curve25519_dalek::edwards::CompressedEdwardsY;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

const ONION_VERSION: u8 = 3;
const CHECKSUM_PREFIX: &[u8] = b".onion checksum";
const BLIND_STRING: &[u8] = b"Derive temporary signing key\0";
const ED25519_BASEPOINT: &[u8] = b"(15112221349535400772501151409588531511454012693041857206046113283949847762202, 46316835694926478169428394003475163141307993866256225615783033603165251855960)";

/// Default `hsdir_interval`, in minutes
pub const TIME_PERIOD_LENGTH: u64 = 1440;

/// Periods start 12 hours after midnight UTC
const TIME_PERIOD_OFFSET_MINUTES: u64 = 12 * 60;

/// Default `hsdir_n_replicas`
pub const HSDIR_N_REPLICAS: u64 = 2;

/// Default `hsdir_spread_fetch`
pub const HSDIR_SPREAD_FETCH: usize = 3;

/// Total INTRODUCE1 body length, MAC included
pub const INTRODUCE1_LEN: usize = 490;

const MAC_LEN: usize = 32;

/// Time period number for a unix timestamp
pub fn time_period(unix_secs: u64) -> u64 {
    (unix_secs / 60).saturating_sub(TIME_PERIOD_OFFSET_MINUTES) / TIME_PERIOD_LENGTH
}

pub fn current_time_period() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    time_period(now)
}

/// A parsed and checksum-verified v3 onion address
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct OnionAddress {
    address: String,
    public_key: [u8; 32],
}

impl OnionAddress {
    /// Parse `<56 base32 chars>.onion`
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.to_lowercase();
        let host = address
            .strip_suffix(".onion")
            .ok_or_else(|| TorError::InvalidAddress(format!("{} does not end in .onion", address)))?;
        if host.len() != 56 {
            return Err(TorError::InvalidAddress(format!(
                "{} is not a v3 address",
                address
            )));
        }

        let decoded = base32::decode(
            base32::Alphabet::Rfc4648 { padding: false },
            &host.to_uppercase(),
        )
        .filter(|bytes| bytes.len() == 35)
        .ok_or_else(|| TorError::InvalidAddress(format!("{} is not valid base32", address)))?;

        let version = decoded[34];
        if version != ONION_VERSION {
            return Err(TorError::InvalidAddress(format!(
                "unsupported onion service version {}",
                version
            )));
        }

        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&decoded[..32]);
        let checksum = onion_checksum(&public_key);
        if decoded[32..34] != checksum {
            return Err(TorError::InvalidAddress(format!(
                "checksum mismatch for {}",
                address
            )));
        }

        Ok(Self {
            address,
            public_key,
        })
    }

    /// Address for an Ed25519 identity key
    pub fn from_public_key(public_key: [u8; 32]) -> Self {
        let mut bytes = Vec::with_capacity(35);
        bytes.extend_from_slice(&public_key);
        bytes.extend_from_slice(&onion_checksum(&public_key));
        bytes.push(ONION_VERSION);
        let host = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &bytes);
        Self {
            address: format!("{}.onion", host.to_lowercase()),
            public_key,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.address
    }

    /// Service identity key
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// N_hs_cred = SHA3-256("credential" | A)
    pub fn credential(&self) -> [u8; 32] {
        sha3_256(&[b"credential", &self.public_key])
    }

    /// Identity key blinded for `period`
    ///
    /// A' = clamp(h) * A with
    /// h = SHA3-256(BLIND_STRING | A | "" | B | "key-blind" | period | length)
    pub fn blinded_public_key(&self, period: u64) -> Result<[u8; 32]> {
        let point = CompressedEdwardsY(self.public_key)
            .decompress()
            .ok_or_else(|| {
                TorError::InvalidAddress(format!("{} is not a curve point", self.address))
            })?;
        let factor = self.blinding_factor(period);
        Ok(point.mul_clamped(factor).compress().to_bytes())
    }

    fn blinding_factor(&self, period: u64) -> [u8; 32] {
        sha3_256(&[
            BLIND_STRING,
            &self.public_key,
            ED25519_BASEPOINT,
            b"key-blind",
            &period.to_be_bytes(),
            &TIME_PERIOD_LENGTH.to_be_bytes(),
        ])
    }

    /// N_hs_subcred = SHA3-256("subcredential" | N_hs_cred | A')
    pub fn subcredential(&self, period: u64) -> Result<[u8; 32]> {
        let blinded = self.blinded_public_key(period)?;
        Ok(sha3_256(&[b"subcredential", &self.credential(), &blinded]))
    }
}

impl FromStr for OnionAddress {
    type Err = TorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

impl fmt::Debug for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OnionAddress({})", self.address)
    }
}

fn onion_checksum(public_key: &[u8; 32]) -> [u8; 2] {
    let digest = sha3_256(&[CHECKSUM_PREFIX, public_key, &[ONION_VERSION]]);
    [digest[0], digest[1]]
}

/// Position of an HSDir on the hash ring
pub fn hsdir_index(ed25519_id: &[u8; 32], shared_random: &[u8; 32], period: u64) -> [u8; 32] {
    sha3_256(&[
        b"node-idx",
        ed25519_id,
        shared_random,
        &period.to_be_bytes(),
        &TIME_PERIOD_LENGTH.to_be_bytes(),
    ])
}

/// Ring position a descriptor replica is stored at
pub fn store_at_index(blinded_key: &[u8; 32], replica: u64, period: u64) -> [u8; 32] {
    sha3_256(&[
        b"store-at-idx",
        blinded_key,
        &replica.to_be_bytes(),
        &TIME_PERIOD_LENGTH.to_be_bytes(),
        &period.to_be_bytes(),
    ])
}

/// HSDirs that may hold the descriptor for `blinded_key`
///
/// For each replica, the `HSDIR_SPREAD_FETCH` directories following the
/// replica's ring position are taken. Relays without the HSDir flag or an
/// Ed25519 identity are not on the ring.
pub fn responsible_hsdirs<'a>(
    blinded_key: &[u8; 32],
    shared_random: &[u8; 32],
    period: u64,
    relays: &'a [RouterDescriptor],
) -> Vec<&'a RouterDescriptor> {
    let mut ring: Vec<([u8; 32], &RouterDescriptor)> = relays
        .iter()
        .filter(|r| r.flags.hs_dir)
        .filter_map(|r| {
            r.ed25519_id
                .map(|id| (hsdir_index(&id, shared_random, period), r))
        })
        .collect();
    ring.sort_by(|a, b| a.0.cmp(&b.0));
    if ring.is_empty() {
        return Vec::new();
    }

    let mut chosen: Vec<&RouterDescriptor> = Vec::new();
    for replica in 1..=HSDIR_N_REPLICAS {
        let target = store_at_index(blinded_key, replica, period);
        let start = ring.partition_point(|(index, _)| *index <= target);
        for offset in 0..HSDIR_SPREAD_FETCH.min(ring.len()) {
            let relay = ring[(start + offset) % ring.len()].1;
            if !chosen.iter().any(|c| c.same_router(relay)) {
                chosen.push(relay);
            }
        }
    }
    chosen
}

/// Fresh 20-byte rendezvous cookie
pub fn rendezvous_cookie() -> [u8; 20] {
    let mut cookie = [0u8; 20];
    OsRng.fill_bytes(&mut cookie);
    cookie
}

/// INTRODUCE1 body for `intro`, naming `rendezvous_point` and `cookie`
///
/// ```text
/// LEGACY_KEY_ID (20, zero) | AUTH_KEY_TYPE (1) = 2 | AUTH_KEY_LEN (2) | AUTH_KEY
/// N_EXTENSIONS (1) = 0 | CLIENT_PK (32) | ENCRYPTED | MAC (32)
///
/// ENCRYPTED = AES-256-CTR(enc_key,
///     COOKIE (20) | N_EXTENSIONS (1) = 0 | ONION_KEY_TYPE (1) = 1 |
///     ONION_KEY_LEN (2) | ONION_KEY | NSPEC | LINK_SPECIFIERS | zero padding)
/// ```
///
/// The body is padded to 490 bytes; MAC = hs_mac(mac_key, everything before it).
pub fn build_introduce1(
    intro: &IntroductionPoint,
    rendezvous_point: &RouterDescriptor,
    cookie: &[u8; 20],
    client: &HsNtorClient,
) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(INTRODUCE1_LEN);
    body.extend_from_slice(&[0u8; 20]);
    body.push(2);
    body.extend_from_slice(&(intro.auth_key.len() as u16).to_be_bytes());
    body.extend_from_slice(&intro.auth_key);
    body.push(0);
    body.extend_from_slice(client.client_public_key().as_bytes());

    let mut plaintext = Vec::with_capacity(INTRODUCE1_LEN);
    plaintext.extend_from_slice(cookie);
    plaintext.push(0);
    plaintext.push(1);
    plaintext.extend_from_slice(&32u16.to_be_bytes());
    plaintext.extend_from_slice(&rendezvous_point.ntor_onion_key);
    plaintext.extend_from_slice(&LinkSpecifier::encode_list(
        &rendezvous_point.link_specifiers(),
    ));

    let encrypted_len = INTRODUCE1_LEN - MAC_LEN - body.len();
    if plaintext.len() > encrypted_len {
        return Err(TorError::ProtocolError(format!(
            "INTRODUCE1 plaintext is {} bytes, room for {}",
            plaintext.len(),
            encrypted_len
        )));
    }
    plaintext.resize(encrypted_len, 0);

    let keys = client.intro_keys();
    aes256_ctr(&keys.enc_key, &mut plaintext);
    body.extend_from_slice(&plaintext);

    let mac = hs_mac(&keys.mac_key, &body);
    body.extend_from_slice(&mac);
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::relay::tests::test_router;
    use curve25519_dalek::edwards::EdwardsPoint;
    use curve25519_dalek::scalar::{clamp_integer, Scalar};
    use ed25519_dalek::SigningKey;
    use sha2::{Digest, Sha512};
    use x25519_dalek::StaticSecret;

    fn service_key() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    fn service_address() -> OnionAddress {
        OnionAddress::from_public_key(service_key().verifying_key().to_bytes())
    }

    #[test]
    fn test_time_period() {
        // 2016-04-13 11:00 UTC
        assert_eq!(time_period(1_460_545_200), 16903);
        // periods roll over at 12:00 UTC
        assert_eq!(time_period(1_460_548_800), 16904);
    }

    #[test]
    fn test_address_round_trip() {
        let address = service_address();
        assert_eq!(address.as_str().len(), 62);
        let parsed: OnionAddress = address.as_str().to_uppercase().parse().unwrap();
        assert_eq!(parsed, address);
        assert_eq!(parsed.public_key(), service_key().verifying_key().as_bytes());
    }

    #[test]
    fn test_address_rejections() {
        let address = service_address().to_string();
        assert!(OnionAddress::parse("example.com").is_err());
        assert!(OnionAddress::parse("abc.onion").is_err());

        // flip a checksum character
        let mut chars: Vec<char> = address.chars().collect();
        chars[52] = if chars[52] == 'a' { 'b' } else { 'a' };
        let tampered: String = chars.into_iter().collect();
        assert!(matches!(
            OnionAddress::parse(&tampered),
            Err(TorError::InvalidAddress(_))
        ));

        // version 2 with a valid checksum is still refused
        let key = service_key().verifying_key().to_bytes();
        let digest = sha3_256(&[CHECKSUM_PREFIX, &key, &[2]]);
        let mut bytes = key.to_vec();
        bytes.extend_from_slice(&digest[..2]);
        bytes.push(2);
        let v2 = format!(
            "{}.onion",
            base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &bytes).to_lowercase()
        );
        assert!(OnionAddress::parse(&v2).is_err());
    }

    #[test]
    fn test_blinded_key_matches_private_blinding() {
        let address = service_address();
        let period = 19_000;

        let expanded = Sha512::digest(service_key().to_bytes());
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&expanded[..32]);
        let a = Scalar::from_bytes_mod_order(clamp_integer(seed));
        let h = Scalar::from_bytes_mod_order(clamp_integer(address.blinding_factor(period)));
        let expected = EdwardsPoint::mul_base(&(h * a)).compress().to_bytes();

        assert_eq!(address.blinded_public_key(period).unwrap(), expected);
        assert_ne!(address.blinded_public_key(period + 1).unwrap(), expected);
    }

    #[test]
    fn test_subcredential_changes_per_period() {
        let address = service_address();
        let a = address.subcredential(100).unwrap();
        assert_eq!(a, address.subcredential(100).unwrap());
        assert_ne!(a, address.subcredential(101).unwrap());
    }

    #[test]
    fn test_responsible_hsdirs() {
        let mut relays: Vec<RouterDescriptor> = (1..=10).map(test_router).collect();
        for relay in relays.iter_mut().take(8) {
            relay.flags.hs_dir = true;
        }
        let blinded = service_address().blinded_public_key(7).unwrap();
        let dirs = responsible_hsdirs(&blinded, &[3; 32], 7, &relays);

        assert!(!dirs.is_empty());
        assert!(dirs.len() <= HSDIR_N_REPLICAS as usize * HSDIR_SPREAD_FETCH);
        assert!(dirs.iter().all(|r| r.flags.hs_dir));
        assert_eq!(dirs, responsible_hsdirs(&blinded, &[3; 32], 7, &relays));
        assert!(responsible_hsdirs(&blinded, &[3; 32], 7, &relays[8..]).is_empty());
    }

    #[test]
    fn test_introduce1_layout() {
        let intro = IntroductionPoint {
            link_specifiers: test_router(5).link_specifiers(),
            ntor_onion_key: [1; 32],
            auth_key: [2; 32],
            encryption_key: *x25519_dalek::PublicKey::from(&StaticSecret::from([8u8; 32]))
                .as_bytes(),
        };
        let rendezvous = test_router(6);
        let client = HsNtorClient::with_secret(
            StaticSecret::from([4u8; 32]),
            intro.auth_key,
            intro.encryption_key,
            [9; 32],
        );
        let cookie = [0xc0; 20];
        let body = build_introduce1(&intro, &rendezvous, &cookie, &client).unwrap();

        assert_eq!(body.len(), INTRODUCE1_LEN);
        assert_eq!(&body[..20], &[0u8; 20]);
        assert_eq!(body[20], 2);
        assert_eq!(&body[21..23], &32u16.to_be_bytes());
        assert_eq!(&body[23..55], &intro.auth_key);
        assert_eq!(body[55], 0);
        assert_eq!(&body[56..88], client.client_public_key().as_bytes());

        let keys = client.intro_keys();
        let mac_at = INTRODUCE1_LEN - MAC_LEN;
        assert_eq!(&body[mac_at..], &hs_mac(&keys.mac_key, &body[..mac_at]));

        let mut plaintext = body[88..mac_at].to_vec();
        aes256_ctr(&keys.enc_key, &mut plaintext);
        assert_eq!(&plaintext[..20], &cookie);
        assert_eq!(&plaintext[20..24], &[0, 1, 0, 32]);
        assert_eq!(&plaintext[24..56], &rendezvous.ntor_onion_key);
        let specs = LinkSpecifier::decode_list(&plaintext[56..]).unwrap();
        assert_eq!(specs, rendezvous.link_specifiers());
        let specs_len = LinkSpecifier::encode_list(&specs).len();
        assert!(plaintext[56 + specs_len..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_cookies_are_random() {
        assert_ne!(rendezvous_cookie(), rendezvous_cookie());
    }
}
