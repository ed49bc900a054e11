//! Tor Protocol Cryptography
//!
//! Primitives used by the handshakes and the circuit onion pipeline:
//! - AES-128-CTR / AES-256-CTR stream ciphers with a zero IV
//! - Running SHA-1 / SHA3-256 relay digests (forkable)
//! - HMAC-SHA256, HKDF expansion, KDF-TOR, SHAKE-256
//!
//! Security: All key material is zeroized on drop to prevent memory leakage.

use crate::error::{Result, TorError};
use aes::{Aes128, Aes256};
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128BE,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use sha3::digest::{ExtendableOutput, XofReader};
use sha3::{Sha3_256, Shake256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;

/// AES-256-CTR cipher type
type Aes256Ctr = Ctr128BE<Aes256>;

type HmacSha256 = Hmac<Sha256>;

/// Running relay digest
///
/// Cloning forks the state, so the current tag can be read without
/// consuming the running hash.
#[derive(Clone)]
pub enum RunningDigest {
    Sha1(Sha1),
    Sha3(Sha3_256),
}

impl RunningDigest {
    /// SHA-1 digest seeded with Df/Db
    pub fn sha1(seed: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        Digest::update(&mut hasher, seed);
        RunningDigest::Sha1(hasher)
    }

    /// SHA3-256 digest seeded with Df/Db (hidden-service virtual hops)
    pub fn sha3(seed: &[u8]) -> Self {
        let mut hasher = Sha3_256::new();
        Digest::update(&mut hasher, seed);
        RunningDigest::Sha3(hasher)
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            RunningDigest::Sha1(h) => Digest::update(h, data),
            RunningDigest::Sha3(h) => Digest::update(h, data),
        }
    }

    /// Digest of everything absorbed so far
    pub fn current(&self) -> Vec<u8> {
        match self {
            RunningDigest::Sha1(h) => h.clone().finalize().to_vec(),
            RunningDigest::Sha3(h) => h.clone().finalize().to_vec(),
        }
    }
}

/// Per-direction stream cipher with persistent counter
pub enum RelayCipher {
    Aes128(Aes128Ctr),
    Aes256(Aes256Ctr),
}

impl RelayCipher {
    /// Create a cipher with a zero IV; key length selects AES-128 or AES-256
    pub fn new(key: &[u8]) -> Result<Self> {
        let iv = [0u8; 16];
        match key.len() {
            16 => Aes128Ctr::new_from_slices(key, &iv)
                .map(RelayCipher::Aes128)
                .map_err(|_| TorError::Crypto("Invalid AES-128 key".into())),
            32 => Aes256Ctr::new_from_slices(key, &iv)
                .map(RelayCipher::Aes256)
                .map_err(|_| TorError::Crypto("Invalid AES-256 key".into())),
            n => Err(TorError::Crypto(format!("Unsupported key length {}", n))),
        }
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        match self {
            RelayCipher::Aes128(c) => c.apply_keystream(data),
            RelayCipher::Aes256(c) => c.apply_keystream(data),
        }
    }
}

/// One-shot AES-256-CTR with a zero IV (ntor-v3 and INTRODUCE1 messages)
pub fn aes256_ctr(key: &[u8; 32], data: &mut [u8]) {
    let mut cipher = Aes256Ctr::new(key.into(), (&[0u8; 16]).into());
    cipher.apply_keystream(data);
}

/// Digest algorithm family of a hop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopFlavor {
    /// SHA-1 digests, AES-128 (ntor, ntor-v3, CREATE_FAST)
    Standard,
    /// SHA3-256 digests, AES-256 (hidden-service rendezvous hop)
    HiddenService,
}

/// Key bundle produced by a handshake
///
/// SECURITY: Keys are automatically zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// Forward digest seed (Df)
    pub forward_digest: Vec<u8>,
    /// Backward digest seed (Db)
    pub backward_digest: Vec<u8>,
    /// Forward encryption key (Kf)
    pub forward_key: Vec<u8>,
    /// Backward encryption key (Kb)
    pub backward_key: Vec<u8>,
    /// Handshake confirmation tag (ntor, CREATE_FAST)
    pub kh: Option<[u8; 20]>,
    #[zeroize(skip)]
    pub flavor: HopFlavor,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("flavor", &self.flavor)
            .finish_non_exhaustive()
    }
}

impl KeyMaterial {
    /// Split `Df (20) | Db (20) | Kf (16) | Kb (16)` from the front of `okm`
    pub fn standard(okm: &[u8], kh: Option<[u8; 20]>) -> Self {
        Self {
            forward_digest: okm[0..20].to_vec(),
            backward_digest: okm[20..40].to_vec(),
            forward_key: okm[40..56].to_vec(),
            backward_key: okm[56..72].to_vec(),
            kh,
            flavor: HopFlavor::Standard,
        }
    }

    /// Split `Df (32) | Db (32) | Kf (32) | Kb (32)` from the front of `okm`
    pub fn hidden_service(okm: &[u8]) -> Self {
        Self {
            forward_digest: okm[0..32].to_vec(),
            backward_digest: okm[32..64].to_vec(),
            forward_key: okm[64..96].to_vec(),
            backward_key: okm[96..128].to_vec(),
            kh: None,
            flavor: HopFlavor::HiddenService,
        }
    }

    /// Instantiate the running digests and ciphers for a hop
    pub fn into_hop(self) -> Result<HopCrypto> {
        let (forward_digest, backward_digest) = match self.flavor {
            HopFlavor::Standard => (
                RunningDigest::sha1(&self.forward_digest),
                RunningDigest::sha1(&self.backward_digest),
            ),
            HopFlavor::HiddenService => (
                RunningDigest::sha3(&self.forward_digest),
                RunningDigest::sha3(&self.backward_digest),
            ),
        };
        Ok(HopCrypto {
            forward_digest,
            backward_digest,
            forward_cipher: RelayCipher::new(&self.forward_key)?,
            backward_cipher: RelayCipher::new(&self.backward_key)?,
        })
    }
}

/// Live crypto state for one hop of a circuit
pub struct HopCrypto {
    pub forward_digest: RunningDigest,
    pub backward_digest: RunningDigest,
    pub forward_cipher: RelayCipher,
    pub backward_cipher: RelayCipher,
}

/// HMAC-SHA256(key, message)
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// HKDF-SHA256 expansion of an already pseudorandom key
pub fn hkdf_expand(prk: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>> {
    let hkdf = Hkdf::<Sha256>::from_prk(prk)
        .map_err(|_| TorError::Crypto("Invalid PRK length".into()))?;
    let mut okm = vec![0u8; len];
    hkdf.expand(info, &mut okm)
        .map_err(|_| TorError::Crypto("Key derivation failed".into()))?;
    Ok(okm)
}

/// KDF-TOR: SHA1(K0 | [0]) | SHA1(K0 | [1]) | ...
pub fn kdf_tor(k0: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 20);
    let mut i: u8 = 0;
    while out.len() < len {
        let mut hasher = Sha1::new();
        Digest::update(&mut hasher, k0);
        Digest::update(&mut hasher, [i]);
        out.extend_from_slice(&hasher.finalize());
        i = i.wrapping_add(1);
    }
    out.truncate(len);
    out
}

/// SHA-256 over a single buffer
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA3-256 over the concatenation of `parts`
pub fn sha3_256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    for part in parts {
        Digest::update(&mut hasher, part);
    }
    hasher.finalize().into()
}

/// SHAKE-256 over the concatenation of `parts`, squeezed to `len` bytes
pub fn shake256(parts: &[&[u8]], len: usize) -> Vec<u8> {
    let mut hasher = Shake256::default();
    for part in parts {
        sha3::digest::Update::update(&mut hasher, part);
    }
    let mut reader = hasher.finalize_xof();
    let mut out = vec![0u8; len];
    reader.read(&mut out);
    out
}

/// Length-prefixed encapsulation: `u64be(len) | data`
pub fn encap(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data.len());
    out.extend_from_slice(&(data.len() as u64).to_be_bytes());
    out.extend_from_slice(data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes_ctr_is_symmetric() {
        let mut enc = RelayCipher::new(&[42u8; 16]).unwrap();
        let mut dec = RelayCipher::new(&[42u8; 16]).unwrap();
        let mut data = b"Hello, Tor!".to_vec();
        let original = data.clone();

        enc.apply(&mut data);
        assert_ne!(data, original);
        dec.apply(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_cipher_keeps_counter_between_cells() {
        let mut streaming = RelayCipher::new(&[1u8; 32]).unwrap();
        let mut a = vec![0u8; 509];
        let mut b = vec![0u8; 509];
        streaming.apply(&mut a);
        streaming.apply(&mut b);

        let mut oneshot = vec![0u8; 1018];
        aes256_ctr(&[1u8; 32], &mut oneshot);
        assert_eq!(&oneshot[..509], &a[..]);
        assert_eq!(&oneshot[509..], &b[..]);
    }

    #[test]
    fn test_bad_key_length() {
        assert!(RelayCipher::new(&[0u8; 20]).is_err());
    }

    #[test]
    fn test_running_digest_fork() {
        let mut digest = RunningDigest::sha1(b"seed");
        digest.update(b"cell one");
        let first = digest.current();
        // reading does not consume
        assert_eq!(digest.current(), first);

        digest.update(b"cell two");
        assert_ne!(digest.current(), first);

        let mut expected = Sha1::new();
        Digest::update(&mut expected, b"seedcell onecell two");
        assert_eq!(digest.current(), expected.finalize().to_vec());
    }

    #[test]
    fn test_sha3_digest_width() {
        let digest = RunningDigest::sha3(&[0u8; 32]);
        assert_eq!(digest.current().len(), 32);
    }

    #[test]
    fn test_kdf_tor_blocks() {
        let out = kdf_tor(b"k0", 92);
        assert_eq!(out.len(), 92);
        let mut block1 = Sha1::new();
        Digest::update(&mut block1, b"k0\x01");
        assert_eq!(&out[20..40], &block1.finalize()[..]);
    }

    #[test]
    fn test_shake_prefix_stable() {
        let short = shake256(&[b"abc"], 32);
        let long = shake256(&[b"a", b"bc"], 64);
        assert_eq!(&long[..32], &short[..]);
    }

    #[test]
    fn test_encap() {
        assert_eq!(encap(b"xy"), vec![0, 0, 0, 0, 0, 0, 0, 2, b'x', b'y']);
    }

    #[test]
    fn test_key_material_split() {
        let okm: Vec<u8> = (0..72).collect();
        let keys = KeyMaterial::standard(&okm, None);
        assert_eq!(keys.forward_digest[0], 0);
        assert_eq!(keys.backward_digest[0], 20);
        assert_eq!(keys.forward_key[0], 40);
        assert_eq!(keys.backward_key[0], 56);
        assert!(keys.into_hop().is_ok());
    }
}
