//! hs-ntor handshake for hidden-service introduction and rendezvous
//!
//! The client uses one ephemeral keypair for both halves:
//! - `HS_INTRO_KDF` derives the keys that encrypt and MAC the INTRODUCE1
//!   payload, bound to the service's per-period subcredential
//! - the RENDEZVOUS2 reply completes an ntor-style exchange that yields a
//!   SHA3/AES-256 hop appended to the rendezvous circuit

use super::HandshakeReply;
use crate::protocol::crypto::{sha3_256, shake256, KeyMaterial};
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const PROTOID: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1";
const T_HSENC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_extract";
const T_HSVERIFY: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_verify";
const T_HSMAC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_mac";
const M_HSEXPAND: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_expand";

/// Df (32) | Db (32) | Kf (32) | Kb (32)
const REND_KEY_LEN: usize = 128;

/// MAC(key, message) = SHA3-256(u64be(len(key)) | key | message)
pub fn hs_mac(key: &[u8], message: &[u8]) -> [u8; 32] {
    sha3_256(&[&(key.len() as u64).to_be_bytes(), key, message])
}

/// Keys protecting the INTRODUCE1 encrypted section
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HsIntroKeys {
    pub enc_key: [u8; 32],
    pub mac_key: [u8; 32],
}

/// Client side of hs-ntor
pub struct HsNtorClient {
    client_secret: StaticSecret,
    client_public: PublicKey,
    /// Introduction point auth key (Ed25519)
    auth_key: [u8; 32],
    /// Service encryption key for this introduction point (X25519, "B")
    encryption_key: PublicKey,
    subcredential: [u8; 32],
}

impl HsNtorClient {
    pub fn new(auth_key: [u8; 32], encryption_key: [u8; 32], subcredential: [u8; 32]) -> Self {
        Self::with_secret(
            StaticSecret::random_from_rng(OsRng),
            auth_key,
            encryption_key,
            subcredential,
        )
    }

    pub fn with_secret(
        client_secret: StaticSecret,
        auth_key: [u8; 32],
        encryption_key: [u8; 32],
        subcredential: [u8; 32],
    ) -> Self {
        let client_public = PublicKey::from(&client_secret);
        Self {
            client_secret,
            client_public,
            auth_key,
            encryption_key: PublicKey::from(encryption_key),
            subcredential,
        }
    }

    /// X, sent in the clear in INTRODUCE1
    pub fn client_public_key(&self) -> &PublicKey {
        &self.client_public
    }

    /// HS_INTRO_KDF
    ///
    /// intro_secret = EXP(B,x) | AUTH_KEY | X | B | PROTOID
    /// keys = SHAKE256(intro_secret | t_hsenc | m_hsexpand | subcredential)
    pub fn intro_keys(&self) -> HsIntroKeys {
        let bx = self.client_secret.diffie_hellman(&self.encryption_key);
        let okm = shake256(
            &[
                bx.as_bytes(),
                &self.auth_key,
                self.client_public.as_bytes(),
                self.encryption_key.as_bytes(),
                PROTOID,
                T_HSENC,
                M_HSEXPAND,
                &self.subcredential,
            ],
            64,
        );
        let mut keys = HsIntroKeys {
            enc_key: [0; 32],
            mac_key: [0; 32],
        };
        keys.enc_key.copy_from_slice(&okm[..32]);
        keys.mac_key.copy_from_slice(&okm[32..]);
        keys
    }

    /// Complete the rendezvous half from a RENDEZVOUS2 body
    ///
    /// rend_secret = EXP(Y,x) | EXP(B,x) | AUTH_KEY | B | X | Y | PROTOID
    pub fn complete(&self, reply: &HandshakeReply) -> Option<KeyMaterial> {
        let y = PublicKey::from(reply.public_key);
        let yx = self.client_secret.diffie_hellman(&y);
        let bx = self.client_secret.diffie_hellman(&self.encryption_key);

        let mut rend_secret = Vec::with_capacity(32 * 6 + PROTOID.len());
        rend_secret.extend_from_slice(yx.as_bytes());
        rend_secret.extend_from_slice(bx.as_bytes());
        rend_secret.extend_from_slice(&self.auth_key);
        rend_secret.extend_from_slice(self.encryption_key.as_bytes());
        rend_secret.extend_from_slice(self.client_public.as_bytes());
        rend_secret.extend_from_slice(y.as_bytes());
        rend_secret.extend_from_slice(PROTOID);

        let key_seed = hs_mac(&rend_secret, T_HSENC);
        let verify = hs_mac(&rend_secret, T_HSVERIFY);
        rend_secret.zeroize();

        let mut auth_input = Vec::with_capacity(32 * 5 + PROTOID.len() + 6);
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&self.auth_key);
        auth_input.extend_from_slice(self.encryption_key.as_bytes());
        auth_input.extend_from_slice(y.as_bytes());
        auth_input.extend_from_slice(self.client_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let computed_auth = hs_mac(&auth_input, T_HSMAC);
        let auth_valid: bool = computed_auth.ct_eq(&reply.auth).into();
        if !auth_valid {
            log::warn!("⚠️ RENDEZVOUS2 AUTH verification failed");
            return None;
        }

        let okm = shake256(&[&key_seed, M_HSEXPAND], REND_KEY_LEN);
        Some(KeyMaterial::hidden_service(&okm))
    }
}
