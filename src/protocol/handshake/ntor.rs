//! ntor handshake implementation
//!
//! Implements the ntor (ntor1) key exchange protocol used by Tor for circuit creation.
//! Based on X25519 Elliptic Curve Diffie-Hellman.
//!
//! References:
//! - Tor Spec: https://spec.torproject.org/tor-spec/create-created-cells.html
//!
//! Security: Uses constant-time comparison for AUTH verification to prevent timing attacks.

use super::HandshakeReply;
use crate::protocol::crypto::{hkdf_expand, hmac_sha256, KeyMaterial};
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

pub const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Bytes of key material expanded from KEY_SEED: Df | Db | Kf | Kb | KH
const KEY_LEN: usize = 92;

/// Client side of an ntor handshake
///
/// StaticSecret from x25519-dalek zeroizes itself on drop.
pub struct NtorClient {
    client_secret: StaticSecret,
    client_public: PublicKey,
    relay_id: [u8; 20],
    relay_onion_key: PublicKey,
}

impl NtorClient {
    /// Start a handshake with a fresh ephemeral keypair
    pub fn new(relay_id: [u8; 20], relay_onion_key: [u8; 32]) -> Self {
        Self::with_secret(
            StaticSecret::random_from_rng(OsRng),
            relay_id,
            relay_onion_key,
        )
    }

    /// Start a handshake with a caller-chosen ephemeral secret
    pub fn with_secret(
        client_secret: StaticSecret,
        relay_id: [u8; 20],
        relay_onion_key: [u8; 32],
    ) -> Self {
        let client_public = PublicKey::from(&client_secret);
        Self {
            client_secret,
            client_public,
            relay_id,
            relay_onion_key: PublicKey::from(relay_onion_key),
        }
    }

    /// Get the client's public key (to send to relay)
    pub fn client_public_key(&self) -> &PublicKey {
        &self.client_public
    }

    /// CREATE2 handshake data: ID (20) | B (32) | X (32)
    pub fn onionskin(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(84);
        data.extend_from_slice(&self.relay_id);
        data.extend_from_slice(self.relay_onion_key.as_bytes());
        data.extend_from_slice(self.client_public.as_bytes());
        data
    }

    /// Complete the handshake with relay's response
    ///
    /// secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID
    pub fn complete(&self, reply: &HandshakeReply) -> Option<KeyMaterial> {
        let server_public = PublicKey::from(reply.public_key);

        let shared_yx = self.client_secret.diffie_hellman(&server_public);
        let shared_bx = self.client_secret.diffie_hellman(&self.relay_onion_key);

        let mut secret_input = Vec::with_capacity(204);
        secret_input.extend_from_slice(shared_yx.as_bytes());
        secret_input.extend_from_slice(shared_bx.as_bytes());
        secret_input.extend_from_slice(&self.relay_id);
        secret_input.extend_from_slice(self.relay_onion_key.as_bytes());
        secret_input.extend_from_slice(self.client_public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        // KEY_SEED = H(secret_input, t_key), verify = H(secret_input, t_verify)
        let key_seed = hmac_sha256(T_KEY, &secret_input);
        let verify = hmac_sha256(T_VERIFY, &secret_input);

        // auth_input = verify | ID | B | Y | X | PROTOID | "Server"
        let mut auth_input = Vec::with_capacity(32 + 20 + 96 + PROTOID.len() + 6);
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&self.relay_id);
        auth_input.extend_from_slice(self.relay_onion_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.client_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let computed_auth = hmac_sha256(T_MAC, &auth_input);
        let auth_valid: bool = computed_auth.ct_eq(&reply.auth).into();
        if !auth_valid {
            log::warn!("⚠️ Server AUTH verification failed!");
            return None;
        }
        log::debug!("  ✅ Server AUTH verified (constant-time)!");

        let okm = hkdf_expand(&key_seed, M_EXPAND, KEY_LEN).ok()?;
        let mut kh = [0u8; 20];
        kh.copy_from_slice(&okm[72..92]);
        Some(KeyMaterial::standard(&okm, Some(kh)))
    }
}
