//! ntor-v3 handshake
//!
//! Extends ntor with an encrypted, authenticated message in each direction
//! and binds the handshake to the relay's Ed25519 identity. All hashing is
//! SHA3-256 / SHAKE-256 with length-encapsulated tweaks.

use super::HandshakeReply;
use crate::protocol::crypto::{aes256_ctr, encap, shake256, KeyMaterial};
use rand::rngs::OsRng;
use sha3::{Digest, Sha3_256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

pub const PROTOID: &[u8] = b"ntor3-curve25519-sha3_256-1";
const T_MSGKDF: &[u8] = b"ntor3-curve25519-sha3_256-1:kdf_phase1";
const T_MSGMAC: &[u8] = b"ntor3-curve25519-sha3_256-1:msg_mac";
const T_KEY_SEED: &[u8] = b"ntor3-curve25519-sha3_256-1:key_seed";
const T_VERIFY: &[u8] = b"ntor3-curve25519-sha3_256-1:verify";
const T_FINAL: &[u8] = b"ntor3-curve25519-sha3_256-1:kdf_final";
const T_AUTH: &[u8] = b"ntor3-curve25519-sha3_256-1:auth_final";

/// Verification string used when extending circuits
pub const CIRCUIT_VERIFICATION: &[u8] = b"circuit extend";

/// enc_key (32) | Df (20) | Db (20) | Kf (16) | Kb (16)
const FINAL_LEN: usize = 32 + 72;

/// Tweaked hash: SHA3-256(ENCAP(t) | data...)
fn tweaked_hash(tweak: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(encap(tweak));
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Client side of an ntor-v3 handshake
pub struct NtorV3Client {
    client_secret: StaticSecret,
    client_public: PublicKey,
    relay_id: [u8; 32],
    relay_onion_key: PublicKey,
    verification: Vec<u8>,
    msg_mac: [u8; 32],
    onionskin: Vec<u8>,
}

impl NtorV3Client {
    /// Circuit-extension handshake with an empty client message
    pub fn new(relay_id: [u8; 32], relay_onion_key: [u8; 32]) -> Self {
        Self::with_message(
            StaticSecret::random_from_rng(OsRng),
            relay_id,
            relay_onion_key,
            &[],
            CIRCUIT_VERIFICATION,
        )
    }

    /// Handshake with a caller-chosen secret, client message and verification
    pub fn with_message(
        client_secret: StaticSecret,
        relay_id: [u8; 32],
        relay_onion_key: [u8; 32],
        message: &[u8],
        verification: &[u8],
    ) -> Self {
        let client_public = PublicKey::from(&client_secret);
        let relay_onion_key = PublicKey::from(relay_onion_key);
        let bx = client_secret.diffie_hellman(&relay_onion_key);

        // phase1 keys = KDF_msgkdf(Bx | ID | X | B | PROTOID | ENCAP(VER))
        let encap_t_msgkdf = encap(T_MSGKDF);
        let encap_ver = encap(verification);
        let phase1 = shake256(
            &[
                &encap_t_msgkdf,
                bx.as_bytes(),
                &relay_id,
                client_public.as_bytes(),
                relay_onion_key.as_bytes(),
                PROTOID,
                &encap_ver,
            ],
            64,
        );
        let mut enc_key = [0u8; 32];
        enc_key.copy_from_slice(&phase1[..32]);
        let mac_key = &phase1[32..64];

        let mut encrypted = message.to_vec();
        aes256_ctr(&enc_key, &mut encrypted);

        // msg_mac = MAC_msgmac(MAC_K1, ID | B | X | encrypted_msg)
        let msg_mac = tweaked_hash(
            T_MSGMAC,
            &[
                &encap(mac_key),
                &relay_id,
                relay_onion_key.as_bytes(),
                client_public.as_bytes(),
                &encrypted,
            ],
        );

        let mut onionskin = Vec::with_capacity(96 + encrypted.len() + 32);
        onionskin.extend_from_slice(&relay_id);
        onionskin.extend_from_slice(relay_onion_key.as_bytes());
        onionskin.extend_from_slice(client_public.as_bytes());
        onionskin.extend_from_slice(&encrypted);
        onionskin.extend_from_slice(&msg_mac);

        Self {
            client_secret,
            client_public,
            relay_id,
            relay_onion_key,
            verification: verification.to_vec(),
            msg_mac,
            onionskin,
        }
    }

    /// CREATE2/EXTEND2 handshake data: ID | B | X | ENC(msg) | MAC
    pub fn onionskin(&self) -> &[u8] {
        &self.onionskin
    }

    /// Complete the handshake
    ///
    /// Returns the key bundle and the decrypted server message, or `None`
    /// when AUTH does not verify.
    pub fn complete(&self, reply: &HandshakeReply) -> Option<(KeyMaterial, Vec<u8>)> {
        let y = PublicKey::from(reply.public_key);
        let yx = self.client_secret.diffie_hellman(&y);
        let bx = self.client_secret.diffie_hellman(&self.relay_onion_key);

        let encap_ver = encap(&self.verification);
        let mut secret_input = Vec::with_capacity(32 * 6 + PROTOID.len() + encap_ver.len());
        secret_input.extend_from_slice(yx.as_bytes());
        secret_input.extend_from_slice(bx.as_bytes());
        secret_input.extend_from_slice(&self.relay_id);
        secret_input.extend_from_slice(self.relay_onion_key.as_bytes());
        secret_input.extend_from_slice(self.client_public.as_bytes());
        secret_input.extend_from_slice(y.as_bytes());
        secret_input.extend_from_slice(PROTOID);
        secret_input.extend_from_slice(&encap_ver);

        let key_seed = tweaked_hash(T_KEY_SEED, &[&secret_input]);
        let verify = tweaked_hash(T_VERIFY, &[&secret_input]);

        let computed_auth = tweaked_hash(
            T_AUTH,
            &[
                &verify,
                &self.relay_id,
                self.relay_onion_key.as_bytes(),
                y.as_bytes(),
                self.client_public.as_bytes(),
                &self.msg_mac,
                &encap(&reply.encrypted_message),
                PROTOID,
                b"Server",
            ],
        );

        let auth_valid: bool = computed_auth.ct_eq(&reply.auth).into();
        if !auth_valid {
            log::warn!("⚠️ ntor-v3 AUTH verification failed!");
            return None;
        }

        let okm = shake256(&[&encap(T_FINAL), &key_seed], FINAL_LEN);
        let mut enc_key = [0u8; 32];
        enc_key.copy_from_slice(&okm[..32]);
        let mut server_message = reply.encrypted_message.clone();
        aes256_ctr(&enc_key, &mut server_message);

        Some((KeyMaterial::standard(&okm[32..], None), server_message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h32(s: &str) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&hex::decode(s).unwrap());
        out
    }

    // Published test vector for ntor-v3 (tor proposal 332 / arti)
    const B: &str = "4051daa5921cfa2a1c27b08451324919538e79e788a81b38cbed097a5dff454a";
    const ID: &str = "9fad2af287ef942632833d21f946c6260c33fae6172b60006e86e4a6911753a2";
    const X: &str = "b825a3719147bcbe5fb1d0b0fcb9c09e51948048e2e3283d2ab7b45b5ef38b49";
    const CLIENT_HANDSHAKE: &str = "9fad2af287ef942632833d21f946c6260c33fae6172b60006e86e4a6911753a2f8307a2bc1870b00b828bb74dbb8fd88e632a6375ab3bcd1ae706aaa8b6cdd1d252fe9ae91264c91d4ecb8501f79d0387e34ad8ca0f7c995184f7d11d5da4f463bebd9151fd3b47c180abc9e044d53565f04d82bbb3bebed3d06cea65db8be9c72b68cd461942088502f67";
    const SERVER_HANDSHAKE: &str = "4bf4814326fdab45ad5184f5518bd7fae25dc59374062698201a50a22954246d2fc5f8773ca824542bc6cf6f57c7c29bbf4e5476461ab130c5b18ab0a91276651202c3e1e87c0d32054c";
    const KEYSTREAM: &str = "9c19b631fd94ed86a817e01f6c80b0743a43f5faebd39cfaa8b00fa8bcc65c3bfeaa403d91acbd68a821bf6ee8504602b094a254392a07737d5662768c7a9fb1b2814bb34780eaee6e867c773e28c212ead563e98a1cd5d5b4576f5ee61c59bde025ff2851bb19b721421694f263818e35";

    fn vector_client() -> NtorV3Client {
        let b_secret = StaticSecret::from(h32(B));
        let b_pub = PublicKey::from(&b_secret);
        NtorV3Client::with_message(
            StaticSecret::from(h32(X)),
            h32(ID),
            *b_pub.as_bytes(),
            b"hello world",
            b"xyzzy",
        )
    }

    #[test]
    fn test_client_onionskin_matches_vector() {
        let client = vector_client();
        assert_eq!(hex::encode(client.onionskin()), CLIENT_HANDSHAKE);
    }

    #[test]
    fn test_server_reply_yields_vector_keys() {
        let client = vector_client();
        let reply = HandshakeReply::from_bytes(&hex::decode(SERVER_HANDSHAKE).unwrap());
        let (keys, message) = client.complete(&reply).expect("auth should verify");

        assert_eq!(message, b"Hola Mundo".to_vec());

        let keystream = hex::decode(KEYSTREAM).unwrap();
        assert_eq!(keys.forward_digest, keystream[0..20].to_vec());
        assert_eq!(keys.backward_digest, keystream[20..40].to_vec());
        assert_eq!(keys.forward_key, keystream[40..56].to_vec());
        assert_eq!(keys.backward_key, keystream[56..72].to_vec());
        assert!(keys.kh.is_none());
    }

    #[test]
    fn test_tampered_reply_rejected() {
        let client = vector_client();
        let mut raw = hex::decode(SERVER_HANDSHAKE).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x80;
        let reply = HandshakeReply::from_bytes(&raw);
        assert!(client.complete(&reply).is_none());
    }

    #[test]
    fn test_circuit_extend_onionskin_length() {
        let client = NtorV3Client::new([1; 32], [9; 32]);
        // ID | B | X | empty message | MAC
        assert_eq!(client.onionskin().len(), 32 * 4);
    }
}
