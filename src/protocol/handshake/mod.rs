//! Circuit key agreement
//!
//! Every handshake is a single request/response pair. Completing a handshake
//! yields `Some(KeyMaterial)` or `None` when the relay's authenticator does
//! not verify; callers turn `None` into [`crate::TorError::HandshakeFailed`]
//! and tear the circuit down.

pub mod fast;
pub mod hs_ntor;
pub mod ntor;
pub mod ntor_v3;

pub use fast::FastClient;
pub use hs_ntor::{HsIntroKeys, HsNtorClient};
pub use ntor::NtorClient;
pub use ntor_v3::NtorV3Client;

use super::crypto::KeyMaterial;
use super::relay::RouterDescriptor;

/// CREATE2/EXTEND2 handshake type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HandshakeType {
    Ntor = 2,
    NtorV3 = 3,
}

/// Server half of a handshake: `Y (32) | AUTH (32) | encrypted message`
///
/// Used for CREATED2, EXTENDED2 and RENDEZVOUS2 bodies. Short input is
/// zero-filled so a malformed reply fails authentication instead of parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeReply {
    pub public_key: [u8; 32],
    pub auth: [u8; 32],
    /// ntor-v3 server message (empty for ntor and hs-ntor)
    pub encrypted_message: Vec<u8>,
}

impl HandshakeReply {
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut reply = HandshakeReply::default();
        let y_len = data.len().min(32);
        reply.public_key[..y_len].copy_from_slice(&data[..y_len]);
        if data.len() > 32 {
            let auth_len = (data.len() - 32).min(32);
            reply.auth[..auth_len].copy_from_slice(&data[32..32 + auth_len]);
        }
        if data.len() > 64 {
            reply.encrypted_message = data[64..].to_vec();
        }
        reply
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.encrypted_message.len());
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.auth);
        out.extend_from_slice(&self.encrypted_message);
        out
    }
}

/// Pending client side of a CREATE2/EXTEND2 handshake
pub enum ClientHandshake {
    Ntor(NtorClient),
    NtorV3(NtorV3Client),
}

impl ClientHandshake {
    /// Pick ntor-v3 when the router advertises an Ed25519 identity, else ntor
    pub fn for_router(router: &RouterDescriptor) -> Self {
        match router.ed25519_id {
            Some(ed_id) => ClientHandshake::NtorV3(NtorV3Client::new(ed_id, router.ntor_onion_key)),
            None => ClientHandshake::Ntor(NtorClient::new(
                router.fingerprint,
                router.ntor_onion_key,
            )),
        }
    }

    /// Force the ntor handshake regardless of advertised identities
    pub fn ntor_for_router(router: &RouterDescriptor) -> Self {
        ClientHandshake::Ntor(NtorClient::new(router.fingerprint, router.ntor_onion_key))
    }

    pub fn handshake_type(&self) -> HandshakeType {
        match self {
            ClientHandshake::Ntor(_) => HandshakeType::Ntor,
            ClientHandshake::NtorV3(_) => HandshakeType::NtorV3,
        }
    }

    /// HDATA to put in CREATE2/EXTEND2
    pub fn onionskin(&self) -> Vec<u8> {
        match self {
            ClientHandshake::Ntor(h) => h.onionskin(),
            ClientHandshake::NtorV3(h) => h.onionskin().to_vec(),
        }
    }

    pub fn complete(&self, reply: &HandshakeReply) -> Option<KeyMaterial> {
        match self {
            ClientHandshake::Ntor(h) => h.complete(reply),
            ClientHandshake::NtorV3(h) => h.complete(reply).map(|(keys, _)| keys),
        }
    }
}
