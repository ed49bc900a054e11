//! CREATE_FAST handshake
//!
//! Only safe for the first hop, where the link is already authenticated.
//! Both sides contribute 20 random bytes and keys come from KDF-TOR.

use crate::protocol::crypto::{kdf_tor, KeyMaterial};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// KH (20) | Df (20) | Db (20) | Kf (16) | Kb (16)
const KEY_LEN: usize = 92;

pub struct FastClient {
    x: [u8; 20],
}

impl FastClient {
    pub fn new() -> Self {
        let mut x = [0u8; 20];
        OsRng.fill_bytes(&mut x);
        Self { x }
    }

    pub fn with_material(x: [u8; 20]) -> Self {
        Self { x }
    }

    /// CREATE_FAST body
    pub fn x(&self) -> &[u8; 20] {
        &self.x
    }

    /// Derive keys from the relay's Y and check its KH
    pub fn complete(&self, y: &[u8; 20], kh: &[u8; 20]) -> Option<KeyMaterial> {
        let mut k0 = [0u8; 40];
        k0[..20].copy_from_slice(&self.x);
        k0[20..].copy_from_slice(y);
        let okm = kdf_tor(&k0, KEY_LEN);
        k0.zeroize();

        let kh_ok: bool = okm[..20].ct_eq(kh).into();
        if !kh_ok {
            log::warn!("⚠️ CREATED_FAST KH mismatch");
            return None;
        }

        let mut expected_kh = [0u8; 20];
        expected_kh.copy_from_slice(&okm[..20]);
        Some(KeyMaterial::standard(&okm[20..], Some(expected_kh)))
    }
}

impl Default for FastClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FastClient {
    fn drop(&mut self) {
        self.x.zeroize();
    }
}
