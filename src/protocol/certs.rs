//! Tor certificate verification
//!
//! This module implements certificate parsing and verification for the
//! CERTS cell sent by a guard during the link handshake.
//!
//! The client checks the Ed25519 chain only:
//! - the type 4 cert (identity -> signing key) is signed by the identity key
//!   carried in its own `signed-with-ed25519-key` extension
//! - the type 5 cert (signing key -> TLS link) is signed by the signing key
//! - the type 5 certified key equals SHA-256 of the peer's TLS certificate

use super::cell::ByteReader;
use crate::error::{Result, TorError};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// Certificate types carried in CERTS cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CertType {
    /// Type 1: Link key certificate signed with RSA identity key (legacy)
    RsaLink = 1,
    /// Type 2: RSA1024 Identity certificate (legacy)
    RsaId = 2,
    /// Type 3: RSA1024 AUTHENTICATE cell link certificate (legacy)
    RsaAuth = 3,
    /// Type 4: Ed25519 signing key, signed with Ed25519 identity key
    Ed25519SigningKey = 4,
    /// Type 5: TLS link certificate, signed with Ed25519 signing key
    Ed25519TlsLink = 5,
    /// Type 6: Ed25519 AUTHENTICATE cell key, signed with Ed25519 signing key
    Ed25519AuthKey = 6,
    /// Type 7: Ed25519 identity, signed with RSA identity (cross-cert)
    Ed25519Identity = 7,
}

impl CertType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(CertType::RsaLink),
            2 => Some(CertType::RsaId),
            3 => Some(CertType::RsaAuth),
            4 => Some(CertType::Ed25519SigningKey),
            5 => Some(CertType::Ed25519TlsLink),
            6 => Some(CertType::Ed25519AuthKey),
            7 => Some(CertType::Ed25519Identity),
            _ => None,
        }
    }
}

/// Extension type carrying the key that signed a certificate
pub const EXT_SIGNED_WITH_ED25519_KEY: u8 = 4;

/// A certificate entry from a CERTS cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    /// Certificate type
    pub cert_type: u8,
    /// Raw certificate data
    pub data: Vec<u8>,
}

/// Certificate extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertExtension {
    pub ext_type: u8,
    pub flags: u8,
    pub data: Vec<u8>,
}

/// Parsed Ed25519 certificate (Tor's tor-cert format)
///
/// Format:
/// - VERSION (1 byte): Always 0x01
/// - CERT_TYPE (1 byte): Type of this certificate
/// - EXPIRATION (4 bytes): Hours since the Unix epoch
/// - CERT_KEY_TYPE (1 byte): Type of certified key
/// - CERTIFIED_KEY (32 bytes): The key being certified
/// - N_EXTENSIONS (1 byte): Number of extensions
/// - EXTENSIONS: ExtLen (2) | ExtType (1) | ExtFlags (1) | ExtData
/// - SIGNATURE (64 bytes): Ed25519 signature over all previous bytes
#[derive(Debug, Clone)]
pub struct Ed25519Certificate {
    /// Certificate version (always 0x01)
    pub version: u8,
    /// Certificate type
    pub cert_type: u8,
    /// Expiration time (hours since Unix epoch)
    pub expiration_hours: u32,
    /// Type of the certified key
    pub cert_key_type: u8,
    /// The key being certified (32 bytes)
    pub certified_key: [u8; 32],
    /// Extensions in wire order
    pub extensions: Vec<CertExtension>,
    /// Signed part (for signature verification)
    pub raw_data: Vec<u8>,
    /// Signature (64 bytes)
    pub signature: [u8; 64],
}

impl Ed25519Certificate {
    /// Parse an Ed25519 certificate from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let cert_err = |e: TorError| TorError::CertificateError(e.to_string());
        let mut reader = ByteReader::new(data);

        let version = reader.u8().map_err(cert_err)?;
        if version != 0x01 {
            return Err(TorError::CertificateError(format!(
                "Unknown certificate version: {}",
                version
            )));
        }

        let cert_type = reader.u8().map_err(cert_err)?;
        let expiration_hours = reader.u32().map_err(cert_err)?;
        let cert_key_type = reader.u8().map_err(cert_err)?;
        let certified_key = reader.array::<32>().map_err(cert_err)?;

        let n_extensions = reader.u8().map_err(cert_err)?;
        let mut extensions = Vec::with_capacity(n_extensions as usize);
        for _ in 0..n_extensions {
            let ext_len = reader.u16().map_err(cert_err)? as usize;
            let ext_type = reader.u8().map_err(cert_err)?;
            let flags = reader.u8().map_err(cert_err)?;
            let ext_data = reader.take(ext_len).map_err(cert_err)?.to_vec();
            extensions.push(CertExtension {
                ext_type,
                flags,
                data: ext_data,
            });
        }

        let sig_start = data.len() - reader.remaining();
        let signature = reader.array::<64>().map_err(cert_err)?;

        Ok(Self {
            version,
            cert_type,
            expiration_hours,
            cert_key_type,
            certified_key,
            extensions,
            raw_data: data[..sig_start].to_vec(),
            signature,
        })
    }

    /// Key from the `signed-with-ed25519-key` extension, if present
    pub fn signing_key_extension(&self) -> Option<[u8; 32]> {
        self.extensions
            .iter()
            .find(|e| e.ext_type == EXT_SIGNED_WITH_ED25519_KEY && e.data.len() == 32)
            .map(|e| {
                let mut key = [0u8; 32];
                key.copy_from_slice(&e.data);
                key
            })
    }

    /// Verify the certificate signature using the given signing key
    pub fn verify_signature(&self, signing_key: &[u8; 32]) -> Result<()> {
        let verifying_key = VerifyingKey::from_bytes(signing_key)
            .map_err(|e| TorError::CertificateError(format!("Invalid signing key: {}", e)))?;

        let signature = Signature::from_bytes(&self.signature);

        verifying_key
            .verify(&self.raw_data, &signature)
            .map_err(|e| {
                TorError::CertificateError(format!("Signature verification failed: {}", e))
            })
    }

    /// Check if certificate is expired at `now_hours` (hours since the epoch)
    pub fn is_expired_at(&self, now_hours: u32) -> bool {
        self.expiration_hours < now_hours
    }
}

/// Parsed CERTS cell
#[derive(Debug, Clone)]
pub struct CertsCell {
    /// All certificates in the cell
    pub certificates: Vec<Certificate>,
}

impl CertsCell {
    /// Parse a CERTS cell payload
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let n_certs = reader.u8()? as usize;
        let mut certificates = Vec::with_capacity(n_certs);

        for i in 0..n_certs {
            let cert_type = reader.u8()?;
            let cert_len = reader.u16()? as usize;
            let cert_data = reader.take(cert_len).map_err(|_| {
                TorError::ProtocolError(format!("CERTS cell truncated at certificate {}", i))
            })?;

            certificates.push(Certificate {
                cert_type,
                data: cert_data.to_vec(),
            });
        }

        Ok(Self { certificates })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.certificates.len() as u8];
        for cert in &self.certificates {
            out.push(cert.cert_type);
            out.extend_from_slice(&(cert.data.len() as u16).to_be_bytes());
            out.extend_from_slice(&cert.data);
        }
        out
    }

    /// Get certificate by type
    pub fn get_cert(&self, cert_type: CertType) -> Option<&Certificate> {
        self.certificates
            .iter()
            .find(|c| c.cert_type == cert_type as u8)
    }

    /// Verify the Ed25519 chain against the peer's TLS certificate (DER)
    ///
    /// Returns the relay's Ed25519 identity key on success.
    pub fn verify(&self, peer_tls_cert: &[u8]) -> Result<[u8; 32]> {
        log::debug!("🔐 Verifying relay certificates...");

        let signing_entry = self.get_cert(CertType::Ed25519SigningKey).ok_or_else(|| {
            TorError::CertificateError(
                "Missing Ed25519 signing key certificate (type 4)".into(),
            )
        })?;
        let signing_cert = Ed25519Certificate::parse(&signing_entry.data)?;

        let identity = signing_cert.signing_key_extension().ok_or_else(|| {
            TorError::CertificateError("Type 4 certificate has no signing key extension".into())
        })?;
        signing_cert.verify_signature(&identity)?;
        log::debug!("  ✅ Signing key certificate signature verified");

        let link_entry = self.get_cert(CertType::Ed25519TlsLink).ok_or_else(|| {
            TorError::CertificateError("Missing TLS link certificate (type 5)".into())
        })?;
        let link_cert = Ed25519Certificate::parse(&link_entry.data)?;
        link_cert.verify_signature(&signing_cert.certified_key)?;

        let tls_digest: [u8; 32] = Sha256::digest(peer_tls_cert).into();
        if link_cert.certified_key != tls_digest {
            return Err(TorError::CertificateError(
                "TLS link certificate does not match the peer certificate".into(),
            ));
        }
        log::debug!("  ✅ TLS link certificate matches peer");

        Ok(identity)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    pub(crate) fn make_cert(
        cert_type: u8,
        certified_key: [u8; 32],
        signer: &SigningKey,
        include_signer_ext: bool,
    ) -> Vec<u8> {
        let mut body = vec![1, cert_type];
        body.extend_from_slice(&u32::MAX.to_be_bytes());
        body.push(1);
        body.extend_from_slice(&certified_key);
        if include_signer_ext {
            body.push(1);
            body.extend_from_slice(&32u16.to_be_bytes());
            body.push(EXT_SIGNED_WITH_ED25519_KEY);
            body.push(0);
            body.extend_from_slice(signer.verifying_key().as_bytes());
        } else {
            body.push(0);
        }
        let sig = signer.sign(&body);
        body.extend_from_slice(&sig.to_bytes());
        body
    }

    pub(crate) fn chain(tls_cert: &[u8]) -> (CertsCell, SigningKey) {
        let identity = SigningKey::from_bytes(&[7u8; 32]);
        let signing = SigningKey::from_bytes(&[9u8; 32]);
        let type4 = make_cert(4, signing.verifying_key().to_bytes(), &identity, true);
        let tls_digest: [u8; 32] = Sha256::digest(tls_cert).into();
        let type5 = make_cert(5, tls_digest, &signing, false);
        let cell = CertsCell {
            certificates: vec![
                Certificate {
                    cert_type: 4,
                    data: type4,
                },
                Certificate {
                    cert_type: 5,
                    data: type5,
                },
            ],
        };
        (cell, identity)
    }

    #[test]
    fn test_parse_empty_certs_cell() {
        assert!(CertsCell::parse(&[]).is_err());
    }

    #[test]
    fn test_parse_certs_cell_zero_certs() {
        let cell = CertsCell::parse(&[0u8]).unwrap();
        assert_eq!(cell.certificates.len(), 0);
    }

    #[test]
    fn test_cert_type_parsing() {
        assert_eq!(CertType::from_u8(4), Some(CertType::Ed25519SigningKey));
        assert_eq!(CertType::from_u8(7), Some(CertType::Ed25519Identity));
        assert_eq!(CertType::from_u8(99), None);
    }

    #[test]
    fn test_valid_chain_verifies() {
        let tls_cert = b"fake DER certificate";
        let (cell, identity) = chain(tls_cert);
        let reparsed = CertsCell::parse(&cell.encode()).unwrap();
        let id = reparsed.verify(tls_cert).unwrap();
        assert_eq!(id, identity.verifying_key().to_bytes());
    }

    #[test]
    fn test_wrong_tls_cert_rejected() {
        let (cell, _) = chain(b"certificate A");
        let err = cell.verify(b"certificate B").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let tls_cert = b"der";
        let (mut cell, _) = chain(tls_cert);
        let data = &mut cell.certificates[0].data;
        data[10] ^= 0xFF;
        assert!(cell.verify(tls_cert).is_err());
    }

    #[test]
    fn test_missing_link_cert_rejected() {
        let (mut cell, _) = chain(b"der");
        cell.certificates.truncate(1);
        assert!(matches!(
            cell.verify(b"der"),
            Err(TorError::CertificateError(_))
        ));
    }
}
