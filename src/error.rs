//! Error types for the onion client
//!
//! This module provides the error taxonomy shared by every layer:
//! - Protocol violations (fatal to the circuit they occur on)
//! - Handshake failures (fatal to the hop being negotiated)
//! - Resource exhaustion (retryable by the path-selection caller)
//! - Transport failures (fatal to the connection and its circuits)
//!
//! Cryptographic verification never produces an error directly: handshakes
//! return `None` and the circuit layer turns that into [`TorError::HandshakeFailed`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Connection errors (1xx)
    ConnectionFailed = 100,
    ConnectionTimeout = 101,
    ConnectionClosed = 102,

    // Protocol errors (2xx)
    ProtocolViolation = 200,
    UnexpectedCell = 201,
    DigestMismatch = 202,
    HandshakeFailed = 203,
    UnknownCommand = 204,

    // Circuit errors (3xx)
    CircuitBuildFailed = 300,
    CircuitDestroyed = 301,
    StreamFailed = 302,

    // Security errors (4xx) - FATAL
    CertificateError = 400,

    // Cryptographic errors (5xx)
    CryptoError = 500,

    // Path selection errors (6xx)
    NoRelaysAvailable = 600,

    // Storage errors (7xx)
    StorageError = 700,

    // Configuration errors (8xx)
    ConfigError = 800,
    InvalidRelay = 801,
    InvalidAddress = 802,

    // Internal errors (9xx)
    InternalError = 900,
}

/// Main error type for the onion client
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Connection Errors =====
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Connection closed")]
    ConnectionClosed,

    // ===== Protocol Errors =====
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Unknown cell command: {0}")]
    UnknownCommand(u8),

    #[error("Unknown relay command: {0}")]
    UnknownRelayCommand(u8),

    #[error("Unexpected cell: expected {expected}, got {got}")]
    UnexpectedCell { expected: String, got: String },

    #[error("Digest mismatch in relay cell")]
    DigestMismatch,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    // ===== Circuit Errors =====
    #[error("Circuit build failed: {0}")]
    CircuitBuildFailed(String),

    #[error("Circuit destroyed: reason={reason} ({reason_name})")]
    CircuitDestroyed { reason: u8, reason_name: String },

    #[error("Stream {stream_id} ended: reason={reason} ({reason_name})")]
    StreamEnded {
        stream_id: u16,
        reason: u8,
        reason_name: String,
    },

    #[error("Stream error: {0}")]
    Stream(String),

    // ===== Security Errors (FATAL) =====
    #[error("Certificate verification failed: {0}")]
    CertificateError(String),

    // ===== Cryptographic Errors =====
    #[error("Crypto: {0}")]
    Crypto(String),

    // ===== Path Selection Errors =====
    #[error("No relays available: {0}")]
    NoRelaysAvailable(String),

    // ===== Storage Errors =====
    #[error("Storage error: {0}")]
    Storage(String),

    // ===== Configuration Errors =====
    #[error("Invalid relay: {0}")]
    InvalidRelay(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid onion address: {0}")]
    InvalidAddress(String),

    // ===== Network Errors =====
    #[error("Network error: {0}")]
    Network(String),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl TorError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            // Connection
            TorError::ConnectionFailed(_) | TorError::Network(_) => ErrorCode::ConnectionFailed,
            TorError::Timeout(_) => ErrorCode::ConnectionTimeout,
            TorError::ConnectionClosed => ErrorCode::ConnectionClosed,

            // Protocol
            TorError::ProtocolError(_) => ErrorCode::ProtocolViolation,
            TorError::UnknownCommand(_) | TorError::UnknownRelayCommand(_) => {
                ErrorCode::UnknownCommand
            }
            TorError::UnexpectedCell { .. } => ErrorCode::UnexpectedCell,
            TorError::DigestMismatch => ErrorCode::DigestMismatch,
            TorError::HandshakeFailed(_) => ErrorCode::HandshakeFailed,

            // Circuit
            TorError::CircuitBuildFailed(_) => ErrorCode::CircuitBuildFailed,
            TorError::CircuitDestroyed { .. } => ErrorCode::CircuitDestroyed,
            TorError::StreamEnded { .. } | TorError::Stream(_) => ErrorCode::StreamFailed,

            // Security (fatal)
            TorError::CertificateError(_) => ErrorCode::CertificateError,

            TorError::Crypto(_) => ErrorCode::CryptoError,
            TorError::NoRelaysAvailable(_) => ErrorCode::NoRelaysAvailable,
            TorError::Storage(_) => ErrorCode::StorageError,

            // Config
            TorError::InvalidRelay(_) => ErrorCode::InvalidRelay,
            TorError::Config(_) => ErrorCode::ConfigError,
            TorError::InvalidAddress(_) => ErrorCode::InvalidAddress,

            // Internal
            TorError::Internal(_) | TorError::InvalidState(_) => ErrorCode::InternalError,
        }
    }

    /// Whether this error is a protocol violation
    ///
    /// Protocol violations destroy the circuit they were detected on.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TorError::ProtocolError(_)
                | TorError::UnknownCommand(_)
                | TorError::UnknownRelayCommand(_)
                | TorError::UnexpectedCell { .. }
                | TorError::DigestMismatch
        )
    }

    /// Whether this error is fatal (the relay cannot be trusted)
    pub fn is_fatal(&self) -> bool {
        matches!(self, TorError::CertificateError(_))
    }

    /// Whether this error can be retried with different relays
    ///
    /// Retryable errors are typically transient network or relay issues.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorError::ConnectionFailed(_)
                | TorError::Timeout(_)
                | TorError::ConnectionClosed
                | TorError::CircuitBuildFailed(_)
                | TorError::CircuitDestroyed { .. }
                | TorError::Network(_)
                | TorError::HandshakeFailed(_)
                | TorError::NoRelaysAvailable(_)
        )
    }

    /// Create a CircuitDestroyed error with the reason name
    pub fn circuit_destroyed(reason: u8) -> Self {
        let reason_name = match reason {
            0 => "NONE",
            1 => "PROTOCOL",
            2 => "INTERNAL",
            3 => "REQUESTED",
            4 => "HIBERNATING",
            5 => "RESOURCELIMIT",
            6 => "CONNECTFAILED",
            7 => "OR_IDENTITY",
            8 => "CHANNEL_CLOSED",
            9 => "FINISHED",
            10 => "TIMEOUT",
            11 => "DESTROYED",
            12 => "NOSUCHSERVICE",
            _ => "UNKNOWN",
        }
        .to_string();

        TorError::CircuitDestroyed {
            reason,
            reason_name,
        }
    }

    /// Create a StreamEnded error with the END reason name
    pub fn stream_ended(stream_id: u16, reason: u8) -> Self {
        let reason_name = match reason {
            1 => "MISC",
            2 => "RESOLVEFAILED",
            3 => "CONNECTREFUSED",
            4 => "EXITPOLICY",
            5 => "DESTROY",
            6 => "DONE",
            7 => "TIMEOUT",
            8 => "NOROUTE",
            9 => "HIBERNATING",
            10 => "INTERNAL",
            11 => "RESOURCELIMIT",
            12 => "CONNRESET",
            13 => "TORPROTOCOL",
            14 => "NOTDIRECTORY",
            _ => "UNKNOWN",
        }
        .to_string();

        TorError::StreamEnded {
            stream_id,
            reason,
            reason_name,
        }
    }
}

impl From<std::io::Error> for TorError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => TorError::ConnectionClosed,
            _ => TorError::Network(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TorError {
    fn from(err: serde_json::Error) -> Self {
        TorError::Storage(format!("JSON: {}", err))
    }
}
