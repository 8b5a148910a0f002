//! Error types for rust-tunnel
//!
//! This module defines the error hierarchy for the tunnel daemon. All errors
//! are categorized by subsystem and include recovery hints. Inbound pipeline
//! stages never abort on these errors; they log and continue, so the
//! `is_recoverable` hints mostly matter to the supervisor in `main`.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for rust-tunnel
#[derive(Debug, Error)]
pub enum RustTunnelError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Device lifecycle errors (socket bind, spawn, shutdown)
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Protocol cryptography errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Wire format errors
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// TUN sink errors
    #[error("TUN error: {0}")]
    Tun(#[from] TunError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RustTunnelError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Device(e) => e.is_recoverable(),
            Self::Crypto(_) | Self::Message(_) => true,
            Self::Tun(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationError(reason.into())
    }
}

/// Device lifecycle errors
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Failed to bind the UDP socket
    #[error("Failed to bind UDP socket on {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// Socket handle is not installed (mid-rebind)
    #[error("UDP socket not ready")]
    SocketNotReady,

    /// Device already running
    #[error("Device is already running")]
    AlreadyRunning,

    /// No peer configured for a required operation
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// I/O error on the device socket
    #[error("Device I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl DeviceError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Bind { .. } | Self::AlreadyRunning => false,
            Self::SocketNotReady | Self::PeerNotFound(_) => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Bind {
            addr,
            reason: reason.into(),
        }
    }
}

/// Protocol cryptography errors
///
/// These all map to "drop the packet"; none of them is fatal to a pipeline
/// stage.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key material had the wrong length
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    /// AEAD open failed (authentication failure)
    #[error("AEAD decryption failed")]
    DecryptFailed,

    /// AEAD seal failed
    #[error("AEAD encryption failed")]
    EncryptFailed,

    /// Keyed MAC did not verify
    #[error("MAC verification failed")]
    MacFailed,

    /// Handshake message arrived in the wrong state
    #[error("Unexpected handshake state: {0}")]
    HandshakeState(String),

    /// Handshake timestamp not newer than the last accepted one
    #[error("Stale handshake timestamp")]
    StaleTimestamp,

    /// Unknown initiator identity
    #[error("Unknown peer public key")]
    UnknownPeer,
}

/// Wire format errors
#[derive(Debug, Error)]
pub enum MessageError {
    /// Packet shorter than the fixed size of its message type
    #[error("Message too short: expected {expected} bytes, got {got}")]
    TooShort { expected: usize, got: usize },

    /// Packet length does not match the fixed size of its message type
    #[error("Invalid message length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    /// First four bytes do not name a known message type
    #[error("Unknown message type: {0}")]
    UnknownType(u32),
}

/// TUN sink errors
#[derive(Debug, Error)]
pub enum TunError {
    /// Write to the TUN device failed
    #[error("TUN write failed: {0}")]
    WriteFailed(#[from] io::Error),

    /// The sink was closed (receiver side dropped)
    #[error("TUN sink closed")]
    Closed,
}

impl TunError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::WriteFailed(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            Self::Closed => false,
        }
    }
}
