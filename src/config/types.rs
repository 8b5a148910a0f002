//! Configuration types for rust-tunnel
//!
//! Configuration is loaded from JSON and validated at startup. Keys are
//! base64-encoded 32-byte x25519 keys, the encoding used by every tool in
//! this protocol family.

use std::net::SocketAddr;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Decode a base64 32-byte key.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] on bad base64 or wrong length.
pub fn decode_key(encoded: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| ConfigError::validation(format!("invalid base64 key: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| ConfigError::validation("key must decode to exactly 32 bytes"))
}

/// Encode a 32-byte key as base64.
#[must_use]
pub fn encode_key(key: &[u8; 32]) -> String {
    BASE64.encode(key)
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// UDP listen address
    pub listen_addr: SocketAddr,

    /// This device's static private key, base64
    pub private_key: String,

    /// Path to an already-configured TUN device node
    #[serde(default)]
    pub tun_path: Option<PathBuf>,

    /// Configured peers
    pub peers: Vec<PeerConfig>,

    /// Queue capacities and worker counts
    #[serde(default)]
    pub queues: QueueConfig,

    /// Protocol timers
    #[serde(default)]
    pub timers: TimerConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first
    /// problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        decode_key(&self.private_key)
            .map_err(|e| ConfigError::validation(format!("private_key: {e}")))?;

        if self.peers.is_empty() {
            return Err(ConfigError::validation(
                "at least one peer must be configured",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            let key = decode_key(&peer.public_key)
                .map_err(|e| ConfigError::validation(format!("peer public_key: {e}")))?;
            if !seen.insert(key) {
                return Err(ConfigError::validation(format!(
                    "duplicate peer public key: {}",
                    peer.public_key
                )));
            }
        }

        self.queues.validate()?;
        self.timers.validate()?;
        Ok(())
    }

    /// The decoded private key. Only valid after [`Self::validate`].
    ///
    /// A corrupt key at this point means validation was skipped; fall back
    /// to a zero key rather than panicking, which fails the handshake
    /// loudly but safely.
    #[must_use]
    pub fn private_key_bytes(&self) -> [u8; 32] {
        decode_key(&self.private_key).unwrap_or_default()
    }

    /// Generate an example configuration with a fresh identity.
    #[must_use]
    pub fn example() -> Self {
        let identity = crate::crypto::Identity::generate();
        let peer_identity = crate::crypto::Identity::generate();
        Self {
            listen_addr: "0.0.0.0:51820".parse().expect("static address"),
            private_key: encode_key(&identity.to_private_bytes()),
            tun_path: Some(PathBuf::from("/dev/net/tun0")),
            peers: vec![PeerConfig {
                public_key: encode_key(&peer_identity.public_bytes()),
                endpoint: Some("203.0.113.1:51820".parse().expect("static address")),
            }],
            queues: QueueConfig::default(),
            timers: TimerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// One configured peer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerConfig {
    /// The peer's static public key, base64
    pub public_key: String,

    /// Last known endpoint; learned from authenticated traffic when absent
    #[serde(default)]
    pub endpoint: Option<SocketAddr>,
}

impl PeerConfig {
    /// The decoded public key. Only valid after [`Config::validate`].
    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; 32] {
        decode_key(&self.public_key).unwrap_or_default()
    }
}

/// Queue capacities and worker counts
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Decryption queue capacity
    #[serde(default = "defaults::decryption_capacity")]
    pub decryption_capacity: usize,

    /// Per-peer inbound queue capacity
    #[serde(default = "defaults::inbound_capacity")]
    pub inbound_capacity: usize,

    /// TUN queue capacity
    #[serde(default = "defaults::tun_capacity")]
    pub tun_capacity: usize,

    /// Handshake queue capacity
    #[serde(default = "defaults::handshake_capacity")]
    pub handshake_capacity: usize,

    /// Handshake-queue occupancy above which MAC2 proof is demanded
    #[serde(default = "defaults::handshake_busy_size")]
    pub handshake_busy_size: usize,

    /// Decryption workers; 0 means one per CPU
    #[serde(default)]
    pub decryption_workers: usize,

    /// Handshake workers
    #[serde(default = "defaults::handshake_workers")]
    pub handshake_workers: usize,
}

impl QueueConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.decryption_capacity == 0
            || self.inbound_capacity == 0
            || self.tun_capacity == 0
            || self.handshake_capacity == 0
        {
            return Err(ConfigError::validation("queue capacities must be nonzero"));
        }
        if self.handshake_busy_size >= self.handshake_capacity {
            return Err(ConfigError::validation(
                "handshake_busy_size must be below handshake_capacity",
            ));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            decryption_capacity: defaults::decryption_capacity(),
            inbound_capacity: defaults::inbound_capacity(),
            tun_capacity: defaults::tun_capacity(),
            handshake_capacity: defaults::handshake_capacity(),
            handshake_busy_size: defaults::handshake_busy_size(),
            decryption_workers: 0,
            handshake_workers: defaults::handshake_workers(),
        }
    }
}

/// Protocol timers, in seconds
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct TimerConfig {
    /// Key pairs older than this reject all traffic
    #[serde(default = "defaults::reject_after_secs")]
    pub reject_after_secs: u64,

    /// Received traffic on an initiator pair older than this requests a
    /// rekey
    #[serde(default = "defaults::rekey_after_secs")]
    pub rekey_after_secs: u64,
}

impl TimerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.reject_after_secs == 0 {
            return Err(ConfigError::validation("reject_after_secs must be nonzero"));
        }
        if self.rekey_after_secs >= self.reject_after_secs {
            return Err(ConfigError::validation(
                "rekey_after_secs must be below reject_after_secs",
            ));
        }
        Ok(())
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            reject_after_secs: defaults::reject_after_secs(),
            rekey_after_secs: defaults::rekey_after_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

mod defaults {
    pub(super) fn decryption_capacity() -> usize {
        1024
    }
    pub(super) fn inbound_capacity() -> usize {
        1024
    }
    pub(super) fn tun_capacity() -> usize {
        1024
    }
    pub(super) fn handshake_capacity() -> usize {
        4096
    }
    pub(super) fn handshake_busy_size() -> usize {
        256
    }
    pub(super) fn handshake_workers() -> usize {
        2
    }
    pub(super) fn reject_after_secs() -> u64 {
        180
    }
    pub(super) fn rekey_after_secs() -> u64 {
        120
    }
    pub(super) fn log_level() -> String {
        "info".to_string()
    }
}
