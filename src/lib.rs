//! rust-tunnel: userspace point-to-point encrypted tunnel
//!
//! This crate implements the inbound data plane of a noise-style encrypted
//! tunnel: one process, one UDP socket, one TUN device. Authenticated UDP
//! datagrams become plaintext IP packets through a pipeline that decrypts
//! in parallel but delivers in per-peer order, with cookie-based DoS
//! resistance under handshake load.
//!
//! # Architecture
//!
//! ```text
//! UDP socket → Receiver → handshake queue → Handshake workers
//!                 |                              |
//!                 |  decryption queue            v
//!                 +---------→ Decryption pool   key pairs
//!                 |                .
//!                 |  per-peer queue. (readiness gate)
//!                 +---------→ Sequencer → TUN queue → TUN writer
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rust_tunnel::config::load_config;
//! use rust_tunnel::device::Device;
//! use rust_tunnel::tun::ChannelTun;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/rust-tunnel/config.json")?;
//! let (tun, mut packets) = ChannelTun::new(256);
//! let mut device = Device::new(&config, tun).await?;
//!
//! // Decrypted IP packets arrive on `packets`...
//!
//! device.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`crypto`]: Cookie MACs, session key pairs, handshake
//! - [`device`]: Device, peers, session index, task lifecycle
//! - [`error`]: Error types
//! - [`message`]: Wire formats
//! - [`receive`]: The inbound pipeline stages
//! - [`replay`]: Sliding-window replay filter
//! - [`tun`]: TUN sink abstraction

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod message;
pub mod receive;
pub mod replay;
pub mod tun;

// Re-export commonly used types at the crate root
pub use config::{load_config, load_config_str, load_config_with_env, Config, PeerConfig};
pub use crypto::{CookieChecker, CookieGenerator, Identity, KeyPair, SessionKeys};
pub use device::{Device, DeviceShared, Peer, PeerStats, SessionIndex};
pub use error::{
    ConfigError, CryptoError, DeviceError, MessageError, RustTunnelError, TunError,
};
pub use receive::{HandshakeWork, InboundWork, TunPacket};
pub use replay::ReplayFilter;
pub use tun::{ChannelTun, FileTun, TunSink};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
