//! Peer state: endpoint, key pair slots, handshake progress, signals
//!
//! One [`Peer`] per configured remote. The peer owns the bounded inbound
//! queue its sequencer drains, the two key-pair slots (current and
//! previous) that rotation cycles through, the pending handshake state,
//! and the cookie generator used when this device talks to the remote.
//!
//! Handshake completion is signaled through a `watch` channel
//! (level-triggered and coalescing, late subscribers see the latest
//! value); the rekey request is a `Notify` (at most one pending wakeup no
//! matter how many packets trigger it).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, trace};

use super::session::{SessionEntry, SessionIndex};
use super::DeviceShared;
use crate::crypto::handshake::{self, HandshakeState};
use crate::crypto::{CookieGenerator, KeyPair, SessionKeys};
use crate::error::{CryptoError, DeviceError};
use crate::message::TIMESTAMP_SIZE;
use crate::receive::queue::InboundQueue;

/// Per-peer counters, updated by the pipeline stages.
#[derive(Debug, Default)]
pub struct PeerStats {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    keepalives_received: AtomicU64,
    replays_dropped: AtomicU64,
    handshakes_completed: AtomicU64,
}

impl PeerStats {
    pub(crate) fn record_data(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_keepalive(&self) {
        self.keepalives_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replay(&self) {
        self.replays_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handshake(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Packets delivered toward the TUN device.
    #[must_use]
    pub fn rx_packets(&self) -> u64 {
        self.rx_packets.load(Ordering::Relaxed)
    }

    /// Plaintext bytes delivered toward the TUN device.
    #[must_use]
    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    /// Keep-alives consumed.
    #[must_use]
    pub fn keepalives_received(&self) -> u64 {
        self.keepalives_received.load(Ordering::Relaxed)
    }

    /// Packets rejected by the replay window.
    #[must_use]
    pub fn replays_dropped(&self) -> u64 {
        self.replays_dropped.load(Ordering::Relaxed)
    }

    /// Completed handshakes.
    #[must_use]
    pub fn handshakes_completed(&self) -> u64 {
        self.handshakes_completed.load(Ordering::Relaxed)
    }
}

/// Liveness timestamps maintained by the sequencer.
#[derive(Debug, Default)]
struct TimerState {
    last_data_received: Option<Instant>,
    last_keepalive_received: Option<Instant>,
    last_handshake_completed: Option<Instant>,
}

/// Current and previous key pairs. The previous pair keeps decrypting
/// in-flight traffic for a grace period after rotation.
#[derive(Default)]
struct KeyPairSlots {
    current: Option<Arc<KeyPair>>,
    previous: Option<Arc<KeyPair>>,
}

/// A configured remote peer.
pub struct Peer {
    /// The peer's static public key
    pub public_key: [u8; 32],
    endpoint: RwLock<Option<SocketAddr>>,
    inbound: InboundQueue,
    keypairs: Mutex<KeyPairSlots>,
    pub(crate) handshake: Mutex<HandshakeState>,
    greatest_timestamp: Mutex<Option<[u8; TIMESTAMP_SIZE]>>,
    cookies: CookieGenerator,
    handshake_completed: watch::Sender<u64>,
    rekey_needed: Notify,
    timers: RwLock<TimerState>,
    stats: PeerStats,
    stop: broadcast::Sender<()>,
}

impl Peer {
    /// Create a peer for `public_key`, optionally with a known endpoint.
    #[must_use]
    pub fn new(public_key: [u8; 32], endpoint: Option<SocketAddr>, inbound_capacity: usize) -> Self {
        let (handshake_completed, _) = watch::channel(0);
        let (stop, _) = broadcast::channel(1);
        Self {
            public_key,
            endpoint: RwLock::new(endpoint),
            inbound: InboundQueue::new(inbound_capacity),
            keypairs: Mutex::new(KeyPairSlots::default()),
            handshake: Mutex::new(HandshakeState::Idle),
            greatest_timestamp: Mutex::new(None),
            cookies: CookieGenerator::new(&public_key),
            handshake_completed,
            rekey_needed: Notify::new(),
            timers: RwLock::new(TimerState::default()),
            stats: PeerStats::default(),
            stop,
        }
    }

    /// Last known remote endpoint.
    #[must_use]
    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.read()
    }

    /// Update the remote endpoint (roaming: the latest authenticated
    /// source address wins).
    pub fn set_endpoint(&self, addr: SocketAddr) {
        *self.endpoint.write() = Some(addr);
    }

    /// Cookie state for messages this device sends to the peer.
    #[must_use]
    pub fn cookies(&self) -> &CookieGenerator {
        &self.cookies
    }

    /// The bounded queue the receiver fills and the sequencer drains.
    pub(crate) fn inbound(&self) -> &InboundQueue {
        &self.inbound
    }

    /// Counters for this peer.
    #[must_use]
    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    /// The active key pair, if a handshake has completed.
    #[must_use]
    pub fn current_key_pair(&self) -> Option<Arc<KeyPair>> {
        self.keypairs.lock().current.clone()
    }

    /// Install a freshly derived key pair: registers it in the session
    /// index under the handshake-agreed receiver id, rotates current to
    /// previous, and retires the pair that falls off the end.
    pub fn install_key_pair(
        self: &Arc<Self>,
        sessions: &SessionIndex,
        keys: &SessionKeys,
        initiator: bool,
    ) -> Arc<KeyPair> {
        let key_pair = Arc::new(KeyPair::new(
            &keys.receive,
            &keys.send,
            keys.local_index,
            keys.remote_index,
            initiator,
        ));
        sessions.insert(
            keys.local_index,
            SessionEntry {
                peer: Arc::clone(self),
                key_pair: Arc::clone(&key_pair),
            },
        );

        let mut slots = self.keypairs.lock();
        if let Some(retired) = slots.previous.take() {
            sessions.remove(retired.local_index);
            trace!(index = retired.local_index, "retired key pair");
        }
        slots.previous = slots.current.take();
        slots.current = Some(Arc::clone(&key_pair));
        debug!(index = keys.local_index, initiator, "installed key pair");
        key_pair
    }

    /// Accept an initiation timestamp only if it is strictly newer than the
    /// last accepted one; this is what stops initiation replay.
    #[must_use]
    pub fn check_initiation_timestamp(&self, timestamp: [u8; TIMESTAMP_SIZE]) -> bool {
        let mut greatest = self.greatest_timestamp.lock();
        match *greatest {
            Some(seen) if timestamp <= seen => false,
            _ => {
                *greatest = Some(timestamp);
                true
            }
        }
    }

    /// Subscribe to handshake completions. The channel is level-triggered
    /// and coalescing: the value is a completion count, and a subscriber
    /// that misses intermediate values still observes the latest.
    #[must_use]
    pub fn subscribe_handshake_completed(&self) -> watch::Receiver<u64> {
        self.handshake_completed.subscribe()
    }

    /// Fire the handshake-completed signal and update liveness state.
    pub fn notify_handshake_completed(&self) {
        self.timers.write().last_handshake_completed = Some(Instant::now());
        self.stats.record_handshake();
        self.handshake_completed.send_modify(|count| *count += 1);
    }

    /// The coalescing rekey request signal. The outbound handshake driver
    /// waits on this; the sequencer fires it when received traffic crosses
    /// the rekey threshold.
    #[must_use]
    pub fn rekey_signal(&self) -> &Notify {
        &self.rekey_needed
    }

    /// Request a rekey. Repeated requests before the driver wakes coalesce
    /// into one.
    pub fn request_rekey(&self) {
        self.rekey_needed.notify_one();
    }

    pub(crate) fn record_data_received(&self) {
        self.timers.write().last_data_received = Some(Instant::now());
    }

    pub(crate) fn record_keepalive_received(&self) {
        let mut timers = self.timers.write();
        let now = Instant::now();
        timers.last_data_received = Some(now);
        timers.last_keepalive_received = Some(now);
    }

    /// When traffic (including keep-alives) last arrived from this peer.
    #[must_use]
    pub fn last_data_received(&self) -> Option<Instant> {
        self.timers.read().last_data_received
    }

    /// When a keep-alive last arrived from this peer.
    #[must_use]
    pub fn last_keepalive_received(&self) -> Option<Instant> {
        self.timers.read().last_keepalive_received
    }

    /// When a handshake last completed with this peer.
    #[must_use]
    pub fn last_handshake_completed(&self) -> Option<Instant> {
        self.timers.read().last_handshake_completed
    }

    /// Subscribe to this peer's stop signal.
    #[must_use]
    pub fn subscribe_stop(&self) -> broadcast::Receiver<()> {
        self.stop.subscribe()
    }

    /// Stop this peer's sequencer.
    pub fn stop(&self) {
        let _ = self.stop.send(());
    }

    /// Send an authenticated empty transport packet so NAT mappings exist
    /// before user traffic flows.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::PeerNotFound`] when no key pair or endpoint
    /// is established, or an I/O error from the socket.
    pub async fn send_keepalive(&self, shared: &DeviceShared) -> Result<(), DeviceError> {
        let Some(key_pair) = self.current_key_pair() else {
            return Err(DeviceError::PeerNotFound("no key pair".into()));
        };
        let Some(endpoint) = self.endpoint() else {
            return Err(DeviceError::PeerNotFound("no endpoint".into()));
        };
        let packet = key_pair
            .seal_transport(&[])
            .map_err(|_| DeviceError::PeerNotFound("seal failed".into()))?;
        shared.send_to(&packet, endpoint).await?;
        trace!(peer = ?endpoint, "sent keep-alive");
        Ok(())
    }

    /// Create, register and seal a handshake initiation for this peer. The
    /// caller sends the returned datagram; the pending state consumes the
    /// eventual response. Used by the rekey driver and on startup.
    ///
    /// # Errors
    ///
    /// Returns a [`CryptoError`] if sealing any handshake field fails.
    pub fn begin_initiation(
        self: &Arc<Self>,
        shared: &DeviceShared,
    ) -> Result<Vec<u8>, CryptoError> {
        let local_index = shared.register_handshake_index(self);
        let (msg, state) = handshake::create_initiation(
            shared.identity(),
            &self.public_key,
            local_index,
        )?;

        // A new attempt supersedes any unanswered one; drop its index.
        let previous = std::mem::replace(&mut *self.handshake.lock(), state);
        if let HandshakeState::InitiationSent {
            local_index: stale, ..
        } = previous
        {
            shared.unregister_handshake_index(stale);
        }

        let mut packet = msg.encode().to_vec();
        self.cookies.seal_macs(&mut packet);
        Ok(packet)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("endpoint", &self.endpoint())
            .field("inbound_len", &self.inbound.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys(local_index: u32) -> SessionKeys {
        SessionKeys {
            receive: [1u8; 32],
            send: [2u8; 32],
            local_index,
            remote_index: 500,
        }
    }

    #[test]
    fn test_install_rotates_slots() {
        let sessions = SessionIndex::new();
        let peer = Arc::new(Peer::new([3u8; 32], None, 16));

        let first = peer.install_key_pair(&sessions, &test_keys(10), true);
        assert_eq!(sessions.len(), 1);
        assert_eq!(peer.current_key_pair().unwrap().local_index, first.local_index);

        let second = peer.install_key_pair(&sessions, &test_keys(11), true);
        // Both current and previous stay addressable.
        assert_eq!(sessions.len(), 2);

        let third = peer.install_key_pair(&sessions, &test_keys(12), true);
        // The first pair fell off the end and was retired.
        assert_eq!(sessions.len(), 2);
        assert!(sessions.lookup(first.local_index).is_none());
        assert!(sessions.lookup(second.local_index).is_some());
        assert_eq!(
            peer.current_key_pair().unwrap().local_index,
            third.local_index
        );
    }

    #[test]
    fn test_initiation_timestamp_monotonic() {
        let peer = Peer::new([3u8; 32], None, 16);
        let older = [0u8; TIMESTAMP_SIZE];
        let mut newer = [0u8; TIMESTAMP_SIZE];
        newer[7] = 1;

        assert!(peer.check_initiation_timestamp(newer));
        assert!(!peer.check_initiation_timestamp(newer));
        assert!(!peer.check_initiation_timestamp(older));
    }

    #[tokio::test]
    async fn test_handshake_completed_signal_coalesces() {
        let peer = Peer::new([3u8; 32], None, 16);
        let mut rx = peer.subscribe_handshake_completed();
        assert_eq!(*rx.borrow(), 0);

        peer.notify_handshake_completed();
        peer.notify_handshake_completed();

        rx.changed().await.unwrap();
        // Two completions coalesce into the latest value.
        assert_eq!(*rx.borrow_and_update(), 2);
        assert_eq!(peer.stats().handshakes_completed(), 2);
    }

    #[tokio::test]
    async fn test_rekey_signal_coalesces() {
        let peer = Peer::new([3u8; 32], None, 16);
        peer.request_rekey();
        peer.request_rekey();
        // One stored wakeup regardless of how many requests fired.
        peer.rekey_signal().notified().await;
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            peer.rekey_signal().notified(),
        )
        .await;
        assert!(pending.is_err());
    }

    #[test]
    fn test_endpoint_roaming() {
        let peer = Peer::new([3u8; 32], None, 16);
        assert!(peer.endpoint().is_none());
        let addr: SocketAddr = "203.0.113.5:51820".parse().unwrap();
        peer.set_endpoint(addr);
        assert_eq!(peer.endpoint(), Some(addr));
    }
}
