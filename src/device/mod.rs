//! Device: the process-wide tunnel endpoint
//!
//! One [`Device`] owns the UDP socket, the configured peers, the session
//! index, and the pipeline tasks. Construction binds the socket and spawns
//! every stage; [`Device::shutdown`] broadcasts stop and joins them.
//!
//! # Task layout
//!
//! ```text
//!                    +-----------+
//!   UDP socket ----> | Receiver  | ---> handshake queue ---> Handshake workers
//!                    +-----------+                               |
//!                         |                                      v
//!                         |  decryption queue          key pairs + keep-alive
//!                         +------------------+
//!                         |                  v
//!                         |          Decryption pool (N)
//!                         |                  .
//!                         v                  .  releases readiness gates
//!                 per-peer inbound queue     .
//!                         |                  .
//!                         v                  v
//!                    Sequencer (per peer) ----> TUN queue ---> TUN writer
//! ```
//!
//! Shared state lives in [`DeviceShared`]; tasks hold an `Arc` each. Peers
//! do not hold a reference back to the device, so there are no `Arc`
//! cycles: operations that need both take the shared state as an argument.

pub mod peer;
pub mod session;

pub use peer::{Peer, PeerStats};
pub use session::{SessionEntry, SessionIndex};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto::{CookieChecker, Identity};
use crate::error::DeviceError;
use crate::receive;
use crate::receive::queue::{HandshakeQueue, InboundQueue, TunQueue};
use crate::tun::TunSink;

/// Runtime tunables derived from configuration.
#[derive(Debug, Clone, Copy)]
pub struct Tunables {
    /// Key pairs older than this reject all traffic
    pub reject_after: Duration,
    /// Received traffic on an initiator pair older than this requests a
    /// rekey
    pub rekey_after: Duration,
    /// Handshake-queue occupancy above which MAC2 proof is demanded
    pub handshake_busy_size: usize,
}

/// The bounded queues connecting pipeline stages.
pub struct DeviceQueues {
    /// Transport work awaiting the decryption pool
    pub decryption: InboundQueue,
    /// Handshake packets awaiting the handshake workers
    pub handshake: HandshakeQueue,
    /// Plaintext packets awaiting the TUN writer
    pub tun: TunQueue,
}

/// Device-wide counters, one writer per pipeline stage.
#[derive(Debug, Default)]
pub struct DeviceStats {
    datagrams_received: AtomicU64,
    transport_accepted: AtomicU64,
    handshakes_queued: AtomicU64,
    cookie_replies_sent: AtomicU64,
    dropped_invalid_mac: AtomicU64,
    dropped_unknown_session: AtomicU64,
    dropped_expired_key: AtomicU64,
    dropped_handshake_overflow: AtomicU64,
    decrypt_failures: AtomicU64,
    tun_writes: AtomicU64,
    tun_write_errors: AtomicU64,
    tun_packets_discarded: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $get:ident, $field:ident) => {
        pub(crate) fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        /// Current value of the counter.
        #[must_use]
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl DeviceStats {
    counter!(record_datagram, datagrams_received, datagrams_received);
    counter!(record_transport, transport_accepted, transport_accepted);
    counter!(record_handshake_queued, handshakes_queued, handshakes_queued);
    counter!(record_cookie_reply, cookie_replies_sent, cookie_replies_sent);
    counter!(record_invalid_mac, dropped_invalid_mac, dropped_invalid_mac);
    counter!(
        record_unknown_session,
        dropped_unknown_session,
        dropped_unknown_session
    );
    counter!(record_expired_key, dropped_expired_key, dropped_expired_key);
    counter!(
        record_handshake_overflow,
        dropped_handshake_overflow,
        dropped_handshake_overflow
    );
    counter!(record_decrypt_failure, decrypt_failures, decrypt_failures);
    counter!(record_tun_write, tun_writes, tun_writes);
    counter!(record_tun_write_error, tun_write_errors, tun_write_errors);
    counter!(
        record_tun_discard,
        tun_packets_discarded,
        tun_packets_discarded
    );
}

/// State shared by every pipeline task.
pub struct DeviceShared {
    tunables: Tunables,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    identity: Identity,
    /// MAC verification and cookie replies for inbound handshakes
    pub cookie_checker: CookieChecker,
    /// Receiver-id dispatch for transport packets
    pub sessions: SessionIndex,
    peers_by_key: DashMap<[u8; 32], Arc<Peer>>,
    handshake_indices: DashMap<u32, Arc<Peer>>,
    /// Stage-connecting queues
    pub queues: DeviceQueues,
    /// Device-wide counters
    pub stats: DeviceStats,
    stop: broadcast::Sender<()>,
}

impl DeviceShared {
    /// Runtime tunables.
    #[must_use]
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// The device's static identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Clone the socket handle out of its slot. `None` mid-rebind.
    #[must_use]
    pub fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.read().clone()
    }

    /// Install a (re)bound socket.
    pub fn install_socket(&self, socket: Arc<UdpSocket>) {
        *self.socket.write() = Some(socket);
    }

    /// Send a datagram through the current socket. The handle is cloned
    /// under the read lock, so a concurrent rebind cannot race the send.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::SocketNotReady`] with no socket installed, or
    /// the underlying I/O error.
    pub async fn send_to(&self, packet: &[u8], addr: SocketAddr) -> Result<usize, DeviceError> {
        let socket = self.socket().ok_or(DeviceError::SocketNotReady)?;
        Ok(socket.send_to(packet, addr).await?)
    }

    /// Look up a configured peer by its static public key.
    #[must_use]
    pub fn peer_by_key(&self, public_key: &[u8; 32]) -> Option<Arc<Peer>> {
        self.peers_by_key.get(public_key).map(|p| Arc::clone(&p))
    }

    /// Register a pending outbound handshake under a fresh index; the
    /// index routes the eventual response (and any cookie reply) back to
    /// the peer.
    pub fn register_handshake_index(&self, peer: &Arc<Peer>) -> u32 {
        loop {
            let candidate: u32 = rand::random();
            match self.handshake_indices.entry(candidate) {
                dashmap::mapref::entry::Entry::Occupied(_) => {}
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(peer));
                    return candidate;
                }
            }
        }
    }

    /// Resolve a pending handshake index.
    #[must_use]
    pub fn lookup_handshake_index(&self, index: u32) -> Option<Arc<Peer>> {
        self.handshake_indices.get(&index).map(|p| Arc::clone(&p))
    }

    /// Drop a pending handshake index once its exchange concludes.
    pub fn unregister_handshake_index(&self, index: u32) {
        self.handshake_indices.remove(&index);
    }

    /// Subscribe to the device-wide stop signal.
    #[must_use]
    pub fn subscribe_stop(&self) -> broadcast::Receiver<()> {
        self.stop.subscribe()
    }

    /// Broadcast stop to every task.
    pub fn stop(&self) {
        let _ = self.stop.send(());
    }
}

/// The tunnel device: socket, peers, and running pipeline tasks.
pub struct Device {
    shared: Arc<DeviceShared>,
    peers: Vec<Arc<Peer>>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl Device {
    /// Bind the socket, build peers from configuration, and spawn the
    /// whole inbound pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Bind`] if the UDP socket cannot be bound.
    /// Configuration is assumed validated; key decoding cannot fail here.
    pub async fn new(config: &Config, tun: Arc<dyn TunSink>) -> Result<Self, DeviceError> {
        let socket = UdpSocket::bind(config.listen_addr)
            .await
            .map_err(|e| DeviceError::bind(config.listen_addr, e.to_string()))?;
        let local_addr = socket.local_addr()?;

        let identity = Identity::from_private_bytes(config.private_key_bytes());
        let cookie_checker = CookieChecker::new(&identity.public_bytes());
        let (stop, _) = broadcast::channel(1);

        let shared = Arc::new(DeviceShared {
            tunables: Tunables {
                reject_after: Duration::from_secs(config.timers.reject_after_secs),
                rekey_after: Duration::from_secs(config.timers.rekey_after_secs),
                handshake_busy_size: config.queues.handshake_busy_size,
            },
            socket: RwLock::new(Some(Arc::new(socket))),
            identity,
            cookie_checker,
            sessions: SessionIndex::new(),
            peers_by_key: DashMap::new(),
            handshake_indices: DashMap::new(),
            queues: DeviceQueues {
                decryption: InboundQueue::new(config.queues.decryption_capacity),
                handshake: HandshakeQueue::new(config.queues.handshake_capacity),
                tun: TunQueue::new(config.queues.tun_capacity),
            },
            stats: DeviceStats::default(),
            stop,
        });

        let mut peers = Vec::with_capacity(config.peers.len());
        for peer_config in &config.peers {
            let peer = Arc::new(Peer::new(
                peer_config.public_key_bytes(),
                peer_config.endpoint,
                config.queues.inbound_capacity,
            ));
            shared
                .peers_by_key
                .insert(peer.public_key, Arc::clone(&peer));
            peers.push(peer);
        }

        let decryption_workers = match config.queues.decryption_workers {
            0 => num_cpus::get(),
            n => n,
        };
        let handshake_workers = config.queues.handshake_workers.max(1);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(receive::receiver::run(Arc::clone(&shared))));
        for worker_id in 0..handshake_workers {
            tasks.push(tokio::spawn(receive::handshake_worker::run(
                Arc::clone(&shared),
                worker_id,
            )));
        }
        for worker_id in 0..decryption_workers {
            tasks.push(tokio::spawn(receive::decrypt::run(
                Arc::clone(&shared),
                worker_id,
            )));
        }
        for peer in &peers {
            tasks.push(tokio::spawn(receive::sequencer::run(
                Arc::clone(&shared),
                Arc::clone(peer),
            )));
            tasks.push(tokio::spawn(run_rekey_driver(
                Arc::clone(&shared),
                Arc::clone(peer),
            )));
        }
        tasks.push(tokio::spawn(receive::tun_writer::run(
            Arc::clone(&shared),
            tun,
        )));

        info!(
            %local_addr,
            peers = peers.len(),
            decryption_workers,
            handshake_workers,
            "device started"
        );

        Ok(Self {
            shared,
            peers,
            tasks,
            local_addr,
        })
    }

    /// Shared pipeline state.
    #[must_use]
    pub fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    /// Configured peers, in configuration order.
    #[must_use]
    pub fn peers(&self) -> &[Arc<Peer>] {
        &self.peers
    }

    /// The bound socket address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Broadcast stop and join every task. Tasks that fail to exit within
    /// a second are abandoned with a warning.
    pub async fn shutdown(&mut self) {
        debug!("shutting down device");
        self.shared.stop();
        for peer in &self.peers {
            peer.stop();
        }
        for (index, task) in self.tasks.drain(..).enumerate() {
            match tokio::time::timeout(Duration::from_secs(1), task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = index, "task panicked: {e}"),
                Err(_) => warn!(task = index, "task did not stop within 1s"),
            }
        }
        info!("device stopped");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Best effort if shutdown() was never awaited.
        self.shared.stop();
        for peer in &self.peers {
            peer.stop();
        }
    }
}

/// Pause between rekey initiations, so a burst of aged packets produces
/// one handshake attempt, not one per packet.
const REKEY_COOLDOWN: Duration = Duration::from_secs(5);

/// Answer the peer's coalescing rekey signal with a fresh handshake
/// initiation toward its last known endpoint.
async fn run_rekey_driver(shared: Arc<DeviceShared>, peer: Arc<Peer>) {
    let mut stop = peer.subscribe_stop();
    let mut device_stop = shared.subscribe_stop();
    debug!("rekey driver started");

    loop {
        tokio::select! {
            biased;
            _ = stop.recv() => break,
            _ = device_stop.recv() => break,
            () = peer.rekey_signal().notified() => {}
        }

        let Some(endpoint) = peer.endpoint() else {
            continue;
        };
        match peer.begin_initiation(&shared) {
            Ok(packet) => match shared.send_to(&packet, endpoint).await {
                Ok(_) => debug!(%endpoint, "sent rekey initiation"),
                Err(e) => debug!(%endpoint, "failed to send rekey initiation: {e}"),
            },
            Err(e) => warn!("failed to create rekey initiation: {e}"),
        }

        tokio::select! {
            biased;
            _ = stop.recv() => break,
            _ = device_stop.recv() => break,
            () = tokio::time::sleep(REKEY_COOLDOWN) => {}
        }
    }
    debug!("rekey driver stopped");
}
