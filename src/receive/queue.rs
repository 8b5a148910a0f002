//! Bounded queues connecting the pipeline stages
//!
//! All queues are fixed-capacity MPMC rings (`crossbeam_queue::ArrayQueue`)
//! paired with a counting semaphore that wakes async consumers. Producers
//! never block:
//!
//! - [`InboundQueue`] (decryption queue, per-peer inbound queues) evicts
//!   the oldest element under overload, marking it dropped and releasing
//!   its readiness gate so the sequencer cannot hang on it. The newest
//!   packet always wins.
//! - [`TunQueue`] evicts the oldest plaintext packet outright.
//! - [`HandshakeQueue`] rejects the incoming element instead: admitted
//!   handshake work is never discarded, and its occupancy doubles as the
//!   load signal for cookie-based admission control.
//!
//! Eviction can leave the semaphore holding more permits than the ring has
//! elements; consumers treat an acquired permit as a hint and simply retry
//! when the ring turns out to be empty.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use tokio::sync::Semaphore;

use super::inbound::InboundWork;
use crate::message::TRANSPORT_OFFSET_CONTENT;

/// Handshake packet handed from the receiver to a handshake worker.
#[derive(Debug)]
pub struct HandshakeWork {
    /// Message type (initiation or response)
    pub msg_type: u32,
    /// The raw datagram
    pub packet: Vec<u8>,
    /// Source address of the datagram
    pub source: std::net::SocketAddr,
}

/// A decrypted plaintext packet on its way to the TUN device.
///
/// The buffer is the original datagram storage; the plaintext is a window
/// into it, so ownership of the buffer travels with the packet.
#[derive(Debug)]
pub struct TunPacket {
    buf: Vec<u8>,
    offset: usize,
    len: usize,
}

impl TunPacket {
    /// Wrap a decrypted work buffer whose plaintext spans
    /// `[TRANSPORT_OFFSET_CONTENT .. TRANSPORT_OFFSET_CONTENT + len]`.
    #[must_use]
    pub fn from_work_buffer(buf: Vec<u8>, len: usize) -> Self {
        Self {
            buf,
            offset: TRANSPORT_OFFSET_CONTENT,
            len,
        }
    }

    /// The plaintext bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf[self.offset..self.offset + self.len]
    }

    /// Plaintext length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the plaintext is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Bounded drop-oldest queue of in-flight transport work.
pub struct InboundQueue {
    items: ArrayQueue<Arc<InboundWork>>,
    ready: Semaphore,
}

impl InboundQueue {
    /// Create a queue holding at most `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity),
            ready: Semaphore::new(0),
        }
    }

    /// Insert a work item, evicting the oldest under overload. Never
    /// blocks; the evicted item is marked dropped and its gate released.
    pub fn push(&self, work: Arc<InboundWork>) {
        let mut work = work;
        loop {
            match self.items.push(work) {
                Ok(()) => {
                    self.ready.add_permits(1);
                    return;
                }
                Err(rejected) => {
                    if let Some(oldest) = self.items.pop() {
                        oldest.drop_and_release();
                    }
                    work = rejected;
                }
            }
        }
    }

    /// Wait for and remove the oldest item.
    pub async fn pop(&self) -> Arc<InboundWork> {
        loop {
            // Never closed; acquire cannot fail.
            if let Ok(permit) = self.ready.acquire().await {
                permit.forget();
            }
            // A stale permit from an eviction finds the ring empty; retry.
            if let Some(work) = self.items.pop() {
                return work;
            }
        }
    }

    /// Current occupancy.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Bounded drop-oldest queue of plaintext packets awaiting the TUN writer.
pub struct TunQueue {
    items: ArrayQueue<TunPacket>,
    ready: Semaphore,
}

impl TunQueue {
    /// Create a queue holding at most `capacity` packets.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity),
            ready: Semaphore::new(0),
        }
    }

    /// Insert a packet, evicting the oldest under overload. Returns the
    /// number of packets discarded (zero or one).
    pub fn push(&self, packet: TunPacket) -> usize {
        let mut packet = packet;
        let mut evicted = 0;
        loop {
            match self.items.push(packet) {
                Ok(()) => {
                    self.ready.add_permits(1);
                    return evicted;
                }
                Err(rejected) => {
                    if self.items.pop().is_some() {
                        evicted += 1;
                    }
                    packet = rejected;
                }
            }
        }
    }

    /// Wait for and remove the oldest packet.
    pub async fn pop(&self) -> TunPacket {
        loop {
            if let Ok(permit) = self.ready.acquire().await {
                permit.forget();
            }
            if let Some(packet) = self.items.pop() {
                return packet;
            }
        }
    }

    /// Current occupancy.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Bounded queue of handshake work with reject-newest overflow.
pub struct HandshakeQueue {
    items: ArrayQueue<HandshakeWork>,
    ready: Semaphore,
}

impl HandshakeQueue {
    /// Create a queue holding at most `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity),
            ready: Semaphore::new(0),
        }
    }

    /// Insert handshake work. Returns the rejected work if the queue is
    /// full; queued work is never evicted.
    ///
    /// # Errors
    ///
    /// Returns `Err(work)` when the queue is at capacity.
    pub fn push(&self, work: HandshakeWork) -> Result<(), HandshakeWork> {
        self.items.push(work)?;
        self.ready.add_permits(1);
        Ok(())
    }

    /// Wait for and remove the oldest item.
    pub async fn pop(&self) -> HandshakeWork {
        loop {
            if let Ok(permit) = self.ready.acquire().await {
                permit.forget();
            }
            if let Some(work) = self.items.pop() {
                return work;
            }
        }
    }

    /// Current occupancy; the "device busy" signal for admission control.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
