//! The shared work item reconciling parallel decryption with in-order
//! delivery
//!
//! For every accepted transport datagram the receiver constructs one
//! [`InboundWork`] and enqueues the same `Arc` into the device-wide
//! decryption queue and the owning peer's inbound queue. A decryption
//! worker opens the payload in place and then releases the item's readiness
//! gate; the per-peer sequencer acquires the gate, which blocks until that
//! release, and so observes items strictly in arrival order regardless of
//! how the pool interleaved them.
//!
//! The gate is a zero-permit semaphore standing in for a mutex created in
//! the locked state: the constructor "holds" it, the decryption worker
//! "unlocks" by adding the single permit, the sequencer "locks" by
//! acquiring it. Eviction from a full queue also releases the gate after
//! marking the item dropped, so a sequencer waiting on an evicted item can
//! never hang.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::Semaphore;

use crate::crypto::KeyPair;

const STATE_OKAY: u8 = 0;
const STATE_DROPPED: u8 = 1;

/// Mutable contents of a work item.
///
/// The buffer holds the raw datagram on entry; after decryption the
/// plaintext occupies `packet[CONTENT_OFFSET..CONTENT_OFFSET +
/// plaintext_len]` of the same storage.
#[derive(Debug)]
pub struct WorkPayload {
    /// Datagram buffer, rewritten in place by decryption
    pub packet: Vec<u8>,
    /// Plaintext length after a successful open, zero for keep-alives
    pub plaintext_len: usize,
    /// Nonce counter extracted from the transport header
    pub counter: u64,
}

/// One in-flight transport packet, shared by the decryption pool and the
/// per-peer sequencer.
pub struct InboundWork {
    state: AtomicU8,
    ready: Semaphore,
    payload: Mutex<WorkPayload>,
    /// Session key pair the packet was addressed to; immutable
    pub key_pair: Arc<KeyPair>,
}

impl InboundWork {
    /// Construct a work item around a raw datagram, with the readiness gate
    /// held (zero permits).
    #[must_use]
    pub fn new(packet: Vec<u8>, key_pair: Arc<KeyPair>) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(STATE_OKAY),
            ready: Semaphore::new(0),
            payload: Mutex::new(WorkPayload {
                packet,
                plaintext_len: 0,
                counter: 0,
            }),
            key_pair,
        })
    }

    /// Mark the item dropped. Monotonic: there is no way back to okay.
    pub fn mark_dropped(&self) {
        self.state.store(STATE_DROPPED, Ordering::Release);
    }

    /// Whether the item has been dropped.
    #[must_use]
    pub fn is_dropped(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_DROPPED
    }

    /// Release the readiness gate, waking the sequencer if it is waiting.
    /// Called by the decryption worker in every outcome, and by queue
    /// eviction after [`Self::mark_dropped`].
    pub fn release(&self) {
        self.ready.add_permits(1);
    }

    /// Mark dropped and release the gate; the eviction path.
    pub fn drop_and_release(&self) {
        self.mark_dropped();
        self.release();
    }

    /// Wait until the decryption stage (or eviction) releases the item.
    pub async fn wait_ready(&self) {
        // The semaphore is never closed; an error here is unreachable.
        if let Ok(permit) = self.ready.acquire().await {
            permit.forget();
        }
    }

    /// Access the mutable payload. Uncontended by construction: the
    /// receiver fills it before publishing, the decryption worker owns it
    /// until release, the sequencer owns it after acquire.
    pub fn payload(&self) -> MutexGuard<'_, WorkPayload> {
        self.payload.lock()
    }
}

impl std::fmt::Debug for InboundWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundWork")
            .field("dropped", &self.is_dropped())
            .field("key_pair", &self.key_pair)
            .finish_non_exhaustive()
    }
}
