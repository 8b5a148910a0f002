//! Decryption pool: parallel AEAD open
//!
//! N workers drain the device-wide decryption queue. Each worker opens the
//! payload in place, overwriting the ciphertext region of the datagram
//! buffer with plaintext, records the wire counter, and releases the work
//! item's readiness gate. Authentication failure marks the item dropped;
//! the gate is released in every outcome so the sequencer never waits on a
//! finished item.
//!
//! The pool preserves no ordering. Cross-peer reordering is irrelevant and
//! per-peer order is reimposed by the sequencer.

use std::sync::Arc;

use tracing::debug;

use crate::device::DeviceShared;
use crate::message::{read_u64_le, TRANSPORT_OFFSET_CONTENT, TRANSPORT_OFFSET_COUNTER};

/// Run one decryption worker until the device stops.
pub(crate) async fn run(shared: Arc<DeviceShared>, worker_id: usize) {
    let mut stop = shared.subscribe_stop();
    debug!(worker = worker_id, "decryption worker started");

    loop {
        let work = tokio::select! {
            biased;
            _ = stop.recv() => break,
            work = shared.queues.decryption.pop() => work,
        };

        // Evicted before we got to it: nothing to decrypt.
        if work.is_dropped() {
            work.release();
            continue;
        }

        {
            let mut payload = work.payload();
            let counter = read_u64_le(&payload.packet, TRANSPORT_OFFSET_COUNTER);
            payload.counter = counter;

            let opened = work
                .key_pair
                .open_in_place(counter, &mut payload.packet[TRANSPORT_OFFSET_CONTENT..]);
            match opened {
                Ok(plaintext_len) => payload.plaintext_len = plaintext_len,
                Err(_) => {
                    shared.stats.record_decrypt_failure();
                    work.mark_dropped();
                }
            }
        }
        work.release();
    }
    debug!(worker = worker_id, "decryption worker stopped");
}
