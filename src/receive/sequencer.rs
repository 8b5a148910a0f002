//! Per-peer sequencer: in-order delivery, replay filtering, liveness
//!
//! One sequencer per peer. It pops work items in the order the receiver
//! enqueued them and acquires each item's readiness gate, which blocks
//! until the decryption pool finishes that item; arrival order is thereby
//! reimposed on the pool's output.
//!
//! For each surviving item the sequencer checks the counter against the
//! key pair's replay window, updates the peer's liveness timers, consumes
//! zero-length keep-alives, strips AEAD padding down to the IP packet's
//! own length, requests a rekey when the key pair has aged past the
//! threshold, and forwards the plaintext to the TUN queue. The buffer
//! moves with the packet, so the work item can drop immediately.

use std::sync::Arc;

use tracing::{debug, trace};

use super::queue::TunPacket;
use crate::device::{DeviceShared, Peer};
use crate::message::TRANSPORT_OFFSET_CONTENT;

/// Run the sequencer for one peer until the peer or device stops.
pub(crate) async fn run(shared: Arc<DeviceShared>, peer: Arc<Peer>) {
    let mut stop = peer.subscribe_stop();
    let mut device_stop = shared.subscribe_stop();
    debug!("sequencer started");

    loop {
        let work = tokio::select! {
            biased;
            _ = stop.recv() => break,
            _ = device_stop.recv() => break,
            work = peer.inbound().pop() => work,
        };

        // Wait for the decryption pool (or eviction) to release the item.
        tokio::select! {
            biased;
            _ = stop.recv() => break,
            _ = device_stop.recv() => break,
            () = work.wait_ready() => {}
        }

        if work.is_dropped() {
            continue;
        }

        let (packet, plaintext_len, counter) = {
            let mut payload = work.payload();
            (
                std::mem::take(&mut payload.packet),
                payload.plaintext_len,
                payload.counter,
            )
        };

        if !work.key_pair.check_replay(counter) {
            peer.stats().record_replay();
            trace!(counter, "replayed packet discarded");
            continue;
        }

        // Received traffic on an aged initiator pair triggers a rekey.
        if work.key_pair.wants_rekey(shared.tunables().rekey_after) {
            peer.request_rekey();
        }

        // Zero-length plaintext is a keep-alive.
        if plaintext_len == 0 {
            peer.record_keepalive_received();
            peer.stats().record_keepalive();
            trace!("keep-alive received");
            continue;
        }
        peer.record_data_received();

        let plaintext = &packet[TRANSPORT_OFFSET_CONTENT..TRANSPORT_OFFSET_CONTENT + plaintext_len];
        let delivered_len = ip_packet_len(plaintext)
            .unwrap_or(plaintext_len)
            .min(plaintext_len);
        peer.stats().record_data(delivered_len);

        let discarded = shared
            .queues
            .tun
            .push(TunPacket::from_work_buffer(packet, delivered_len));
        if discarded > 0 {
            shared.stats.record_tun_discard();
            trace!("tun queue overflow, oldest packet discarded");
        }
    }
    debug!("sequencer stopped");
}

/// Length the IP header claims for the packet, used to strip cipher
/// padding. Unrecognized or truncated headers yield `None` and the
/// plaintext is delivered as-is.
fn ip_packet_len(plaintext: &[u8]) -> Option<usize> {
    match plaintext.first()? >> 4 {
        4 if plaintext.len() >= 20 => {
            Some(u16::from_be_bytes([plaintext[2], plaintext[3]]) as usize)
        }
        6 if plaintext.len() >= 40 => {
            Some(40 + u16::from_be_bytes([plaintext[4], plaintext[5]]) as usize)
        }
        _ => None,
    }
}
