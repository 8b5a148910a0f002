//! Receiver: socket read loop, classification, and admission control
//!
//! The receiver is the sole reader of the UDP socket. Each iteration reads
//! one datagram under a bounded deadline, classifies it by its first four
//! bytes, and dispatches:
//!
//! - Handshake messages pass MAC1 or are silently dropped. While the
//!   handshake queue is busy they must also pass MAC2; otherwise the
//!   receiver answers with a cookie reply, written into the incoming
//!   packet's own storage, and drops the datagram. This is the DoS shield:
//!   no asymmetric crypto runs on the receive path.
//! - Cookie replies update the addressed peer's cookie state.
//! - Transport packets resolve their session, are rejected on key expiry,
//!   and fan out as one [`InboundWork`] into the decryption queue first
//!   and the peer's inbound queue second.
//!
//! The receiver consumes its buffer only when a packet is handed
//! downstream; otherwise the same allocation serves the next read. No
//! error on this path is fatal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace};

use super::inbound::InboundWork;
use super::queue::HandshakeWork;
use crate::device::DeviceShared;
use crate::message::{
    message_type, read_u32_le, MessageCookieReply, MAX_MESSAGE_SIZE, MESSAGE_COOKIE_REPLY_SIZE,
    MESSAGE_COOKIE_REPLY_TYPE, MESSAGE_INITIATION_TYPE, MESSAGE_RESPONSE_TYPE,
    MESSAGE_TRANSPORT_TYPE, MIN_MESSAGE_SIZE, TRANSPORT_OFFSET_RECEIVER,
};

/// Bound on a single socket read, so stop is observed promptly even if the
/// select were not already watching it.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Run the receiver until the device stops.
pub(crate) async fn run(shared: Arc<DeviceShared>) {
    let mut stop = shared.subscribe_stop();
    debug!("receiver started");

    // Buffer retained across iterations until a packet consumes it.
    let mut retained: Option<Vec<u8>> = None;

    loop {
        let socket = match shared.socket() {
            Some(socket) => socket,
            None => {
                // Socket slot empty mid-rebind; retry shortly.
                tokio::select! {
                    biased;
                    _ = stop.recv() => break,
                    () = tokio::time::sleep(READ_TIMEOUT) => {}
                }
                continue;
            }
        };

        let mut buffer = retained
            .take()
            .unwrap_or_else(|| vec![0u8; MAX_MESSAGE_SIZE]);

        let received = tokio::select! {
            biased;
            _ = stop.recv() => break,
            r = tokio::time::timeout(READ_TIMEOUT, socket.recv_from(&mut buffer)) => r,
        };

        let (size, source) = match received {
            // Deadline elapsed with nothing to read.
            Err(_) => {
                retained = Some(buffer);
                continue;
            }
            Ok(Err(e)) => {
                debug!("socket read failed: {e}");
                retained = Some(buffer);
                continue;
            }
            Ok(Ok(pair)) => pair,
        };

        shared.stats.record_datagram();
        if size < MIN_MESSAGE_SIZE {
            retained = Some(buffer);
            continue;
        }

        retained = handle_datagram(&shared, buffer, size, source).await;
    }
    debug!("receiver stopped");
}

/// Handle one datagram. Returns the buffer when it was not consumed, so
/// the read loop can reuse it.
async fn handle_datagram(
    shared: &Arc<DeviceShared>,
    mut buffer: Vec<u8>,
    size: usize,
    source: SocketAddr,
) -> Option<Vec<u8>> {
    let Some(msg_type) = message_type(&buffer[..size]) else {
        return Some(buffer);
    };
    match msg_type {
        MESSAGE_INITIATION_TYPE | MESSAGE_RESPONSE_TYPE => {
            let packet = &buffer[..size];
            if !shared.cookie_checker.check_mac1(packet) {
                shared.stats.record_invalid_mac();
                debug!(%source, "handshake packet with invalid mac1");
                return Some(buffer);
            }

            // Under handshake load, demand proof of source reachability.
            let busy = shared.queues.handshake.len() > shared.tunables().handshake_busy_size;
            if busy && !shared.cookie_checker.check_mac2(packet, &source) {
                send_cookie_reply(shared, &mut buffer, size, source).await;
                return Some(buffer);
            }

            buffer.truncate(size);
            match shared.queues.handshake.push(HandshakeWork {
                msg_type,
                packet: buffer,
                source,
            }) {
                Ok(()) => {
                    shared.stats.record_handshake_queued();
                    None
                }
                Err(rejected) => {
                    shared.stats.record_handshake_overflow();
                    debug!(%source, "handshake queue full, dropping packet");
                    let mut buffer = rejected.packet;
                    buffer.resize(MAX_MESSAGE_SIZE, 0);
                    Some(buffer)
                }
            }
        }

        MESSAGE_COOKIE_REPLY_TYPE => {
            if size != MESSAGE_COOKIE_REPLY_SIZE {
                return Some(buffer);
            }
            match MessageCookieReply::decode(&buffer[..size]) {
                Ok(reply) => consume_cookie_reply(shared, &reply),
                Err(_) => debug!(%source, "failed to decode cookie reply"),
            }
            Some(buffer)
        }

        MESSAGE_TRANSPORT_TYPE => {
            let receiver_id = read_u32_le(&buffer[..size], TRANSPORT_OFFSET_RECEIVER);
            let Some(entry) = shared.sessions.lookup(receiver_id) else {
                shared.stats.record_unknown_session();
                trace!(receiver_id, "transport packet for unknown session");
                return Some(buffer);
            };
            if entry.key_pair.is_expired(shared.tunables().reject_after) {
                shared.stats.record_expired_key();
                debug!(receiver_id, "transport packet for expired key pair");
                return Some(buffer);
            }

            buffer.truncate(size);
            let work = InboundWork::new(buffer, entry.key_pair);

            // Decryption queue first, then the peer queue; per-peer order
            // depends on this.
            shared.queues.decryption.push(Arc::clone(&work));
            entry.peer.inbound().push(work);
            shared.stats.record_transport();
            None
        }

        other => {
            debug!(%source, msg_type = other, "unknown message type");
            Some(buffer)
        }
    }
}

/// Serialize a cookie reply into the incoming packet's storage and send it
/// back to the source.
async fn send_cookie_reply(
    shared: &Arc<DeviceShared>,
    buffer: &mut [u8],
    size: usize,
    source: SocketAddr,
) {
    // The sender index follows the type field in both handshake messages.
    let sender = read_u32_le(&buffer[..size], 4);
    let reply = match shared
        .cookie_checker
        .create_reply(&buffer[..size], sender, &source)
    {
        Ok(reply) => reply,
        Err(e) => {
            error!("failed to create cookie reply: {e}");
            return;
        }
    };

    buffer[..MESSAGE_COOKIE_REPLY_SIZE].copy_from_slice(&reply.encode());
    match shared
        .send_to(&buffer[..MESSAGE_COOKIE_REPLY_SIZE], source)
        .await
    {
        Ok(_) => shared.stats.record_cookie_reply(),
        Err(e) => debug!("failed to send cookie reply: {e}"),
    }
}

/// Route a cookie reply to the peer whose pending handshake it addresses.
fn consume_cookie_reply(shared: &Arc<DeviceShared>, reply: &MessageCookieReply) {
    let Some(peer) = shared.lookup_handshake_index(reply.receiver) else {
        debug!(receiver = reply.receiver, "cookie reply for unknown handshake");
        return;
    };
    match peer.cookies().consume_reply(reply) {
        Ok(()) => trace!(receiver = reply.receiver, "peer cookie updated"),
        Err(_) => debug!(receiver = reply.receiver, "cookie reply failed to open"),
    }
}
