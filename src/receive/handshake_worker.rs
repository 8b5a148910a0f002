//! Handshake workers: the expensive half of handshake processing
//!
//! Workers drain the handshake queue the receiver fills. All asymmetric
//! cryptography happens here, off the socket read path; the queue's
//! occupancy is the load signal the receiver's cookie shield keys off.
//!
//! An initiation that proves a configured peer's identity is answered with
//! a response and installs the responder-side key pair. A response that
//! completes a pending initiation fires the peer's handshake-completed
//! signal, installs the initiator-side key pair, and sends a keep-alive so
//! NAT mappings exist before user traffic flows.

use std::sync::Arc;

use tracing::{debug, error, info};

use super::queue::HandshakeWork;
use crate::crypto::handshake::{self, HandshakeState};
use crate::device::DeviceShared;
use crate::message::{
    MessageInitiation, MessageResponse, MESSAGE_INITIATION_SIZE, MESSAGE_INITIATION_TYPE,
    MESSAGE_RESPONSE_SIZE, MESSAGE_RESPONSE_TYPE,
};

/// Run one handshake worker until the device stops.
pub(crate) async fn run(shared: Arc<DeviceShared>, worker_id: usize) {
    let mut stop = shared.subscribe_stop();
    debug!(worker = worker_id, "handshake worker started");

    loop {
        let work = tokio::select! {
            biased;
            _ = stop.recv() => break,
            work = shared.queues.handshake.pop() => work,
        };

        match work.msg_type {
            MESSAGE_INITIATION_TYPE => consume_initiation(&shared, &work).await,
            MESSAGE_RESPONSE_TYPE => consume_response(&shared, &work).await,
            other => error!(msg_type = other, "invalid message type in handshake queue"),
        }
    }
    debug!(worker = worker_id, "handshake worker stopped");
}

async fn consume_initiation(shared: &Arc<DeviceShared>, work: &HandshakeWork) {
    if work.packet.len() != MESSAGE_INITIATION_SIZE {
        return;
    }
    let Ok(msg) = MessageInitiation::decode(&work.packet) else {
        error!("failed to decode initiation message");
        return;
    };

    let consumed = match handshake::consume_initiation(shared.identity(), &msg) {
        Ok(consumed) => consumed,
        Err(_) => {
            info!(source = %work.source, "received invalid initiation message");
            return;
        }
    };
    let Some(peer) = shared.peer_by_key(&consumed.initiator_static) else {
        info!(source = %work.source, "initiation from unconfigured peer");
        return;
    };
    if !peer.check_initiation_timestamp(consumed.timestamp) {
        debug!(source = %work.source, "replayed initiation timestamp");
        return;
    }

    // Reserve our index, derive keys, and answer.
    let local_index = shared.register_handshake_index(&peer);
    let (response, keys) = match handshake::create_response(&consumed.state, local_index) {
        Ok(pair) => pair,
        Err(e) => {
            error!("failed to create handshake response: {e}");
            shared.unregister_handshake_index(local_index);
            return;
        }
    };

    *peer.handshake.lock() = HandshakeState::Idle;
    peer.set_endpoint(work.source);
    peer.install_key_pair(&shared.sessions, &keys, false);
    shared.unregister_handshake_index(local_index);

    let mut packet = response.encode().to_vec();
    peer.cookies().seal_macs(&mut packet);
    if let Err(e) = shared.send_to(&packet, work.source).await {
        debug!("failed to send handshake response: {e}");
    }
    debug!(source = %work.source, "received valid initiation message");
}

async fn consume_response(shared: &Arc<DeviceShared>, work: &HandshakeWork) {
    if work.packet.len() != MESSAGE_RESPONSE_SIZE {
        return;
    }
    let Ok(msg) = MessageResponse::decode(&work.packet) else {
        error!("failed to decode response message");
        return;
    };

    let Some(peer) = shared.lookup_handshake_index(msg.receiver) else {
        info!(source = %work.source, "response for unknown handshake index");
        return;
    };

    let keys = {
        let state = peer.handshake.lock();
        match handshake::consume_response(shared.identity(), &state, &msg) {
            Ok(keys) => keys,
            Err(_) => {
                info!(source = %work.source, "received invalid response message");
                return;
            }
        }
    };

    *peer.handshake.lock() = HandshakeState::Idle;
    shared.unregister_handshake_index(msg.receiver);
    peer.set_endpoint(work.source);
    debug!(source = %work.source, "received valid response message");

    peer.notify_handshake_completed();
    peer.install_key_pair(&shared.sessions, &keys, true);
    if let Err(e) = peer.send_keepalive(shared).await {
        debug!("failed to send keep-alive: {e}");
    }
}
