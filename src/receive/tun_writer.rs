//! TUN writer: the single consumer feeding the virtual interface
//!
//! Drains the device-wide TUN queue and writes each plaintext packet to
//! the sink with one write call. Write failures are logged and counted;
//! nothing on this path is fatal.

use std::sync::Arc;

use tracing::{debug, error};

use crate::device::DeviceShared;
use crate::tun::TunSink;

/// Run the TUN writer until the device stops.
pub(crate) async fn run(shared: Arc<DeviceShared>, tun: Arc<dyn TunSink>) {
    let mut stop = shared.subscribe_stop();
    debug!("tun writer started");

    loop {
        let packet = tokio::select! {
            biased;
            _ = stop.recv() => break,
            packet = shared.queues.tun.pop() => packet,
        };

        match tun.write_packet(packet.bytes()).await {
            Ok(()) => shared.stats.record_tun_write(),
            Err(e) => {
                shared.stats.record_tun_write_error();
                error!("failed to write packet to TUN device: {e}");
            }
        }
    }
    debug!("tun writer stopped");
}
