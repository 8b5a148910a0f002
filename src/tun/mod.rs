//! TUN sink abstraction
//!
//! The pipeline ends at a write-only sink for plaintext IP packets. The
//! OS-level TUN driver (interface creation, addressing, routing) is
//! external; this module only defines the seam the TUN writer consumes and
//! two implementations: a file-backed sink wrapping an already-configured
//! TUN device node, and a channel-backed sink for embedding and tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};

use crate::error::TunError;

/// A write-only sink for plaintext IP packets.
///
/// The TUN writer task is the only caller; implementations may assume a
/// single writer and must deliver each packet with one logical write.
#[async_trait]
pub trait TunSink: Send + Sync {
    /// Write one packet to the device.
    ///
    /// # Errors
    ///
    /// Returns [`TunError`] if the write fails; the pipeline logs and
    /// continues.
    async fn write_packet(&self, packet: &[u8]) -> Result<(), TunError>;
}

/// Sink over an already-opened and configured TUN device file.
///
/// Interface setup (ioctls, addresses, routes) happens outside this
/// process or before handing the file in; packets are written verbatim,
/// one `write` per packet, as TUN devices require.
pub struct FileTun {
    file: Mutex<tokio::fs::File>,
}

impl FileTun {
    /// Wrap an opened TUN device file.
    #[must_use]
    pub fn new(file: tokio::fs::File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }

    /// Open a TUN device node by path.
    ///
    /// # Errors
    ///
    /// Returns [`TunError::WriteFailed`] if the node cannot be opened for
    /// writing.
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self, TunError> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await?;
        Ok(Self::new(file))
    }
}

#[async_trait]
impl TunSink for FileTun {
    async fn write_packet(&self, packet: &[u8]) -> Result<(), TunError> {
        let mut file = self.file.lock().await;
        file.write_all(packet).await?;
        Ok(())
    }
}

/// Channel-backed sink: packets appear on an in-process receiver.
///
/// Used by tests and by embedders that post-process packets instead of
/// handing them to the kernel.
pub struct ChannelTun {
    sender: mpsc::Sender<Vec<u8>>,
}

impl ChannelTun {
    /// Create a sink and the receiver observing its packets.
    #[must_use]
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Arc::new(Self { sender }), receiver)
    }
}

#[async_trait]
impl TunSink for ChannelTun {
    async fn write_packet(&self, packet: &[u8]) -> Result<(), TunError> {
        self.sender
            .send(packet.to_vec())
            .await
            .map_err(|_| TunError::Closed)
    }
}
