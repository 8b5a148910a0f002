//! The inbound packet pipeline
//!
//! Five cooperating stages turn authenticated UDP datagrams into plaintext
//! IP packets on the TUN device:
//!
//! ```text
//! socket --> Receiver --+--> handshake queue --> Handshake workers
//!                       |
//!                       +--> decryption queue --> Decryption pool (N)
//!                       |                              .
//!                       +--> per-peer queue            . releases gate
//!                                 |                    .
//!                                 v                    v
//!                             Sequencer  --gate-acquire--> TUN queue --> TUN writer
//! ```
//!
//! The receiver places the *same* [`InboundWork`] into the decryption
//! queue and the owning peer's queue; the item's readiness gate is how
//! parallel decryption reconverges with in-order per-peer delivery. Within
//! one peer, plaintexts reach the TUN writer in the exact order their
//! datagrams were accepted; across peers there is no ordering. All queues
//! are bounded and never block producers: under overload the newest packet
//! wins and evicted items propagate their dropped state through the gate,
//! so no stage can hang on a discarded packet.

pub mod inbound;
pub mod queue;

pub(crate) mod decrypt;
pub(crate) mod handshake_worker;
pub(crate) mod receiver;
pub(crate) mod sequencer;
pub(crate) mod tun_writer;

pub use inbound::{InboundWork, WorkPayload};
pub use queue::{HandshakeWork, TunPacket};
