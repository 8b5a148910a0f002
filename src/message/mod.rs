//! Wire formats for the tunnel protocol
//!
//! Four message types travel over the UDP socket, identified by their first
//! four little-endian bytes. Handshake messages (initiation, response,
//! cookie reply) have fixed sizes; transport messages have a fixed 16-byte
//! header followed by AEAD ciphertext and a 16-byte tag.
//!
//! All integers on the wire are little-endian.

use crate::error::MessageError;

/// Handshake initiation message type
pub const MESSAGE_INITIATION_TYPE: u32 = 1;

/// Handshake response message type
pub const MESSAGE_RESPONSE_TYPE: u32 = 2;

/// Cookie reply message type
pub const MESSAGE_COOKIE_REPLY_TYPE: u32 = 3;

/// Transport data message type
pub const MESSAGE_TRANSPORT_TYPE: u32 = 4;

/// Handshake initiation packet size
///
/// - 4 bytes: message type (1)
/// - 4 bytes: sender index
/// - 32 bytes: unencrypted ephemeral public key
/// - 48 bytes: encrypted static public key (32 + 16 poly1305)
/// - 28 bytes: encrypted timestamp (12 + 16 poly1305)
/// - 16 bytes: MAC1
/// - 16 bytes: MAC2
///
/// Total: 148 bytes
pub const MESSAGE_INITIATION_SIZE: usize = 148;

/// Handshake response packet size
///
/// - 4 bytes: message type (2)
/// - 4 bytes: sender index
/// - 4 bytes: receiver index
/// - 32 bytes: unencrypted ephemeral public key
/// - 16 bytes: encrypted empty payload (0 + 16 poly1305)
/// - 16 bytes: MAC1
/// - 16 bytes: MAC2
///
/// Total: 92 bytes
pub const MESSAGE_RESPONSE_SIZE: usize = 92;

/// Cookie reply packet size
///
/// - 4 bytes: message type (3)
/// - 4 bytes: receiver index
/// - 24 bytes: XChaCha20-Poly1305 nonce
/// - 32 bytes: encrypted cookie (16 + 16 poly1305)
///
/// Total: 64 bytes
pub const MESSAGE_COOKIE_REPLY_SIZE: usize = 64;

/// Transport header size (type + receiver + counter)
pub const MESSAGE_TRANSPORT_SIZE: usize = 16;

/// Poly1305 authentication tag size
pub const AEAD_TAG_SIZE: usize = 16;

/// Smallest datagram the receiver will look at: an empty transport message
/// (header plus tag), which is also smaller than every handshake message.
pub const MIN_MESSAGE_SIZE: usize = MESSAGE_TRANSPORT_SIZE + AEAD_TAG_SIZE;

/// Largest datagram the receiver will read
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Transport header offset: 32-bit receiver index
pub const TRANSPORT_OFFSET_RECEIVER: usize = 4;

/// Transport header offset: 64-bit nonce counter
pub const TRANSPORT_OFFSET_COUNTER: usize = 8;

/// Transport header offset: start of AEAD ciphertext
pub const TRANSPORT_OFFSET_CONTENT: usize = 16;

/// Size of the two trailing MAC fields on handshake messages
pub const MACS_SIZE: usize = 32;

/// Size of one MAC field
pub const MAC_SIZE: usize = 16;

/// Cookie value size
pub const COOKIE_SIZE: usize = 16;

/// Cookie reply nonce size (XChaCha20-Poly1305)
pub const COOKIE_NONCE_SIZE: usize = 24;

/// Plaintext timestamp size in the initiation message
pub const TIMESTAMP_SIZE: usize = 12;

/// Read the message type from the first four bytes of a packet.
#[must_use]
pub fn message_type(packet: &[u8]) -> Option<u32> {
    let bytes = packet.get(..4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

/// Read the little-endian u32 at `offset`.
///
/// Callers guarantee the packet is long enough; the receiver enforces
/// [`MIN_MESSAGE_SIZE`] before classification.
#[must_use]
pub fn read_u32_le(packet: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(packet[offset..offset + 4].try_into().expect("4 bytes"))
}

/// Read the little-endian u64 at `offset`.
#[must_use]
pub fn read_u64_le(packet: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(packet[offset..offset + 8].try_into().expect("8 bytes"))
}

/// Handshake initiation message
#[derive(Debug, Clone)]
pub struct MessageInitiation {
    /// Initiator's handshake index
    pub sender: u32,
    /// Initiator's ephemeral public key
    pub ephemeral: [u8; 32],
    /// Initiator's static public key, sealed
    pub static_box: [u8; 48],
    /// Initiator's timestamp, sealed
    pub timestamp_box: [u8; 28],
    /// MAC over the message body, keyed by the responder's identity
    pub mac1: [u8; 16],
    /// MAC over the message body, keyed by the current cookie
    pub mac2: [u8; 16],
}

impl MessageInitiation {
    /// Decode from an exact-size packet.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::InvalidLength`] if the packet is not exactly
    /// [`MESSAGE_INITIATION_SIZE`] bytes.
    pub fn decode(packet: &[u8]) -> Result<Self, MessageError> {
        if packet.len() != MESSAGE_INITIATION_SIZE {
            return Err(MessageError::InvalidLength {
                expected: MESSAGE_INITIATION_SIZE,
                got: packet.len(),
            });
        }
        Ok(Self {
            sender: read_u32_le(packet, 4),
            ephemeral: packet[8..40].try_into().expect("32 bytes"),
            static_box: packet[40..88].try_into().expect("48 bytes"),
            timestamp_box: packet[88..116].try_into().expect("28 bytes"),
            mac1: packet[116..132].try_into().expect("16 bytes"),
            mac2: packet[132..148].try_into().expect("16 bytes"),
        })
    }

    /// Encode into a fixed-size buffer. The MAC fields are written as-is;
    /// [`crate::crypto::cookie::CookieGenerator::seal_macs`] fills them on
    /// outgoing messages.
    #[must_use]
    pub fn encode(&self) -> [u8; MESSAGE_INITIATION_SIZE] {
        let mut buf = [0u8; MESSAGE_INITIATION_SIZE];
        buf[0..4].copy_from_slice(&MESSAGE_INITIATION_TYPE.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral);
        buf[40..88].copy_from_slice(&self.static_box);
        buf[88..116].copy_from_slice(&self.timestamp_box);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);
        buf
    }
}

/// Handshake response message
#[derive(Debug, Clone)]
pub struct MessageResponse {
    /// Responder's handshake index
    pub sender: u32,
    /// Initiator's handshake index, echoed
    pub receiver: u32,
    /// Responder's ephemeral public key
    pub ephemeral: [u8; 32],
    /// Sealed empty payload proving key confirmation
    pub empty_box: [u8; 16],
    /// MAC over the message body, keyed by the initiator's identity
    pub mac1: [u8; 16],
    /// MAC over the message body, keyed by the current cookie
    pub mac2: [u8; 16],
}

impl MessageResponse {
    /// Decode from an exact-size packet.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::InvalidLength`] if the packet is not exactly
    /// [`MESSAGE_RESPONSE_SIZE`] bytes.
    pub fn decode(packet: &[u8]) -> Result<Self, MessageError> {
        if packet.len() != MESSAGE_RESPONSE_SIZE {
            return Err(MessageError::InvalidLength {
                expected: MESSAGE_RESPONSE_SIZE,
                got: packet.len(),
            });
        }
        Ok(Self {
            sender: read_u32_le(packet, 4),
            receiver: read_u32_le(packet, 8),
            ephemeral: packet[12..44].try_into().expect("32 bytes"),
            empty_box: packet[44..60].try_into().expect("16 bytes"),
            mac1: packet[60..76].try_into().expect("16 bytes"),
            mac2: packet[76..92].try_into().expect("16 bytes"),
        })
    }

    /// Encode into a fixed-size buffer.
    #[must_use]
    pub fn encode(&self) -> [u8; MESSAGE_RESPONSE_SIZE] {
        let mut buf = [0u8; MESSAGE_RESPONSE_SIZE];
        buf[0..4].copy_from_slice(&MESSAGE_RESPONSE_TYPE.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral);
        buf[44..60].copy_from_slice(&self.empty_box);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);
        buf
    }
}

/// Cookie reply message
#[derive(Debug, Clone)]
pub struct MessageCookieReply {
    /// Handshake index of the message that triggered the reply
    pub receiver: u32,
    /// Random nonce for the cookie box
    pub nonce: [u8; COOKIE_NONCE_SIZE],
    /// Cookie sealed under the recipient's cookie key, bound to the
    /// triggering message's MAC1
    pub cookie_box: [u8; COOKIE_SIZE + AEAD_TAG_SIZE],
}

impl MessageCookieReply {
    /// Decode from an exact-size packet.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::InvalidLength`] if the packet is not exactly
    /// [`MESSAGE_COOKIE_REPLY_SIZE`] bytes.
    pub fn decode(packet: &[u8]) -> Result<Self, MessageError> {
        if packet.len() != MESSAGE_COOKIE_REPLY_SIZE {
            return Err(MessageError::InvalidLength {
                expected: MESSAGE_COOKIE_REPLY_SIZE,
                got: packet.len(),
            });
        }
        Ok(Self {
            receiver: read_u32_le(packet, 4),
            nonce: packet[8..32].try_into().expect("24 bytes"),
            cookie_box: packet[32..64].try_into().expect("32 bytes"),
        })
    }

    /// Encode into a fixed-size buffer.
    #[must_use]
    pub fn encode(&self) -> [u8; MESSAGE_COOKIE_REPLY_SIZE] {
        let mut buf = [0u8; MESSAGE_COOKIE_REPLY_SIZE];
        buf[0..4].copy_from_slice(&MESSAGE_COOKIE_REPLY_TYPE.to_le_bytes());
        buf[4..8].copy_from_slice(&self.receiver.to_le_bytes());
        buf[8..32].copy_from_slice(&self.nonce);
        buf[32..64].copy_from_slice(&self.cookie_box);
        buf
    }
}

/// Write a transport header into the first 16 bytes of `buf`.
pub fn write_transport_header(buf: &mut [u8], receiver: u32, counter: u64) {
    buf[0..4].copy_from_slice(&MESSAGE_TRANSPORT_TYPE.to_le_bytes());
    buf[4..8].copy_from_slice(&receiver.to_le_bytes());
    buf[8..16].copy_from_slice(&counter.to_le_bytes());
}
