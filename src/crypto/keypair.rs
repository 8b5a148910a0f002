//! Per-session AEAD key pairs
//!
//! A completed handshake yields one key pair: two directional
//! ChaCha20-Poly1305 keys, a creation timestamp that bounds the pair's
//! lifetime, and the session indices both ends use to address it. Key pairs
//! are immutable once installed and shared freely behind `Arc`; the only
//! interior state is the replay window and the send-side nonce counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce, Tag};
use parking_lot::Mutex;

use crate::error::CryptoError;
use crate::message::{write_transport_header, AEAD_TAG_SIZE, MESSAGE_TRANSPORT_SIZE};
use crate::replay::ReplayFilter;

/// Build the 12-byte AEAD nonce for a transport counter: four zero bytes
/// followed by the counter, little-endian, matching the wire encoding.
fn transport_nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce.into()
}

/// A session key pair produced by a completed handshake.
pub struct KeyPair {
    receive: ChaCha20Poly1305,
    send: ChaCha20Poly1305,
    created: Instant,
    /// Session index the remote puts in transport headers addressed to us
    pub local_index: u32,
    /// Session index we put in transport headers addressed to the remote
    pub remote_index: u32,
    /// Whether this side initiated the handshake that produced the pair
    pub initiator: bool,
    replay: Mutex<ReplayFilter>,
    send_counter: AtomicU64,
}

impl KeyPair {
    /// Create a key pair from raw directional keys.
    #[must_use]
    pub fn new(
        receive_key: &[u8; 32],
        send_key: &[u8; 32],
        local_index: u32,
        remote_index: u32,
        initiator: bool,
    ) -> Self {
        Self {
            receive: ChaCha20Poly1305::new(receive_key.into()),
            send: ChaCha20Poly1305::new(send_key.into()),
            created: Instant::now(),
            local_index,
            remote_index,
            initiator,
            replay: Mutex::new(ReplayFilter::new()),
            send_counter: AtomicU64::new(0),
        }
    }

    /// Age of the key pair.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Whether the pair has outlived its receive lifetime and packets keyed
    /// by it must be rejected.
    #[must_use]
    pub fn is_expired(&self, reject_after: Duration) -> bool {
        self.age() > reject_after
    }

    /// Whether received traffic on this pair should trigger a rekey. Only
    /// the initiator re-initiates.
    #[must_use]
    pub fn wants_rekey(&self, rekey_after: Duration) -> bool {
        self.initiator && self.age() > rekey_after
    }

    /// Check a received counter against the replay window, recording it as
    /// seen. Returns `false` for duplicates and stale counters.
    #[must_use]
    pub fn check_replay(&self, counter: u64) -> bool {
        self.replay.lock().check(counter)
    }

    /// Open a transport payload in place.
    ///
    /// `content` is the ciphertext followed by the 16-byte tag; on success
    /// the plaintext occupies the first `content.len() - 16` bytes and that
    /// length is returned.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptFailed`] on authentication failure or
    /// if `content` cannot hold a tag.
    pub fn open_in_place(&self, counter: u64, content: &mut [u8]) -> Result<usize, CryptoError> {
        let Some(ciphertext_len) = content.len().checked_sub(AEAD_TAG_SIZE) else {
            return Err(CryptoError::DecryptFailed);
        };
        let (ciphertext, tag) = content.split_at_mut(ciphertext_len);
        let tag = Tag::from_slice(tag);
        self.receive
            .decrypt_in_place_detached(&transport_nonce(counter), &[], ciphertext, tag)
            .map_err(|_| CryptoError::DecryptFailed)?;
        Ok(ciphertext_len)
    }

    /// Seal a plaintext into a complete transport datagram using the next
    /// send counter. Used for keep-alives; the outbound data pipeline
    /// shares this path.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptFailed`] if sealing fails.
    pub fn seal_transport(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let counter = self.send_counter.fetch_add(1, Ordering::Relaxed);
        self.seal_transport_with_counter(counter, plaintext)
    }

    /// Seal a plaintext into a complete transport datagram under an
    /// explicit counter.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptFailed`] if sealing fails.
    pub fn seal_transport_with_counter(
        &self,
        counter: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut packet = vec![0u8; MESSAGE_TRANSPORT_SIZE + plaintext.len() + AEAD_TAG_SIZE];
        write_transport_header(&mut packet, self.remote_index, counter);

        let content_end = MESSAGE_TRANSPORT_SIZE + plaintext.len();
        packet[MESSAGE_TRANSPORT_SIZE..content_end].copy_from_slice(plaintext);
        let tag = self
            .send
            .encrypt_in_place_detached(
                &transport_nonce(counter),
                &[],
                &mut packet[MESSAGE_TRANSPORT_SIZE..content_end],
            )
            .map_err(|_| CryptoError::EncryptFailed)?;
        packet[content_end..].copy_from_slice(&tag);
        Ok(packet)
    }

    /// Construct the mirror-image pair the remote end would hold: receive
    /// and send keys swapped, indices swapped, initiator flag flipped.
    #[must_use]
    pub fn mirrored(receive_key: &[u8; 32], send_key: &[u8; 32], pair: &Self) -> Self {
        Self::new(
            send_key,
            receive_key,
            pair.remote_index,
            pair.local_index,
            !pair.initiator,
        )
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index)
            .field("initiator", &self.initiator)
            .field("age", &self.age())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{read_u64_le, TRANSPORT_OFFSET_CONTENT, TRANSPORT_OFFSET_COUNTER};

    fn linked_pair() -> (KeyPair, KeyPair) {
        let key_a = [0x41u8; 32];
        let key_b = [0x42u8; 32];
        let ours = KeyPair::new(&key_a, &key_b, 100, 200, true);
        let theirs = KeyPair::mirrored(&key_a, &key_b, &ours);
        (ours, theirs)
    }

    #[test]
    fn test_seal_then_open_in_place() {
        let (ours, theirs) = linked_pair();
        let plaintext = b"\x45\x00\x00\x14ip packet body";

        let packet = theirs.seal_transport(plaintext).unwrap();
        assert_eq!(read_u64_le(&packet, TRANSPORT_OFFSET_COUNTER), 0);

        let mut content = packet[TRANSPORT_OFFSET_CONTENT..].to_vec();
        let len = ours.open_in_place(0, &mut content).unwrap();
        assert_eq!(&content[..len], plaintext);
    }

    #[test]
    fn test_open_rejects_wrong_counter() {
        let (ours, theirs) = linked_pair();
        let packet = theirs.seal_transport(b"payload").unwrap();
        let mut content = packet[TRANSPORT_OFFSET_CONTENT..].to_vec();
        assert!(ours.open_in_place(1, &mut content).is_err());
    }

    #[test]
    fn test_open_rejects_tampered_ciphertext() {
        let (ours, theirs) = linked_pair();
        let packet = theirs.seal_transport(b"payload").unwrap();
        let mut content = packet[TRANSPORT_OFFSET_CONTENT..].to_vec();
        content[0] ^= 0xFF;
        assert!(ours.open_in_place(0, &mut content).is_err());
    }

    #[test]
    fn test_open_rejects_truncated_content() {
        let (ours, _) = linked_pair();
        let mut short = vec![0u8; AEAD_TAG_SIZE - 1];
        assert!(ours.open_in_place(0, &mut short).is_err());
    }

    #[test]
    fn test_send_counter_increments() {
        let (_, theirs) = linked_pair();
        let p0 = theirs.seal_transport(b"a").unwrap();
        let p1 = theirs.seal_transport(b"b").unwrap();
        assert_eq!(read_u64_le(&p0, TRANSPORT_OFFSET_COUNTER), 0);
        assert_eq!(read_u64_le(&p1, TRANSPORT_OFFSET_COUNTER), 1);
    }

    #[test]
    fn test_keepalive_is_header_plus_tag() {
        let (_, theirs) = linked_pair();
        let packet = theirs.seal_transport(b"").unwrap();
        assert_eq!(packet.len(), MESSAGE_TRANSPORT_SIZE + AEAD_TAG_SIZE);
    }

    #[test]
    fn test_expiry() {
        let (ours, _) = linked_pair();
        assert!(!ours.is_expired(Duration::from_secs(180)));
        assert!(ours.is_expired(Duration::ZERO));
    }

    #[test]
    fn test_replay_window_shared_per_pair() {
        let (ours, _) = linked_pair();
        assert!(ours.check_replay(5));
        assert!(!ours.check_replay(5));
    }

    #[test]
    fn test_wants_rekey_initiator_only() {
        let (ours, theirs) = linked_pair();
        assert!(ours.wants_rekey(Duration::ZERO));
        assert!(!theirs.wants_rekey(Duration::ZERO));
    }
}
