//! Compact x25519 + BLAKE2s handshake
//!
//! Two messages establish a session: the initiator sends an initiation
//! carrying its ephemeral key, its sealed static identity and a sealed
//! timestamp; the responder answers with its own ephemeral key and a sealed
//! empty payload confirming key agreement. Each message mixes its Diffie-
//! Hellman results into a BLAKE2s chaining key, and the final chain is
//! expanded into one directional ChaCha20-Poly1305 key per direction.
//!
//! The timestamp exists to reject replayed initiations: a responder only
//! accepts an initiation whose timestamp is strictly newer than the last
//! one accepted from that peer.

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use super::{hash2, kdf1, kdf2};
use crate::error::CryptoError;
use crate::message::{MessageInitiation, MessageResponse, TIMESTAMP_SIZE};

/// Protocol construction label, hashed into the initial chaining key
const CONSTRUCTION: &[u8] = b"rust-tunnel v1 blake2s chacha20poly1305";

/// Protocol identifier, hashed into the initial transcript hash
const IDENTIFIER: &[u8] = b"rust-tunnel point-to-point";

/// Handshake fields are sealed with a fixed zero nonce; every sealing key
/// is used exactly once.
fn seal(key: &[u8; 32], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(
            Nonce::from_slice(&[0u8; 12]),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::EncryptFailed)
}

fn open(key: &[u8; 32], aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(&[0u8; 12]), Payload { msg: sealed, aad })
        .map_err(|_| CryptoError::DecryptFailed)
}

/// Current time as 12 bytes: 8-byte seconds then 4-byte nanoseconds, both
/// big-endian, so byte-wise comparison orders timestamps.
#[must_use]
pub fn timestamp_now() -> [u8; TIMESTAMP_SIZE] {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let mut ts = [0u8; TIMESTAMP_SIZE];
    ts[..8].copy_from_slice(&now.as_secs().to_be_bytes());
    ts[8..].copy_from_slice(&now.subsec_nanos().to_be_bytes());
    ts
}

/// The device's static x25519 identity.
pub struct Identity {
    private: StaticSecret,
    /// Public half, shared with peers out of band
    pub public: PublicKey,
}

impl Identity {
    /// Build an identity from a raw 32-byte private key.
    #[must_use]
    pub fn from_private_bytes(bytes: [u8; 32]) -> Self {
        let private = StaticSecret::from(bytes);
        let public = PublicKey::from(&private);
        Self { private, public }
    }

    /// Generate a fresh random identity.
    #[must_use]
    pub fn generate() -> Self {
        let private = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&private);
        Self { private, public }
    }

    /// Public key bytes.
    #[must_use]
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Private key bytes, for serializing a generated identity.
    #[must_use]
    pub fn to_private_bytes(&self) -> [u8; 32] {
        self.private.to_bytes()
    }

    fn dh(&self, remote: &[u8; 32]) -> [u8; 32] {
        self.private
            .diffie_hellman(&PublicKey::from(*remote))
            .to_bytes()
    }
}

/// Directional session keys produced by a completed handshake.
///
/// The handshake indices double as the session receiver indices: the
/// remote stamps `local_index` into transport headers addressed to us, and
/// we stamp `remote_index` into headers addressed to it.
pub struct SessionKeys {
    /// Key under which the remote seals traffic to us
    pub receive: [u8; 32],
    /// Key under which we seal traffic to the remote
    pub send: [u8; 32],
    /// Our session index for this pair
    pub local_index: u32,
    /// The remote's session index for this pair
    pub remote_index: u32,
}

/// Per-peer handshake progress.
///
/// Exactly one exchange is in flight per peer at a time; a new initiation
/// in either direction replaces whatever was pending.
pub enum HandshakeState {
    /// No exchange in flight
    Idle,
    /// We sent an initiation and await the response
    InitiationSent {
        /// Index the response must echo in its receiver field
        local_index: u32,
        ephemeral: StaticSecret,
        hash: [u8; 32],
        chain_key: [u8; 32],
    },
    /// We consumed an initiation and can produce a response
    InitiationConsumed {
        /// The initiator's handshake index
        remote_index: u32,
        remote_ephemeral: [u8; 32],
        initiator_static: [u8; 32],
        hash: [u8; 32],
        chain_key: [u8; 32],
    },
}

/// Result of consuming an initiation: the identity it proved plus the state
/// needed to respond. The caller routes `initiator_static` to a configured
/// peer and checks `timestamp` monotonicity before committing the state.
pub struct ConsumedInitiation {
    /// The initiator's static public key, proven by the sealed box
    pub initiator_static: [u8; 32],
    /// The initiator's sealed timestamp
    pub timestamp: [u8; TIMESTAMP_SIZE],
    /// State to store on the peer, ready for [`create_response`]
    pub state: HandshakeState,
}

fn initial_chain() -> ([u8; 32], [u8; 32]) {
    let chain = hash2(CONSTRUCTION, &[]);
    let hash = hash2(&chain, IDENTIFIER);
    (chain, hash)
}

/// Create a handshake initiation addressed to `remote_static`.
///
/// The MAC fields of the returned message are zero; the caller seals them
/// with the peer's [`super::CookieGenerator`] after encoding.
///
/// # Errors
///
/// Returns [`CryptoError::EncryptFailed`] if sealing fails.
pub fn create_initiation(
    identity: &Identity,
    remote_static: &[u8; 32],
    local_index: u32,
) -> Result<(MessageInitiation, HandshakeState), CryptoError> {
    let (chain, hash) = initial_chain();
    let hash = hash2(&hash, remote_static);

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral).to_bytes();

    let chain = kdf1(&chain, &ephemeral_pub);
    let hash = hash2(&hash, &ephemeral_pub);

    let es = ephemeral
        .diffie_hellman(&PublicKey::from(*remote_static))
        .to_bytes();
    let (chain, key) = kdf2(&chain, &es);
    let static_box = seal(&key, &hash, &identity.public_bytes())?;
    let hash = hash2(&hash, &static_box);

    let ss = identity.dh(remote_static);
    let (chain, key) = kdf2(&chain, &ss);
    let timestamp_box = seal(&key, &hash, &timestamp_now())?;
    let hash = hash2(&hash, &timestamp_box);

    let msg = MessageInitiation {
        sender: local_index,
        ephemeral: ephemeral_pub,
        static_box: static_box
            .try_into()
            .map_err(|_| CryptoError::EncryptFailed)?,
        timestamp_box: timestamp_box
            .try_into()
            .map_err(|_| CryptoError::EncryptFailed)?,
        mac1: [0u8; 16],
        mac2: [0u8; 16],
    };
    let state = HandshakeState::InitiationSent {
        local_index,
        ephemeral,
        hash,
        chain_key: chain,
    };
    Ok((msg, state))
}

/// Consume a handshake initiation addressed to this device.
///
/// # Errors
///
/// Returns [`CryptoError::DecryptFailed`] if either sealed field fails to
/// authenticate, which covers both corruption and a message meant for a
/// different responder identity.
pub fn consume_initiation(
    identity: &Identity,
    msg: &MessageInitiation,
) -> Result<ConsumedInitiation, CryptoError> {
    let (chain, hash) = initial_chain();
    let hash = hash2(&hash, &identity.public_bytes());

    let chain = kdf1(&chain, &msg.ephemeral);
    let hash = hash2(&hash, &msg.ephemeral);

    let es = identity.dh(&msg.ephemeral);
    let (chain, key) = kdf2(&chain, &es);
    let initiator_static: [u8; 32] = open(&key, &hash, &msg.static_box)?
        .try_into()
        .map_err(|_| CryptoError::DecryptFailed)?;
    let hash = hash2(&hash, &msg.static_box);

    let ss = identity.dh(&initiator_static);
    let (chain, key) = kdf2(&chain, &ss);
    let timestamp: [u8; TIMESTAMP_SIZE] = open(&key, &hash, &msg.timestamp_box)?
        .try_into()
        .map_err(|_| CryptoError::DecryptFailed)?;
    let hash = hash2(&hash, &msg.timestamp_box);

    Ok(ConsumedInitiation {
        initiator_static,
        timestamp,
        state: HandshakeState::InitiationConsumed {
            remote_index: msg.sender,
            remote_ephemeral: msg.ephemeral,
            initiator_static,
            hash,
            chain_key: chain,
        },
    })
}

/// Create a handshake response from consumed-initiation state, returning
/// the message and the responder's session keys.
///
/// MAC fields are zero; the caller seals them before sending.
///
/// # Errors
///
/// Returns [`CryptoError::HandshakeState`] if `state` is not
/// `InitiationConsumed`, or [`CryptoError::EncryptFailed`] on a sealing
/// failure.
pub fn create_response(
    state: &HandshakeState,
    local_index: u32,
) -> Result<(MessageResponse, SessionKeys), CryptoError> {
    let HandshakeState::InitiationConsumed {
        remote_index,
        remote_ephemeral,
        initiator_static,
        hash,
        chain_key,
    } = state
    else {
        return Err(CryptoError::HandshakeState(
            "no initiation consumed".into(),
        ));
    };

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral).to_bytes();

    let chain = kdf1(chain_key, &ephemeral_pub);
    let hash = hash2(hash, &ephemeral_pub);

    let ee = ephemeral
        .diffie_hellman(&PublicKey::from(*remote_ephemeral))
        .to_bytes();
    let chain = kdf1(&chain, &ee);
    let se = ephemeral
        .diffie_hellman(&PublicKey::from(*initiator_static))
        .to_bytes();
    let chain = kdf1(&chain, &se);

    let (chain, key) = kdf2(&chain, &[]);
    let empty_box = seal(&key, &hash, &[])?;

    let (initiator_to_responder, responder_to_initiator) = kdf2(&chain, &[]);

    let msg = MessageResponse {
        sender: local_index,
        receiver: *remote_index,
        ephemeral: ephemeral_pub,
        empty_box: empty_box
            .try_into()
            .map_err(|_| CryptoError::EncryptFailed)?,
        mac1: [0u8; 16],
        mac2: [0u8; 16],
    };
    let keys = SessionKeys {
        receive: initiator_to_responder,
        send: responder_to_initiator,
        local_index,
        remote_index: *remote_index,
    };
    Ok((msg, keys))
}

/// Consume a handshake response against pending initiation state,
/// returning the initiator's session keys.
///
/// # Errors
///
/// Returns [`CryptoError::HandshakeState`] if no initiation is pending or
/// the response addresses a different exchange, and
/// [`CryptoError::DecryptFailed`] if key confirmation fails.
pub fn consume_response(
    identity: &Identity,
    state: &HandshakeState,
    msg: &MessageResponse,
) -> Result<SessionKeys, CryptoError> {
    let HandshakeState::InitiationSent {
        local_index,
        ephemeral,
        hash,
        chain_key,
    } = state
    else {
        return Err(CryptoError::HandshakeState("no initiation sent".into()));
    };
    if msg.receiver != *local_index {
        return Err(CryptoError::HandshakeState("receiver index mismatch".into()));
    }

    let chain = kdf1(chain_key, &msg.ephemeral);
    let hash = hash2(hash, &msg.ephemeral);

    let ee = ephemeral
        .diffie_hellman(&PublicKey::from(msg.ephemeral))
        .to_bytes();
    let chain = kdf1(&chain, &ee);
    let se = identity.dh(&msg.ephemeral);
    let chain = kdf1(&chain, &se);

    let (chain, key) = kdf2(&chain, &[]);
    let confirmed = open(&key, &hash, &msg.empty_box)?;
    if !confirmed.is_empty() {
        return Err(CryptoError::DecryptFailed);
    }

    let (initiator_to_responder, responder_to_initiator) = kdf2(&chain, &[]);
    Ok(SessionKeys {
        receive: responder_to_initiator,
        send: initiator_to_responder,
        local_index: *local_index,
        remote_index: msg.sender,
    })
}
