//! Protocol cryptography
//!
//! Three concerns live here, each behind a narrow seam consumed by the
//! inbound pipeline:
//!
//! - [`cookie`]: MAC1/MAC2 admission checks and the cookie-reply DoS shield
//! - [`keypair`]: per-session directional AEAD keys with expiry and replay
//!   state
//! - [`handshake`]: a compact x25519 + BLAKE2s handshake that produces
//!   session key pairs from initiation/response exchanges
//!
//! Keyed BLAKE2s serves as both MAC and KDF PRF; ChaCha20-Poly1305 seals
//! handshake fields and transport payloads, XChaCha20-Poly1305 seals cookie
//! replies.

pub mod cookie;
pub mod handshake;
pub mod keypair;

pub use cookie::{CookieChecker, CookieGenerator};
pub use handshake::{ConsumedInitiation, HandshakeState, Identity, SessionKeys};
pub use keypair::KeyPair;

use blake2::digest::consts::{U16, U32};
use blake2::digest::Mac;
use blake2::{Blake2s256, Blake2sMac, Digest};

/// Hash two byte strings into a 32-byte digest.
pub(crate) fn hash2(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2s256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// Keyed BLAKE2s with 16-byte output. Used for MAC1, MAC2 and cookies.
///
/// Keys longer than 32 bytes are not supported by BLAKE2s; all call sites
/// use 16- or 32-byte keys.
pub(crate) fn mac16(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut mac =
        Blake2sMac::<U16>::new_from_slice(key).expect("BLAKE2s accepts keys up to 32 bytes");
    Mac::update(&mut mac, data);
    mac.finalize().into_bytes().into()
}

/// Keyed BLAKE2s with 32-byte output. The PRF underlying the KDF chain.
pub(crate) fn prf(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut mac =
        Blake2sMac::<U32>::new_from_slice(key).expect("BLAKE2s accepts keys up to 32 bytes");
    Mac::update(&mut mac, data);
    mac.finalize().into_bytes().into()
}

/// HKDF-style expansion to one output key.
pub(crate) fn kdf1(key: &[u8; 32], input: &[u8]) -> [u8; 32] {
    let t0 = prf(key, input);
    prf(&t0, &[0x01])
}

/// HKDF-style expansion to two output keys.
pub(crate) fn kdf2(key: &[u8; 32], input: &[u8]) -> ([u8; 32], [u8; 32]) {
    let t0 = prf(key, input);
    let t1 = prf(&t0, &[0x01]);
    let mut buf = [0u8; 33];
    buf[..32].copy_from_slice(&t1);
    buf[32] = 0x02;
    let t2 = prf(&t0, &buf);
    (t1, t2)
}
