//! MAC admission checks and cookie-reply DoS mitigation
//!
//! Every handshake message carries two trailing 16-byte MACs. MAC1 is keyed
//! by the recipient's static identity and gates all handshake processing;
//! it is cheap to verify and requires no per-peer state. MAC2 is keyed by a
//! short-lived cookie bound to the sender's source address; it is only
//! demanded while the device is under handshake load, and proves the sender
//! can receive traffic at its claimed address.
//!
//! When a loaded device receives a handshake message with valid MAC1 but no
//! valid MAC2, it answers with a cookie reply: the current cookie for the
//! source address, sealed under a key derived from the device's public
//! identity and bound to the offending message's MAC1. The sender decrypts
//! it and includes MAC2 on its retry. No asymmetric cryptography runs on
//! this path.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use parking_lot::Mutex;
use rand::RngCore;
use subtle::ConstantTimeEq;

use super::{hash2, mac16};
use crate::error::CryptoError;
use crate::message::{MessageCookieReply, COOKIE_SIZE, MACS_SIZE, MAC_SIZE};

/// Domain separation label for the MAC1 key
const LABEL_MAC1: &[u8; 8] = b"mac1----";

/// Domain separation label for the cookie sealing key
const LABEL_COOKIE: &[u8; 8] = b"cookie--";

/// Cookies are valid for this long on both sides
const COOKIE_REFRESH: Duration = Duration::from_secs(120);

fn addr_bytes(addr: &SocketAddr) -> Vec<u8> {
    let mut bytes = match addr.ip() {
        std::net::IpAddr::V4(ip) => ip.octets().to_vec(),
        std::net::IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    bytes.extend_from_slice(&addr.port().to_le_bytes());
    bytes
}

/// Rotating secret from which per-address cookies are derived
struct CookieSecret {
    value: [u8; 32],
    birth: Instant,
}

impl CookieSecret {
    fn fresh() -> Self {
        let mut value = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut value);
        Self {
            value,
            birth: Instant::now(),
        }
    }
}

/// Responder-side MAC verification and cookie-reply creation.
///
/// One checker per device, keyed by the device's static public key. All
/// methods take whole packets; the MAC fields are the trailing
/// [`MACS_SIZE`] bytes.
pub struct CookieChecker {
    /// Key for MAC1: hash(label-mac1 ‖ static public)
    mac1_key: [u8; 32],
    /// XChaCha20-Poly1305 key for sealing cookie replies:
    /// hash(label-cookie ‖ static public)
    cookie_key: [u8; 32],
    secret: Mutex<CookieSecret>,
}

impl CookieChecker {
    /// Create a checker for a device identified by `static_public`.
    #[must_use]
    pub fn new(static_public: &[u8; 32]) -> Self {
        Self {
            mac1_key: hash2(LABEL_MAC1, static_public),
            cookie_key: hash2(LABEL_COOKIE, static_public),
            secret: Mutex::new(CookieSecret::fresh()),
        }
    }

    /// Verify the MAC1 field of a handshake packet.
    #[must_use]
    pub fn check_mac1(&self, packet: &[u8]) -> bool {
        let Some(body_len) = packet.len().checked_sub(MACS_SIZE) else {
            return false;
        };
        let expected = mac16(&self.mac1_key, &packet[..body_len]);
        let actual = &packet[body_len..body_len + MAC_SIZE];
        expected.ct_eq(actual).into()
    }

    /// Verify the MAC2 field of a handshake packet against the cookie for
    /// `addr`.
    #[must_use]
    pub fn check_mac2(&self, packet: &[u8], addr: &SocketAddr) -> bool {
        let Some(body_len) = packet.len().checked_sub(MAC_SIZE) else {
            return false;
        };
        let cookie = self.current_cookie(addr);
        let expected = mac16(&cookie, &packet[..body_len]);
        let actual = &packet[body_len..];
        expected.ct_eq(actual).into()
    }

    /// The current cookie for a source address, rotating the underlying
    /// secret when it has aged out.
    #[must_use]
    pub fn current_cookie(&self, addr: &SocketAddr) -> [u8; COOKIE_SIZE] {
        let mut secret = self.secret.lock();
        if secret.birth.elapsed() > COOKIE_REFRESH {
            *secret = CookieSecret::fresh();
        }
        mac16(&secret.value, &addr_bytes(addr))
    }

    /// Build a cookie reply for a handshake packet that failed the MAC2
    /// check while the device is busy.
    ///
    /// The cookie is sealed with the reply keyed to this device and bound
    /// to the packet's MAC1 as associated data, so only the party that sent
    /// the original message can use it.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptFailed`] if the packet is too short to
    /// carry MACs or sealing fails.
    pub fn create_reply(
        &self,
        packet: &[u8],
        sender: u32,
        addr: &SocketAddr,
    ) -> Result<MessageCookieReply, CryptoError> {
        let Some(body_len) = packet.len().checked_sub(MACS_SIZE) else {
            return Err(CryptoError::EncryptFailed);
        };
        let mac1 = &packet[body_len..body_len + MAC_SIZE];
        let cookie = self.current_cookie(addr);

        let mut nonce = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut nonce);

        let cipher = XChaCha20Poly1305::new((&self.cookie_key).into());
        let sealed = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &cookie,
                    aad: mac1,
                },
            )
            .map_err(|_| CryptoError::EncryptFailed)?;

        Ok(MessageCookieReply {
            receiver: sender,
            nonce,
            cookie_box: sealed.try_into().map_err(|_| CryptoError::EncryptFailed)?,
        })
    }
}

/// State for the initiator side of the cookie exchange
struct GeneratorState {
    /// Last cookie received from the remote, if any
    cookie: Option<[u8; COOKIE_SIZE]>,
    birth: Instant,
    /// MAC1 of the last handshake message sent; binds the next cookie reply
    last_mac1: [u8; MAC_SIZE],
}

/// Initiator-side MAC sealing and cookie-reply consumption.
///
/// One generator per peer, keyed by the remote's static public key. It
/// fills the MAC fields of outgoing handshake messages and absorbs cookie
/// replies so that retries carry a valid MAC2.
pub struct CookieGenerator {
    mac1_key: [u8; 32],
    cookie_key: [u8; 32],
    state: Mutex<GeneratorState>,
}

impl CookieGenerator {
    /// Create a generator for messages addressed to `remote_static_public`.
    #[must_use]
    pub fn new(remote_static_public: &[u8; 32]) -> Self {
        Self {
            mac1_key: hash2(LABEL_MAC1, remote_static_public),
            cookie_key: hash2(LABEL_COOKIE, remote_static_public),
            state: Mutex::new(GeneratorState {
                cookie: None,
                birth: Instant::now(),
                last_mac1: [0u8; MAC_SIZE],
            }),
        }
    }

    /// Fill the trailing MAC fields of an outgoing handshake packet.
    ///
    /// MAC1 is always computed. MAC2 is computed only while a fresh cookie
    /// is held; otherwise it is left zeroed, which the remote treats as
    /// absent.
    pub fn seal_macs(&self, packet: &mut [u8]) {
        let Some(body_len) = packet.len().checked_sub(MACS_SIZE) else {
            return;
        };
        let mac1 = mac16(&self.mac1_key, &packet[..body_len]);
        packet[body_len..body_len + MAC_SIZE].copy_from_slice(&mac1);

        let mut state = self.state.lock();
        state.last_mac1 = mac1;

        let mac2_offset = body_len + MAC_SIZE;
        match state.cookie {
            Some(cookie) if state.birth.elapsed() < COOKIE_REFRESH => {
                let mac2 = mac16(&cookie, &packet[..mac2_offset]);
                packet[mac2_offset..].copy_from_slice(&mac2);
            }
            _ => packet[mac2_offset..].fill(0),
        }
    }

    /// Absorb a cookie reply from the remote.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptFailed`] if the sealed cookie does not
    /// authenticate against the last MAC1 this generator produced.
    pub fn consume_reply(&self, reply: &MessageCookieReply) -> Result<(), CryptoError> {
        let mut state = self.state.lock();
        let cipher = XChaCha20Poly1305::new((&self.cookie_key).into());
        let cookie = cipher
            .decrypt(
                XNonce::from_slice(&reply.nonce),
                Payload {
                    msg: &reply.cookie_box,
                    aad: &state.last_mac1,
                },
            )
            .map_err(|_| CryptoError::DecryptFailed)?;

        state.cookie = Some(cookie.try_into().map_err(|_| CryptoError::DecryptFailed)?);
        state.birth = Instant::now();
        Ok(())
    }

    /// Whether a fresh cookie is currently held.
    #[must_use]
    pub fn has_cookie(&self) -> bool {
        let state = self.state.lock();
        state.cookie.is_some() && state.birth.elapsed() < COOKIE_REFRESH
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MESSAGE_INITIATION_SIZE;

    fn test_addr() -> SocketAddr {
        "192.0.2.1:51820".parse().unwrap()
    }

    fn sealed_packet(generator: &CookieGenerator) -> Vec<u8> {
        let mut packet = vec![0x17u8; MESSAGE_INITIATION_SIZE];
        generator.seal_macs(&mut packet);
        packet
    }

    #[test]
    fn test_mac1_roundtrip() {
        let identity = [9u8; 32];
        let checker = CookieChecker::new(&identity);
        let generator = CookieGenerator::new(&identity);

        let packet = sealed_packet(&generator);
        assert!(checker.check_mac1(&packet));
    }

    #[test]
    fn test_mac1_rejects_tampering() {
        let identity = [9u8; 32];
        let checker = CookieChecker::new(&identity);
        let generator = CookieGenerator::new(&identity);

        let mut packet = sealed_packet(&generator);
        packet[10] ^= 0xFF;
        assert!(!checker.check_mac1(&packet));
    }

    #[test]
    fn test_mac1_rejects_wrong_identity() {
        let checker = CookieChecker::new(&[1u8; 32]);
        let generator = CookieGenerator::new(&[2u8; 32]);
        let packet = sealed_packet(&generator);
        assert!(!checker.check_mac1(&packet));
    }

    #[test]
    fn test_mac2_absent_until_cookie_received() {
        let identity = [9u8; 32];
        let checker = CookieChecker::new(&identity);
        let generator = CookieGenerator::new(&identity);

        let packet = sealed_packet(&generator);
        assert!(!checker.check_mac2(&packet, &test_addr()));
    }

    #[test]
    fn test_cookie_reply_enables_mac2() {
        let identity = [9u8; 32];
        let checker = CookieChecker::new(&identity);
        let generator = CookieGenerator::new(&identity);
        let addr = test_addr();

        // First message has no MAC2; the busy responder answers with a
        // cookie reply instead of queueing it.
        let first = sealed_packet(&generator);
        let reply = checker.create_reply(&first, 42, &addr).unwrap();
        assert_eq!(reply.receiver, 42);

        generator.consume_reply(&reply).unwrap();
        assert!(generator.has_cookie());

        // The retry now carries a MAC2 the checker accepts.
        let retry = sealed_packet(&generator);
        assert!(checker.check_mac1(&retry));
        assert!(checker.check_mac2(&retry, &addr));

        // A different source address fails the check.
        let other: SocketAddr = "192.0.2.2:51820".parse().unwrap();
        assert!(!checker.check_mac2(&retry, &other));
    }

    #[test]
    fn test_cookie_reply_bound_to_mac1() {
        let identity = [9u8; 32];
        let checker = CookieChecker::new(&identity);
        let generator = CookieGenerator::new(&identity);
        let addr = test_addr();

        let packet = sealed_packet(&generator);
        let mut reply = checker.create_reply(&packet, 7, &addr).unwrap();
        reply.cookie_box[0] ^= 0xFF;
        assert!(generator.consume_reply(&reply).is_err());
        assert!(!generator.has_cookie());
    }

    #[test]
    fn test_cookies_differ_per_address() {
        let checker = CookieChecker::new(&[5u8; 32]);
        let a = checker.current_cookie(&"192.0.2.1:1000".parse().unwrap());
        let b = checker.current_cookie(&"192.0.2.1:1001".parse().unwrap());
        assert_ne!(a, b);
    }
}
