//! Session index: receiver-id dispatch for transport packets
//!
//! Every installed key pair is addressable by a process-unique 32-bit
//! index; the remote end stamps that index into the transport header and
//! the receiver resolves it here on every data packet. Entries appear when
//! a handshake installs a pair and disappear when rotation retires it.
//!
//! Lookups clone the `Arc`s out of the map, so a resolved key pair remains
//! valid for as long as the caller holds it, regardless of concurrent
//! retirement.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::peer::Peer;
use crate::crypto::KeyPair;

/// One dispatch entry: the owning peer and the key pair.
#[derive(Clone)]
pub struct SessionEntry {
    /// Peer the session belongs to
    pub peer: Arc<Peer>,
    /// Key pair addressed by the index
    pub key_pair: Arc<KeyPair>,
}

/// Process-wide mapping from receiver index to session.
pub struct SessionIndex {
    entries: DashMap<u32, SessionEntry>,
}

impl SessionIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Resolve a receiver index from a transport header.
    #[must_use]
    pub fn lookup(&self, receiver_id: u32) -> Option<SessionEntry> {
        self.entries.get(&receiver_id).map(|e| e.clone())
    }

    /// Install a session under the index the handshake reserved for it.
    /// An index colliding with a stale entry replaces it; handshake index
    /// reservation makes that vanishingly rare.
    pub fn insert(&self, receiver_id: u32, entry: SessionEntry) {
        match self.entries.entry(receiver_id) {
            Entry::Occupied(mut slot) => {
                slot.insert(entry);
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
    }

    /// Retire a session.
    pub fn remove(&self, receiver_id: u32) -> Option<SessionEntry> {
        self.entries.remove(&receiver_id).map(|(_, e)| e)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no sessions are installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SessionIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer() -> Arc<Peer> {
        Arc::new(Peer::new([7u8; 32], None, 16))
    }

    fn make_entry(peer: &Arc<Peer>, index: u32) -> SessionEntry {
        SessionEntry {
            peer: Arc::clone(peer),
            key_pair: Arc::new(KeyPair::new(&[1u8; 32], &[2u8; 32], index, 99, false)),
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let index = SessionIndex::new();
        let peer = test_peer();
        index.insert(42, make_entry(&peer, 42));

        let entry = index.lookup(42).expect("entry must resolve");
        assert_eq!(entry.key_pair.local_index, 42);
        assert_eq!(entry.peer.public_key, [7u8; 32]);
        assert!(index.lookup(43).is_none());
    }

    #[test]
    fn test_lookup_survives_removal() {
        let index = SessionIndex::new();
        let peer = test_peer();
        index.insert(42, make_entry(&peer, 42));

        let held = index.lookup(42).unwrap();
        index.remove(42);
        assert!(index.lookup(42).is_none());
        // The cloned Arcs keep the retired pair alive for the holder.
        assert_eq!(held.key_pair.local_index, 42);
    }

    #[test]
    fn test_insert_replaces_stale_entry() {
        let index = SessionIndex::new();
        let peer = test_peer();
        index.insert(42, make_entry(&peer, 42));
        let replacement = SessionEntry {
            peer: Arc::clone(&peer),
            key_pair: Arc::new(KeyPair::new(&[9u8; 32], &[8u8; 32], 42, 77, true)),
        };
        index.insert(42, replacement);
        assert_eq!(index.len(), 1);
        assert_eq!(index.lookup(42).unwrap().key_pair.remote_index, 77);
    }
}
