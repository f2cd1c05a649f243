//! # Peer Table
//!
//! A bounded, synchronized store of confirmed peers. A [`Peer`] always
//! corresponds to a completed, mutually-acknowledged Version handshake: the
//! gossip engine inserts one only after validating the sender's protocol
//! version and public key. Peers are never removed by the protocol; only a
//! full node teardown clears the table.
//!
//! The table supports uniform random sampling with exclusions, used to pick
//! the fan-out targets for epidemic address re-broadcast.

use std::collections::HashMap;
use std::sync::RwLock;

use rand::seq::IteratorRandom;
use rsa::RsaPublicKey;

use crate::addrbook::StoreError;
use crate::messages::AddressRecord;

/// A confirmed peer: a location with a known protocol version and public key.
#[derive(Debug, Clone)]
pub struct Peer {
    /// "host:port" string, the entry's identity.
    pub location: String,
    /// Wire timestamp of the most recent observation.
    pub last_seen: u32,
    /// Protocol version the peer announced in its Version handshake.
    pub protocol_version: u32,
    /// The peer's public key, decoded from the handshake PEM.
    pub public_key: RsaPublicKey,
}

impl Peer {
    pub fn new(
        location: impl Into<String>,
        last_seen: u32,
        protocol_version: u32,
        public_key: RsaPublicKey,
    ) -> Self {
        Self {
            location: location.into(),
            last_seen,
            protocol_version,
            public_key,
        }
    }
}

/// Bounded `location -> Peer` store. All methods are atomic with respect to
/// concurrent callers.
pub struct PeerTable {
    entries: RwLock<HashMap<String, Peer>>,
    capacity: usize,
}

impl PeerTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Insert a newly confirmed peer.
    ///
    /// # Errors
    /// Rejects duplicates and inserts beyond capacity.
    pub fn add(&self, peer: Peer) -> Result<(), StoreError> {
        let mut entries = self.entries.write().expect("peer table lock poisoned");
        if entries.contains_key(&peer.location) {
            return Err(StoreError::Duplicate(peer.location));
        }
        if entries.len() >= self.capacity {
            return Err(StoreError::CapacityExceeded(self.capacity));
        }
        entries.insert(peer.location.clone(), peer);
        Ok(())
    }

    pub fn get(&self, location: &str) -> Option<Peer> {
        self.entries
            .read()
            .expect("peer table lock poisoned")
            .get(location)
            .cloned()
    }

    pub fn contains(&self, location: &str) -> bool {
        self.entries
            .read()
            .expect("peer table lock poisoned")
            .contains_key(location)
    }

    /// Overwrite the last-seen stamp of an existing peer.
    ///
    /// # Errors
    /// Fails if the location is unknown.
    pub fn update_last_seen(&self, location: &str, last_seen: u32) -> Result<(), StoreError> {
        let mut entries = self.entries.write().expect("peer table lock poisoned");
        match entries.get_mut(location) {
            Some(peer) => {
                peer.last_seen = last_seen;
                Ok(())
            }
            None => Err(StoreError::UnknownLocation(location.to_string())),
        }
    }

    /// Snapshot of all peers.
    pub fn list(&self) -> Vec<Peer> {
        self.entries
            .read()
            .expect("peer table lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of all peers in wire form.
    pub fn serialize(&self) -> Vec<AddressRecord> {
        self.entries
            .read()
            .expect("peer table lock poisoned")
            .values()
            .map(|p| AddressRecord {
                location: p.location.clone(),
                last_seen: p.last_seen,
            })
            .collect()
    }

    /// Up to `n` peers chosen uniformly at random, excluding the given
    /// locations. Used to pick gossip fan-out targets.
    pub fn sample_excluding(&self, n: usize, exclude: &[&str]) -> Vec<Peer> {
        let entries = self.entries.read().expect("peer table lock poisoned");
        entries
            .values()
            .filter(|p| !exclude.contains(&p.location.as_str()))
            .cloned()
            .choose_multiple(&mut rand::thread_rng(), n)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("peer table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use std::sync::OnceLock;

    fn test_public_key() -> RsaPublicKey {
        static KEY: OnceLock<RsaPublicKey> = OnceLock::new();
        KEY.get_or_init(|| {
            let private_key = crypto::generate_keypair().expect("keygen must succeed");
            RsaPublicKey::from(&private_key)
        })
        .clone()
    }

    fn peer(location: &str) -> Peer {
        Peer::new(location, 1, 0, test_public_key())
    }

    #[test]
    fn add_rejects_duplicates_and_overflow() {
        let table = PeerTable::new(2);
        table.add(peer("a:1")).unwrap();
        assert_eq!(
            table.add(peer("a:1")).unwrap_err(),
            StoreError::Duplicate("a:1".into())
        );
        table.add(peer("b:2")).unwrap();
        assert_eq!(
            table.add(peer("c:3")).unwrap_err(),
            StoreError::CapacityExceeded(2)
        );
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn sample_excluding_respects_exclusions_and_count() {
        let table = PeerTable::new(10);
        for loc in ["a:1", "b:2", "c:3", "d:4"] {
            table.add(peer(loc)).unwrap();
        }

        let sample = table.sample_excluding(2, &["a:1"]);
        assert_eq!(sample.len(), 2);
        assert!(sample.iter().all(|p| p.location != "a:1"));

        // Asking for more than available returns everything not excluded.
        let sample = table.sample_excluding(10, &["a:1", "b:2"]);
        let mut locations: Vec<_> = sample.iter().map(|p| p.location.as_str()).collect();
        locations.sort_unstable();
        assert_eq!(locations, ["c:3", "d:4"]);
    }

    #[test]
    fn update_last_seen_unknown_location_fails() {
        let table = PeerTable::new(4);
        assert!(matches!(
            table.update_last_seen("ghost:1", 9),
            Err(StoreError::UnknownLocation(_))
        ));
    }
}
