//! # Address Book
//!
//! A bounded, synchronized store of known network locations. An entry is
//! created the first time a location is observed, either from an inbound
//! Version handshake or from a gossiped address batch, and only ever leaves
//! the store with a full node teardown.
//!
//! The store also owns the pending-handshake bookkeeping used to
//! de-duplicate concurrent Version exchanges: [`AddressBook::mark_version_pending`]
//! is an atomic check-and-set over the per-entry `version_sent_at` stamp.
//!
//! ## Capacity
//!
//! Capacity overflow rejects the insert rather than evicting: gossip churn
//! must not be able to push out locations that back confirmed peers.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::messages::AddressRecord;

// ============================================================================
// Error Types
// ============================================================================

/// Errors from the bounded stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store is full; the entry was rejected.
    CapacityExceeded(usize),
    /// An entry with the same location already exists.
    Duplicate(String),
    /// No entry with this location exists.
    UnknownLocation(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CapacityExceeded(cap) => write!(f, "store is at capacity ({cap})"),
            Self::Duplicate(loc) => write!(f, "entry for {loc} already exists"),
            Self::UnknownLocation(loc) => write!(f, "no entry for {loc}"),
        }
    }
}

impl std::error::Error for StoreError {}

// ============================================================================
// Address
// ============================================================================

/// A known network location and when it was last seen.
#[derive(Debug, Clone)]
pub struct Address {
    /// "host:port" string, the entry's identity.
    pub location: String,
    /// Wire timestamp of the most recent observation.
    pub last_seen: u32,
    /// When we last initiated a Version handshake to this location.
    /// Local bookkeeping only, never serialized.
    pub version_sent_at: Option<Instant>,
}

impl Address {
    pub fn new(location: impl Into<String>, last_seen: u32) -> Self {
        Self {
            location: location.into(),
            last_seen,
            version_sent_at: None,
        }
    }
}

// ============================================================================
// AddressBook
// ============================================================================

/// Bounded `location -> Address` store. All methods are atomic with respect
/// to concurrent callers.
pub struct AddressBook {
    entries: RwLock<HashMap<String, Address>>,
    capacity: usize,
}

impl AddressBook {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Insert a new address.
    ///
    /// # Errors
    /// Rejects duplicates and inserts beyond capacity.
    pub fn add(&self, address: Address) -> Result<(), StoreError> {
        let mut entries = self.entries.write().expect("address book lock poisoned");
        if entries.contains_key(&address.location) {
            return Err(StoreError::Duplicate(address.location));
        }
        if entries.len() >= self.capacity {
            return Err(StoreError::CapacityExceeded(self.capacity));
        }
        entries.insert(address.location.clone(), address);
        Ok(())
    }

    pub fn get(&self, location: &str) -> Option<Address> {
        self.entries
            .read()
            .expect("address book lock poisoned")
            .get(location)
            .cloned()
    }

    pub fn contains(&self, location: &str) -> bool {
        self.entries
            .read()
            .expect("address book lock poisoned")
            .contains_key(location)
    }

    /// Overwrite the last-seen stamp of an existing entry.
    ///
    /// # Errors
    /// Fails if the location is unknown.
    pub fn update_last_seen(&self, location: &str, last_seen: u32) -> Result<(), StoreError> {
        let mut entries = self.entries.write().expect("address book lock poisoned");
        match entries.get_mut(location) {
            Some(address) => {
                address.last_seen = last_seen;
                Ok(())
            }
            None => Err(StoreError::UnknownLocation(location.to_string())),
        }
    }

    /// Update an existing entry's last-seen stamp, or insert a new entry.
    /// Used by the Version handler, which must never fail on a repeat
    /// handshake. Insertion can still be rejected at capacity.
    pub fn touch(&self, location: &str, last_seen: u32) -> Result<(), StoreError> {
        let mut entries = self.entries.write().expect("address book lock poisoned");
        if let Some(address) = entries.get_mut(location) {
            address.last_seen = last_seen;
            return Ok(());
        }
        if entries.len() >= self.capacity {
            return Err(StoreError::CapacityExceeded(self.capacity));
        }
        entries.insert(location.to_string(), Address::new(location, last_seen));
        Ok(())
    }

    /// Atomically check whether a Version handshake to `location` is still
    /// pending (sent within `timeout`) and, if not, record one as sent now.
    ///
    /// Returns `true` when the caller should proceed with the handshake,
    /// `false` when a recent handshake is still in flight. Unknown locations
    /// return `false`; the address must be recorded first.
    pub fn mark_version_pending(&self, location: &str, timeout: Duration) -> bool {
        let mut entries = self.entries.write().expect("address book lock poisoned");
        let Some(address) = entries.get_mut(location) else {
            return false;
        };
        let now = Instant::now();
        if let Some(sent_at) = address.version_sent_at {
            if now.duration_since(sent_at) < timeout {
                return false;
            }
        }
        address.version_sent_at = Some(now);
        true
    }

    /// Snapshot of all entries.
    pub fn list(&self) -> Vec<Address> {
        self.entries
            .read()
            .expect("address book lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of all entries in wire form.
    pub fn serialize(&self) -> Vec<AddressRecord> {
        self.entries
            .read()
            .expect("address book lock poisoned")
            .values()
            .map(|a| AddressRecord {
                location: a.location.clone(),
                last_seen: a.last_seen,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("address book lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
