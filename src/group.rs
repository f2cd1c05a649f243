//! # Group Manager
//!
//! Owns the node's single group: the member list, the current symmetric
//! key, and its derived AEAD cipher. Every membership change (add, kick,
//! leave) rotates the key and distributes it, asymmetrically encrypted per
//! recipient, inside a [`GroupChange`] payload; chat traffic travels under
//! the group's AEAD cipher.
//!
//! ## Key Atomicity
//!
//! The key and cipher live in one [`GroupKey`] replaced under a single
//! write lock, so a concurrent sender always encrypts under a fully-formed
//! pair, never a half-rotated one.
//!
//! ## Convergence
//!
//! Distribution is fire-and-forget with at-most-once delivery; membership
//! is eventually consistent. An inbound add lists the full membership, an
//! inbound kick or departure lists exactly the removed address. A receiver
//! of an add handshakes with members it has not confirmed yet and waits a
//! short grace period for those handshakes to land before resolving them
//! against the peer table.
//!
//! ## Trust Model
//!
//! Any holder of the current group key can change membership and will be
//! obeyed. Recipients do not verify the signature carried in a membership
//! change: the payload names the sender's certificate but not its public
//! key, so there is nothing sound to check it against.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Config;
use crate::crypto::{self, CryptoError, GroupKey};
use crate::gossip::GossipEngine;
use crate::identity::Identity;
use crate::messages::GroupChange;
use crate::peertable::{Peer, PeerTable};
use crate::protocols::OverlayRpc;

/// Capacity of the received-plaintext channel. Messages arriving while the
/// consumer lags beyond this are dropped with a log line.
const RECEIVED_CHANNEL_SIZE: usize = 64;

// ============================================================================
// Error Types
// ============================================================================

/// Errors from local group operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    /// The target is not a confirmed peer; no network call was made.
    NotPeered(String),
    /// No group has been created on this node.
    NoGroup,
    /// A local cryptographic step failed.
    Crypto(CryptoError),
}

impl std::fmt::Display for GroupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotPeered(loc) => write!(f, "{loc} is not a confirmed peer"),
            Self::NoGroup => write!(f, "no group exists on this node"),
            Self::Crypto(e) => write!(f, "group crypto failure: {e}"),
        }
    }
}

impl std::error::Error for GroupError {}

/// A decrypted group chat message surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub plaintext: String,
}

/// Which RPC carries a membership change to its recipients.
enum ChangeKind {
    Add,
    Kick,
}

/// The group state proper: membership in join order plus the current key.
/// Key and cipher are one unit; see module docs.
struct GroupState {
    members: Vec<Peer>,
    key: Option<GroupKey>,
}

// ============================================================================
// GroupManager
// ============================================================================

/// Membership and key-rotation engine for the node's single group.
pub struct GroupManager<R: OverlayRpc> {
    local_addr: String,
    config: Config,
    identity: Arc<Identity>,
    peers: Arc<PeerTable>,
    gossip: Arc<GossipEngine<R>>,
    rpc: Arc<R>,
    group: RwLock<Option<GroupState>>,
    received_tx: mpsc::Sender<ReceivedMessage>,
    dispatch: Arc<Semaphore>,
}

impl<R: OverlayRpc> GroupManager<R> {
    /// Build a manager and the receiver surfacing decrypted chat messages.
    pub fn new(
        local_addr: String,
        config: Config,
        identity: Arc<Identity>,
        peers: Arc<PeerTable>,
        gossip: Arc<GossipEngine<R>>,
        rpc: Arc<R>,
        dispatch: Arc<Semaphore>,
    ) -> (Self, mpsc::Receiver<ReceivedMessage>) {
        let (received_tx, received_rx) = mpsc::channel(RECEIVED_CHANNEL_SIZE);
        (
            Self {
                local_addr,
                config,
                identity,
                peers,
                gossip,
                rpc,
                group: RwLock::new(None),
                received_tx,
                dispatch,
            },
            received_rx,
        )
    }

    fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let dispatch = self.dispatch.clone();
        tokio::spawn(async move {
            let Ok(_permit) = dispatch.acquire().await else {
                return;
            };
            task.await;
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Whether a group exists on this node.
    pub fn has_group(&self) -> bool {
        self.group.read().expect("group lock poisoned").is_some()
    }

    /// Snapshot of member locations in join order.
    pub fn members(&self) -> Vec<String> {
        self.group
            .read()
            .expect("group lock poisoned")
            .as_ref()
            .map(|g| g.members.iter().map(|m| m.location.clone()).collect())
            .unwrap_or_default()
    }

    /// The current encoded group key, if one has been established.
    pub fn current_key(&self) -> Option<String> {
        self.group
            .read()
            .expect("group lock poisoned")
            .as_ref()
            .and_then(|g| g.key.as_ref().map(|k| k.encoded.clone()))
    }

    // ========================================================================
    // Local Operations
    // ========================================================================

    /// Create an empty group with no key. Replaces any previous group.
    pub fn create_group(&self) {
        *self.group.write().expect("group lock poisoned") = Some(GroupState {
            members: Vec::new(),
            key: None,
        });
        debug!("created group");
    }

    /// Add a confirmed peer to the group and rotate the key.
    ///
    /// Sends the full post-add member list (including self) and the new key
    /// to every member, each on its own task. Returned handles complete
    /// when the corresponding delivery attempt has finished; they exist for
    /// test determinism, correctness never depends on awaiting them.
    ///
    /// # Errors
    /// [`GroupError::NotPeered`] if the target has not completed a
    /// handshake, [`GroupError::NoGroup`] before `create_group`.
    pub fn add_member(&self, location: &str) -> Result<Vec<JoinHandle<()>>, GroupError> {
        let peer = self
            .peers
            .get(location)
            .ok_or_else(|| GroupError::NotPeered(location.to_string()))?;
        let new_key = crypto::generate_sym_key().map_err(GroupError::Crypto)?;

        let (members, key_encoded) = {
            let mut guard = self.group.write().expect("group lock poisoned");
            let group = guard.as_mut().ok_or(GroupError::NoGroup)?;
            if !group.members.iter().any(|m| m.location == peer.location) {
                group.members.push(peer);
            }
            group.key = Some(new_key.clone());
            (group.members.clone(), new_key.encoded)
        };
        debug!(member = %location, "added member and rotated group key");

        let mut member_addrs: Vec<String> =
            members.iter().map(|m| m.location.clone()).collect();
        member_addrs.push(self.local_addr.clone());

        let change = self.build_change(member_addrs, key_encoded)?;
        Ok(self.distribute(&members, &change, ChangeKind::Add))
    }

    /// Remove a confirmed peer from the group and rotate the key.
    ///
    /// The remaining members receive a removal delta naming only the
    /// kicked address, plus the new key.
    pub fn kick_member(&self, location: &str) -> Result<Vec<JoinHandle<()>>, GroupError> {
        if !self.peers.contains(location) {
            return Err(GroupError::NotPeered(location.to_string()));
        }
        let new_key = crypto::generate_sym_key().map_err(GroupError::Crypto)?;

        let (remaining, key_encoded) = {
            let mut guard = self.group.write().expect("group lock poisoned");
            let group = guard.as_mut().ok_or(GroupError::NoGroup)?;
            group.members.retain(|m| m.location != location);
            group.key = Some(new_key.clone());
            (group.members.clone(), new_key.encoded)
        };
        debug!(member = %location, "kicked member and rotated group key");

        let change = self.build_change(vec![location.to_string()], key_encoded)?;
        Ok(self.distribute(&remaining, &change, ChangeKind::Kick))
    }

    /// Leave the group: announce our own departure as a removal delta and
    /// rotate the key so the remaining members converge on a secret we no
    /// longer hold locally.
    pub fn leave_group(&self) -> Result<Vec<JoinHandle<()>>, GroupError> {
        let new_key = crypto::generate_sym_key().map_err(GroupError::Crypto)?;

        let (remaining, key_encoded) = {
            let mut guard = self.group.write().expect("group lock poisoned");
            let group = guard.as_mut().ok_or(GroupError::NoGroup)?;
            group.members.retain(|m| m.location != self.local_addr);
            group.key = Some(new_key.clone());
            (group.members.clone(), new_key.encoded)
        };
        debug!("leaving group");

        let change = self.build_change(vec![self.local_addr.clone()], key_encoded)?;
        Ok(self.distribute(&remaining, &change, ChangeKind::Kick))
    }

    /// Encrypt a chat message under the current group cipher and send it to
    /// every member concurrently. No delivery acknowledgment is tracked.
    pub fn send_message(&self, text: &str) -> Result<Vec<JoinHandle<()>>, GroupError> {
        let (members, key) = {
            let guard = self.group.read().expect("group lock poisoned");
            let group = guard.as_ref().ok_or(GroupError::NoGroup)?;
            (group.members.clone(), group.key.clone())
        };
        let Some(key) = key else {
            // A keyless group has no members to talk to yet.
            return Ok(Vec::new());
        };

        let mut handles = Vec::with_capacity(members.len());
        for member in members {
            let ciphertext = match crypto::sym_encrypt(&key.cipher, text.as_bytes()) {
                Ok(c) => c,
                Err(e) => {
                    warn!(to = %member.location, error = %e, "could not encrypt group message");
                    continue;
                }
            };
            let rpc = self.rpc.clone();
            handles.push(self.spawn(async move {
                if let Err(e) = rpc.group_message(&member.location, ciphertext).await {
                    warn!(to = %member.location, error = %e, "group message delivery failed");
                }
            }));
        }
        Ok(handles)
    }

    fn build_change(
        &self,
        member_addrs: Vec<String>,
        key_encoded: String,
    ) -> Result<GroupChange, GroupError> {
        let sig_over_key = self.identity.sign(&key_encoded).map_err(GroupError::Crypto)?;
        Ok(GroupChange {
            certificate: self.identity.certificate().unwrap_or_default(),
            members: member_addrs,
            key: key_encoded,
            sig_over_key,
        })
    }

    /// Encrypt a membership change for each recipient and dispatch it, one
    /// task per recipient. Per-member failures are logged only; delivery to
    /// the rest proceeds.
    fn distribute(
        &self,
        recipients: &[Peer],
        change: &GroupChange,
        kind: ChangeKind,
    ) -> Vec<JoinHandle<()>> {
        let payload_text = match change.serialize() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "could not serialize membership change");
                return Vec::new();
            }
        };

        let mut handles = Vec::with_capacity(recipients.len());
        for member in recipients {
            let encrypted = match crypto::asym_encrypt(&member.public_key, payload_text.as_bytes())
            {
                Ok(c) => c,
                Err(e) => {
                    warn!(to = %member.location, error = %e, "could not encrypt membership change");
                    continue;
                }
            };
            let rpc = self.rpc.clone();
            let to = member.location.clone();
            handles.push(match kind {
                ChangeKind::Add => self.spawn(async move {
                    if let Err(e) = rpc.add_member(&to, encrypted).await {
                        warn!(to = %to, error = %e, "add-member delivery failed");
                    }
                }),
                ChangeKind::Kick => self.spawn(async move {
                    if let Err(e) = rpc.kick_member(&to, encrypted).await {
                        warn!(to = %to, error = %e, "kick-member delivery failed");
                    }
                }),
            });
        }
        handles
    }

    // ========================================================================
    // Inbound Handlers
    // ========================================================================

    /// Decrypt and parse an inbound membership payload. Failures are logged
    /// and yield `None`; the message is dropped.
    fn decrypt_change(&self, payload: &str) -> Option<GroupChange> {
        let plaintext = match crypto::asym_decrypt(self.identity.private_key(), payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "could not decrypt membership change");
                return None;
            }
        };
        let text = match String::from_utf8(plaintext) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "membership change is not valid text");
                return None;
            }
        };
        match GroupChange::deserialize(&text) {
            Ok(change) => Some(change),
            Err(e) => {
                warn!(error = %e, "could not parse membership change");
                return None;
            }
        }
    }

    /// Handle an inbound add: adopt the listed membership and the new key.
    ///
    /// Creates the group state if this node had none (it is being pulled
    /// into a group it did not create). Unconfirmed newcomers get a Version
    /// handshake and one grace period to land before resolution; addresses
    /// still unconfirmed afterwards are skipped and will arrive with a
    /// later change.
    pub async fn handle_add_member(&self, payload: &str) {
        let Some(change) = self.decrypt_change(payload) else {
            return;
        };

        let local: HashSet<String> = self.members().into_iter().collect();
        let newcomers: Vec<String> = change
            .members
            .iter()
            .filter(|m| **m != self.local_addr && !local.contains(*m))
            .cloned()
            .collect();

        let mut awaiting_handshake = false;
        for addr in &newcomers {
            if !self.peers.contains(addr) {
                self.gossip.connect(addr);
                awaiting_handshake = true;
            }
        }
        if awaiting_handshake {
            tokio::time::sleep(self.config.join_grace).await;
        }

        let new_key = match crypto::derive_cipher(&change.key) {
            Ok(k) => k,
            Err(e) => {
                warn!(error = %e, "membership change carried an unusable key");
                return;
            }
        };

        {
            let mut guard = self.group.write().expect("group lock poisoned");
            let group = guard.get_or_insert_with(|| GroupState {
                members: Vec::new(),
                key: None,
            });
            for addr in &newcomers {
                if group.members.iter().any(|m| m.location == *addr) {
                    continue;
                }
                match self.peers.get(addr) {
                    Some(peer) => {
                        group.members.push(peer);
                        debug!(member = %addr, "adopted new group member");
                    }
                    None => {
                        debug!(member = %addr, "newcomer still unconfirmed, skipping");
                    }
                }
            }
            group.key = Some(new_key);
        }
    }

    /// Handle an inbound kick or departure: drop the named address and
    /// adopt the new key.
    pub fn handle_kick_member(&self, payload: &str) {
        let Some(change) = self.decrypt_change(payload) else {
            return;
        };
        let Some(target) = change.members.first() else {
            warn!("removal delta named no address");
            return;
        };

        let new_key = match crypto::derive_cipher(&change.key) {
            Ok(k) => k,
            Err(e) => {
                warn!(error = %e, "membership change carried an unusable key");
                return;
            }
        };

        let mut guard = self.group.write().expect("group lock poisoned");
        let Some(group) = guard.as_mut() else {
            debug!("removal delta but no local group");
            return;
        };
        group.members.retain(|m| m.location != *target);
        group.key = Some(new_key);
        debug!(member = %target, "removed group member and adopted rotated key");
    }

    /// Handle an inbound chat message: decrypt under the current cipher and
    /// surface the plaintext. Undecryptable messages are logged and dropped.
    pub fn handle_group_message(&self, payload: &str) {
        let key = {
            let guard = self.group.read().expect("group lock poisoned");
            guard.as_ref().and_then(|g| g.key.clone())
        };
        let Some(key) = key else {
            debug!("chat message arrived before any group key");
            return;
        };

        let plaintext = match crypto::sym_decrypt(&key.cipher, payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "could not decrypt group message");
                return;
            }
        };
        match String::from_utf8(plaintext) {
            Ok(text) => {
                debug!(len = text.len(), "received group message");
                if self.received_tx.try_send(ReceivedMessage { plaintext: text }).is_err() {
                    warn!("received-message channel full, dropping message");
                }
            }
            Err(e) => warn!(error = %e, "group message is not valid text"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrbook::AddressBook;
    use crate::messages::{AddressRecord, VersionRequest};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::OnceLock;

    /// RPC stub that accepts everything and answers nothing.
    struct NullRpc;

    #[async_trait]
    impl crate::protocols::OverlayRpc for NullRpc {
        async fn version(&self, _to: &str, _request: VersionRequest) -> Result<()> {
            Ok(())
        }
        async fn get_addresses(&self, _to: &str) -> Result<Vec<AddressRecord>> {
            Ok(Vec::new())
        }
        async fn send_addresses(&self, _to: &str, _batch: Vec<AddressRecord>) -> Result<()> {
            Ok(())
        }
        async fn register(&self, _to: &str, _pem: String) -> Result<String> {
            Ok(String::new())
        }
        async fn add_member(&self, _to: &str, _payload: String) -> Result<()> {
            Ok(())
        }
        async fn kick_member(&self, _to: &str, _payload: String) -> Result<()> {
            Ok(())
        }
        async fn group_message(&self, _to: &str, _payload: String) -> Result<()> {
            Ok(())
        }
    }

    fn shared_identity() -> Arc<Identity> {
        static IDENTITY: OnceLock<Arc<Identity>> = OnceLock::new();
        IDENTITY
            .get_or_init(|| Arc::new(Identity::generate().expect("keygen must succeed")))
            .clone()
    }

    fn manager() -> (GroupManager<NullRpc>, Arc<PeerTable>) {
        let config = Config::default();
        let identity = shared_identity();
        let addrbook = Arc::new(AddressBook::new(config.addr_capacity));
        let peers = Arc::new(PeerTable::new(config.peer_capacity));
        let rpc = Arc::new(NullRpc);
        let dispatch = Arc::new(Semaphore::new(config.dispatch_pool));
        let gossip = Arc::new(GossipEngine::new(
            "me:1".into(),
            config.clone(),
            identity.clone(),
            addrbook,
            peers.clone(),
            rpc.clone(),
            dispatch.clone(),
        ));
        let (group, _rx) = GroupManager::new(
            "me:1".into(),
            config,
            identity.clone(),
            peers.clone(),
            gossip,
            rpc,
            dispatch,
        );
        peers
            .add(Peer::new("b:2", 1, 0, identity.public_key().clone()))
            .unwrap();
        peers
            .add(Peer::new("c:3", 1, 0, identity.public_key().clone()))
            .unwrap();
        (group, peers)
    }

    #[tokio::test]
    async fn add_member_requires_group_and_peering() {
        let (group, _) = manager();
        assert_eq!(
            group.add_member("b:2").unwrap_err(),
            GroupError::NoGroup
        );
        group.create_group();
        assert!(matches!(
            group.add_member("stranger:9"),
            Err(GroupError::NotPeered(_))
        ));
        assert!(group.members().is_empty(), "failed add must not change membership");
    }

    #[tokio::test]
    async fn membership_stays_unique_under_repeated_adds() {
        let (group, _) = manager();
        group.create_group();
        for _ in 0..3 {
            group.add_member("b:2").expect("add must succeed");
        }
        group.add_member("c:3").expect("add must succeed");
        assert_eq!(group.members(), ["b:2", "c:3"], "join order, no duplicates");
    }

    #[tokio::test]
    async fn every_membership_change_rotates_the_key() {
        let (group, _) = manager();
        group.create_group();
        assert!(group.current_key().is_none());

        group.add_member("b:2").unwrap();
        let key_after_add = group.current_key().expect("add must install a key");

        group.add_member("c:3").unwrap();
        let key_after_second = group.current_key().unwrap();
        assert_ne!(key_after_add, key_after_second);

        group.kick_member("c:3").unwrap();
        let key_after_kick = group.current_key().unwrap();
        assert_ne!(key_after_second, key_after_kick);
        assert_eq!(group.members(), ["b:2"]);

        group.leave_group().unwrap();
        assert_ne!(key_after_kick, group.current_key().unwrap());
    }

    #[tokio::test]
    async fn send_message_without_group_fails() {
        let (group, _) = manager();
        assert_eq!(group.send_message("hi").unwrap_err(), GroupError::NoGroup);
    }
}
