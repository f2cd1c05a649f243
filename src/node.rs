//! # High-Level Node API
//!
//! A [`Node`] combines the overlay components (identity, address book, peer
//! table, gossip engine, group manager) into a single unified interface.
//! It owns no sockets: an embedding transport adapter implements
//! [`OverlayRpc`](crate::protocols::OverlayRpc) for outbound calls and
//! routes inbound requests to the `handle_*` methods here.
//!
//! ## Quick Start
//!
//! ```ignore
//! // rpc: your transport's OverlayRpc implementation
//! let node = Node::new("myhost:4040".into(), Config::default(), rpc)?;
//!
//! // Join the overlay through a known location
//! node.connect("bootstrap:4040");
//!
//! // Group messaging once peers are confirmed
//! node.create_group();
//! node.add_member("friend:4040")?;
//! node.send_group_message("hello")?;
//!
//! // Receive messages via the take-once receiver
//! let mut rx = node.messages().await.unwrap();
//! while let Some(msg) = rx.recv().await {
//!     println!("got: {}", msg.plaintext);
//! }
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::addrbook::AddressBook;
use crate::config::Config;
use crate::crypto::{self, CryptoError};
use crate::gossip::GossipEngine;
use crate::group::{GroupError, GroupManager, ReceivedMessage};
use crate::identity::Identity;
use crate::messages::{AddressRecord, VersionRequest};
use crate::peertable::PeerTable;
use crate::protocols::OverlayRpc;

/// A receiver that can be taken exactly once via [`Node::messages`].
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

/// A transport-free overlay node.
pub struct Node<R: OverlayRpc> {
    local_addr: String,
    identity: Arc<Identity>,
    addrbook: Arc<AddressBook>,
    peers: Arc<PeerTable>,
    gossip: Arc<GossipEngine<R>>,
    group: GroupManager<R>,
    rpc: Arc<R>,
    received_rx: TakeOnce<ReceivedMessage>,
}

impl<R: OverlayRpc> Node<R> {
    /// Create a node with a fresh identity.
    ///
    /// # Errors
    /// Fails only if identity key generation fails.
    pub fn new(local_addr: String, config: Config, rpc: Arc<R>) -> Result<Self, CryptoError> {
        let identity = Arc::new(Identity::generate()?);
        Ok(Self::with_identity(local_addr, config, identity, rpc))
    }

    /// Create a node with an existing identity. Key generation is slow
    /// enough that embedders may want to reuse one across restarts.
    pub fn with_identity(
        local_addr: String,
        config: Config,
        identity: Arc<Identity>,
        rpc: Arc<R>,
    ) -> Self {
        let addrbook = Arc::new(AddressBook::new(config.addr_capacity));
        let peers = Arc::new(PeerTable::new(config.peer_capacity));
        let dispatch = Arc::new(Semaphore::new(config.dispatch_pool));

        let gossip = Arc::new(GossipEngine::new(
            local_addr.clone(),
            config.clone(),
            identity.clone(),
            addrbook.clone(),
            peers.clone(),
            rpc.clone(),
            dispatch.clone(),
        ));
        let (group, received_rx) = GroupManager::new(
            local_addr.clone(),
            config,
            identity.clone(),
            peers.clone(),
            gossip.clone(),
            rpc.clone(),
            dispatch,
        );

        debug!(addr = %local_addr, "node ready");
        Self {
            local_addr,
            identity,
            addrbook,
            peers,
            gossip,
            group,
            rpc,
            received_rx: tokio::sync::Mutex::new(Some(received_rx)),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn address_book(&self) -> &Arc<AddressBook> {
        &self.addrbook
    }

    pub fn peer_table(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    pub fn gossip(&self) -> &Arc<GossipEngine<R>> {
        &self.gossip
    }

    pub fn group(&self) -> &GroupManager<R> {
        &self.group
    }

    /// Take the receiver surfacing decrypted group messages. Returns `None`
    /// after the first call.
    pub async fn messages(&self) -> Option<mpsc::Receiver<ReceivedMessage>> {
        self.received_rx.lock().await.take()
    }

    // ========================================================================
    // Local Operations
    // ========================================================================

    /// Fire a Version handshake at a location to join the overlay.
    pub fn connect(&self, location: &str) -> JoinHandle<()> {
        self.gossip.connect(location)
    }

    /// Announce our own location to every confirmed peer.
    pub fn announce_self(&self) {
        self.gossip.announce_self()
    }

    /// Pull and merge a peer's address book.
    pub async fn pull_addresses(&self, from: &str) -> anyhow::Result<()> {
        self.gossip.pull_addresses(from).await
    }

    /// Create this node's group.
    pub fn create_group(&self) {
        self.group.create_group()
    }

    /// Add a confirmed peer to the group. See [`GroupManager::add_member`].
    pub fn add_member(&self, location: &str) -> Result<Vec<JoinHandle<()>>, GroupError> {
        self.group.add_member(location)
    }

    /// Remove a member from the group. See [`GroupManager::kick_member`].
    pub fn kick_member(&self, location: &str) -> Result<Vec<JoinHandle<()>>, GroupError> {
        self.group.kick_member(location)
    }

    /// Announce our departure and rotate the key for those who remain.
    pub fn leave_group(&self) -> Result<Vec<JoinHandle<()>>, GroupError> {
        self.group.leave_group()
    }

    /// Send an encrypted chat message to every group member.
    pub fn send_group_message(&self, text: &str) -> Result<Vec<JoinHandle<()>>, GroupError> {
        self.group.send_message(text)
    }

    /// Ask a certificate-authority peer to sign our public key.
    ///
    /// The returned certificate is verified against the CA's already-known
    /// public key before it is stored; an invalid certificate is rejected
    /// and the node stays uncertified.
    ///
    /// # Errors
    /// Fails if the CA is not a confirmed peer. Network and verification
    /// failures inside the spawned task are logged only.
    pub fn register_with_ca(&self, ca_location: &str) -> anyhow::Result<JoinHandle<()>> {
        let Some(ca) = self.peers.get(ca_location) else {
            anyhow::bail!("cannot register with {ca_location} without a completed handshake");
        };

        let rpc = self.rpc.clone();
        let identity = self.identity.clone();
        let pem = identity.public_key_pem().to_string();
        Ok(tokio::spawn(async move {
            match rpc.register(&ca.location, pem.clone()).await {
                Err(e) => warn!(ca = %ca.location, error = %e, "CA registration got no response"),
                Ok(certificate) => {
                    if crypto::verify(&ca.public_key, &pem, &certificate) {
                        debug!(ca = %ca.location, "stored CA certificate");
                        identity.set_certificate(certificate);
                    } else {
                        warn!(ca = %ca.location, "rejecting certificate that fails verification");
                    }
                }
            }
        }))
    }

    // ========================================================================
    // Inbound Handlers (called by the transport adapter)
    // ========================================================================

    /// Inbound Version handshake.
    pub fn handle_version(&self, request: VersionRequest) {
        self.gossip.handle_version(request)
    }

    /// Inbound GetAddresses request.
    pub fn handle_get_addresses(&self) -> Vec<AddressRecord> {
        self.gossip.handle_get_addresses()
    }

    /// Inbound SendAddresses batch.
    pub fn handle_send_addresses(&self, batch: Vec<AddressRecord>) {
        self.gossip.handle_send_addresses(batch)
    }

    /// Inbound CA registration: sign the submitted PEM text with our
    /// identity key. A signing failure is logged and yields an empty
    /// certificate, which no verifying client will accept.
    pub fn handle_register(&self, public_key_pem: &str) -> String {
        match self.identity.sign(public_key_pem) {
            Ok(certificate) => certificate,
            Err(e) => {
                warn!(error = %e, "could not sign registration");
                String::new()
            }
        }
    }

    /// Inbound encrypted membership add.
    pub async fn handle_add_member(&self, payload: &str) {
        self.group.handle_add_member(payload).await
    }

    /// Inbound encrypted membership removal.
    pub fn handle_kick_member(&self, payload: &str) {
        self.group.handle_kick_member(payload)
    }

    /// Inbound encrypted chat message.
    pub fn handle_group_message(&self, payload: &str) {
        self.group.handle_group_message(payload)
    }
}
