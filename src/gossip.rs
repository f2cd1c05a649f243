//! # Gossip Engine
//!
//! Runs the two discovery protocols of the overlay:
//!
//! - **Version handshake**: the mutual exchange that promotes a bare
//!   address into a confirmed peer with a known protocol version and
//!   public key.
//! - **Address anti-entropy**: GetAddresses/SendAddresses rounds that merge
//!   divergent address knowledge and re-broadcast newly learned records to
//!   a small random sample of peers, spreading them epidemically.
//!
//! ## Handshake De-duplication
//!
//! Two nodes that Version each other concurrently would otherwise loop
//! reciprocal handshakes. The handler only reciprocates when the atomic
//! pending check-and-set on the address book entry succeeds; outbound
//! [`GossipEngine::connect`] never touches the pending stamp, so a
//! first-contact exchange converges after one reciprocal round trip.
//!
//! ## Merge Policy
//!
//! Anti-entropy merging is monotone: a stored last-seen stamp is only ever
//! replaced by a strictly newer one, so merging batches in any order
//! converges on the maximum. Only wholly unknown locations count as new
//! information and trigger re-broadcast; fresher stamps for known peers do
//! not, which keeps already-converged regions of the overlay quiet.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::addrbook::{Address, AddressBook};
use crate::config::Config;
use crate::identity::{now_secs, Identity};
use crate::messages::{AddressRecord, VersionRequest};
use crate::peertable::{Peer, PeerTable};
use crate::protocols::OverlayRpc;
use crate::crypto;

/// Discovery-protocol engine. Cheap to share behind an `Arc`; all state
/// lives in the injected stores.
pub struct GossipEngine<R: OverlayRpc> {
    local_addr: String,
    config: Config,
    identity: Arc<Identity>,
    addrbook: Arc<AddressBook>,
    peers: Arc<PeerTable>,
    rpc: Arc<R>,
    dispatch: Arc<Semaphore>,
}

impl<R: OverlayRpc> GossipEngine<R> {
    pub fn new(
        local_addr: String,
        config: Config,
        identity: Arc<Identity>,
        addrbook: Arc<AddressBook>,
        peers: Arc<PeerTable>,
        rpc: Arc<R>,
        dispatch: Arc<Semaphore>,
    ) -> Self {
        Self {
            local_addr,
            config,
            identity,
            addrbook,
            peers,
            rpc,
            dispatch,
        }
    }

    /// Spawn a fire-and-forget task on the bounded dispatch pool.
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

    fn version_request_for(&self, to: &str) -> VersionRequest {
        VersionRequest {
            protocol_version: self.config.protocol_version,
            addr_you: to.to_string(),
            addr_me: self.local_addr.clone(),
            public_key_pem: self.identity.public_key_pem().to_string(),
        }
    }

    // ========================================================================
    // Inbound Handlers
    // ========================================================================

    /// Handle an inbound Version handshake.
    ///
    /// A protocol-version mismatch is dropped silently. Otherwise the
    /// sender's address is upserted, its public key decoded, and, when the
    /// sender is not yet a confirmed peer and no handshake to it is already
    /// pending, it is registered and a reciprocal Version call goes out.
    pub fn handle_version(&self, request: VersionRequest) {
        if request.protocol_version != self.config.protocol_version {
            debug!(
                from = %request.addr_me,
                theirs = request.protocol_version,
                ours = self.config.protocol_version,
                "dropping handshake with mismatched protocol version"
            );
            return;
        }

        let now = now_secs();
        if let Err(e) = self.addrbook.touch(&request.addr_me, now) {
            warn!(from = %request.addr_me, error = %e, "could not record handshake address");
            return;
        }

        let public_key = match crypto::decode_public_key(&request.public_key_pem) {
            Ok(key) => key,
            Err(e) => {
                warn!(from = %request.addr_me, error = %e, "handshake carried an undecodable public key");
                return;
            }
        };

        if self.peers.contains(&request.addr_me) {
            return;
        }
        // Atomic check-and-set: exactly one of any concurrent handlers for
        // this location wins the right to reciprocate.
        if !self
            .addrbook
            .mark_version_pending(&request.addr_me, self.config.handshake_timeout)
        {
            return;
        }

        let peer = Peer::new(
            request.addr_me.clone(),
            now,
            request.protocol_version,
            public_key,
        );
        if let Err(e) = self.peers.add(peer) {
            warn!(from = %request.addr_me, error = %e, "could not register peer");
            return;
        }
        debug!(peer = %request.addr_me, "confirmed new peer");

        let rpc = self.rpc.clone();
        let reply = self.version_request_for(&request.addr_me);
        let to = request.addr_me;
        self.spawn(async move {
            if let Err(e) = rpc.version(&to, reply).await {
                debug!(to = %to, error = %e, "reciprocal handshake got no response");
            }
        });
    }

    /// Handle an inbound GetAddresses request: the full address book in
    /// wire form.
    pub fn handle_get_addresses(&self) -> Vec<AddressRecord> {
        self.addrbook.serialize()
    }

    /// Handle an inbound SendAddresses batch: anti-entropy merge, handshake
    /// re-attempts, and epidemic re-broadcast when the batch taught us
    /// something new.
    pub fn handle_send_addresses(&self, batch: Vec<AddressRecord>) {
        let mut found_new = false;
        for record in &batch {
            if record.location == self.local_addr {
                continue;
            }

            if let Some(peer) = self.peers.get(&record.location) {
                // Confirmed peers merge freshness but never count as new
                // information; they are past the discovery stage.
                if peer.last_seen < record.last_seen {
                    if let Err(e) = self.peers.update_last_seen(&record.location, record.last_seen)
                    {
                        warn!(location = %record.location, error = %e, "peer freshness update failed");
                    }
                    // Keep the address book in step so GetAddresses serves
                    // the freshest stamp we know.
                    let _ = self
                        .addrbook
                        .update_last_seen(&record.location, record.last_seen);
                }
            } else if let Some(known) = self.addrbook.get(&record.location) {
                if known.last_seen < record.last_seen {
                    if let Err(e) = self
                        .addrbook
                        .update_last_seen(&record.location, record.last_seen)
                    {
                        warn!(location = %record.location, error = %e, "address freshness update failed");
                    }
                }
            } else {
                match self
                    .addrbook
                    .add(Address::new(record.location.clone(), record.last_seen))
                {
                    Ok(()) => found_new = true,
                    Err(e) => debug!(location = %record.location, error = %e, "gossiped address not stored"),
                }
            }

            // Re-attempt a handshake toward every gossiped address; this is
            // what promotes newly learned locations into full peers.
            self.connect(&record.location);
        }

        if found_new {
            let targets = self
                .peers
                .sample_excluding(self.config.gossip_fanout, &[self.local_addr.as_str()]);
            for target in targets {
                let rpc = self.rpc.clone();
                let forwarded = batch.clone();
                self.spawn(async move {
                    if let Err(e) = rpc.send_addresses(&target.location, forwarded).await {
                        debug!(to = %target.location, error = %e, "address re-broadcast got no response");
                    }
                });
            }
        }
    }

    // ========================================================================
    // Outbound Operations
    // ========================================================================

    /// Fire a Version handshake at a location. Fire-and-forget; a silent
    /// remote is normal during discovery.
    pub fn connect(&self, location: &str) -> JoinHandle<()> {
        let rpc = self.rpc.clone();
        let request = self.version_request_for(location);
        let to = location.to_string();
        self.spawn(async move {
            if let Err(e) = rpc.version(&to, request).await {
                debug!(to = %to, error = %e, "version handshake got no response");
            }
        })
    }

    /// Announce our own location to every confirmed peer.
    pub fn announce_self(&self) {
        let record = AddressRecord {
            location: self.local_addr.clone(),
            last_seen: now_secs(),
        };
        for peer in self.peers.list() {
            let rpc = self.rpc.clone();
            let batch = vec![record.clone()];
            self.spawn(async move {
                if let Err(e) = rpc.send_addresses(&peer.location, batch).await {
                    debug!(to = %peer.location, error = %e, "self announcement got no response");
                }
            });
        }
    }

    /// Pull a peer's address book and merge it; one anti-entropy round in
    /// the pull direction.
    pub async fn pull_addresses(&self, from: &str) -> anyhow::Result<()> {
        let batch = self.rpc.get_addresses(from).await?;
        self.handle_send_addresses(batch);
        Ok(())
    }
}
