//! Shared test harness: an in-memory transport standing in for the RPC
//! collaborator.
//!
//! The [`Router`] keeps a registry of nodes keyed by location and delivers
//! each outbound call straight to the target node's inbound handler, under
//! the same per-call timeout contract a real transport would enforce. Calls
//! to unregistered locations fail like an unreachable host.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::time::timeout;

use huddle::{
    AddressRecord, Config, Identity, Node, OverlayRpc, VersionRequest, DEFAULT_RPC_TIMEOUT,
};

/// In-memory RPC router connecting test nodes.
pub struct Router {
    nodes: RwLock<HashMap<String, Arc<Node<Router>>>>,
    /// Per-router identity pool: reuse the (expensive) keypair for a given
    /// location within a single test, while keeping mutable identity state
    /// (e.g. the certificate slot) isolated between tests.
    identities: RwLock<HashMap<String, Arc<Identity>>>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            identities: RwLock::new(HashMap::new()),
        })
    }

    /// Create a node and register it as reachable.
    pub fn spawn_node(self: &Arc<Self>, location: &str) -> Arc<Node<Router>> {
        self.spawn_node_with_config(location, test_config())
    }

    pub fn spawn_node_with_config(
        self: &Arc<Self>,
        location: &str,
        config: Config,
    ) -> Arc<Node<Router>> {
        let node = Arc::new(Node::with_identity(
            location.to_string(),
            config,
            self.pooled_identity(location),
            self.clone(),
        ));
        self.nodes
            .write()
            .expect("router lock poisoned")
            .insert(location.to_string(), node.clone());
        node
    }

    /// Identities are expensive (2048-bit RSA keygen), so each location
    /// reuses one generated on first request within this router.
    fn pooled_identity(&self, location: &str) -> Arc<Identity> {
        if let Some(identity) = self
            .identities
            .read()
            .expect("identity pool lock poisoned")
            .get(location)
        {
            return identity.clone();
        }
        let identity = Arc::new(Identity::generate().expect("keygen must succeed"));
        self.identities
            .write()
            .expect("identity pool lock poisoned")
            .entry(location.to_string())
            .or_insert(identity)
            .clone()
    }

    fn node(&self, location: &str) -> Result<Arc<Node<Router>>> {
        self.nodes
            .read()
            .expect("router lock poisoned")
            .get(location)
            .cloned()
            .ok_or_else(|| anyhow!("{location} is unreachable"))
    }
}

#[async_trait]
impl OverlayRpc for Router {
    async fn version(&self, to: &str, request: VersionRequest) -> Result<()> {
        let node = self.node(to)?;
        node.handle_version(request);
        Ok(())
    }

    async fn get_addresses(&self, to: &str) -> Result<Vec<AddressRecord>> {
        let node = self.node(to)?;
        Ok(node.handle_get_addresses())
    }

    async fn send_addresses(&self, to: &str, batch: Vec<AddressRecord>) -> Result<()> {
        let node = self.node(to)?;
        node.handle_send_addresses(batch);
        Ok(())
    }

    async fn register(&self, to: &str, public_key_pem: String) -> Result<String> {
        let node = self.node(to)?;
        Ok(node.handle_register(&public_key_pem))
    }

    async fn add_member(&self, to: &str, payload: String) -> Result<()> {
        let node = self.node(to)?;
        // The only handler that takes real time (join grace); honor the
        // collaborator's call-timeout contract.
        timeout(DEFAULT_RPC_TIMEOUT, node.handle_add_member(&payload))
            .await
            .context("add_member call timed out")
    }

    async fn kick_member(&self, to: &str, payload: String) -> Result<()> {
        let node = self.node(to)?;
        node.handle_kick_member(&payload);
        Ok(())
    }

    async fn group_message(&self, to: &str, payload: String) -> Result<()> {
        let node = self.node(to)?;
        node.handle_group_message(&payload);
        Ok(())
    }
}

/// Test configuration: production shape, but a short join grace so suites
/// stay fast.
pub fn test_config() -> Config {
    Config {
        join_grace: Duration::from_millis(200),
        ..Config::default()
    }
}

/// Poll until `condition` holds or the deadline passes.
pub async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Complete a mutual handshake between two registered nodes.
pub async fn peer_up(a: &Arc<Node<Router>>, b: &Arc<Node<Router>>) {
    a.connect(b.local_addr());
    wait_for("mutual handshake", || {
        a.peer_table().contains(b.local_addr()) && b.peer_table().contains(a.local_addr())
    })
    .await;
}
