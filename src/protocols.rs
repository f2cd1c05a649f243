//! Protocol trait definition for the overlay's RPC collaborator.
//!
//! The trait abstracts over the underlying transport: the protocol engines
//! depend only on [`OverlayRpc`], never on a concrete client, so the same
//! code runs over a network transport in production and over an in-memory
//! router in tests.
//!
//! ## RPC Surface
//!
//! | Method | Request | Response |
//! |--------|---------|----------|
//! | `version` | protocol version, addresses, public key PEM | empty |
//! | `get_addresses` | empty | address records |
//! | `send_addresses` | address records | empty |
//! | `register` | public key PEM | certificate |
//! | `add_member` | encrypted payload | empty |
//! | `kick_member` | encrypted payload | empty |
//! | `group_message` | encrypted payload | empty |
//!
//! ## Collaborator Contract
//!
//! Implementations provide reliable request/response delivery and enforce a
//! uniform per-call timeout of [`DEFAULT_RPC_TIMEOUT`]. A timeout surfaces
//! as an ordinary error; this layer never retries, recovery comes from the
//! next gossip round.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::messages::{AddressRecord, VersionRequest};

/// Client-side timeout implementations apply to every call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Outbound RPC operations against another node, addressed by its
/// "host:port" location.
#[async_trait]
pub trait OverlayRpc: Send + Sync + 'static {
    /// Initiate or reciprocate a Version handshake.
    async fn version(&self, to: &str, request: VersionRequest) -> Result<()>;

    /// Fetch the remote node's full address book.
    async fn get_addresses(&self, to: &str) -> Result<Vec<AddressRecord>>;

    /// Push a batch of address records for anti-entropy merging.
    async fn send_addresses(&self, to: &str, batch: Vec<AddressRecord>) -> Result<()>;

    /// Ask a certificate-authority node to sign our public key PEM.
    /// Returns the certificate (the CA's signature over the PEM text).
    async fn register(&self, to: &str, public_key_pem: String) -> Result<String>;

    /// Deliver an encrypted group-membership add payload.
    async fn add_member(&self, to: &str, payload: String) -> Result<()>;

    /// Deliver an encrypted group-membership removal payload.
    async fn kick_member(&self, to: &str, payload: String) -> Result<()>;

    /// Deliver an encrypted group chat message.
    async fn group_message(&self, to: &str, payload: String) -> Result<()>;
}
