//! # Huddle - Encrypted Group Messaging over a Gossip Overlay
//!
//! Huddle is a peer-to-peer overlay node library. Nodes discover each other
//! through an epidemic address-exchange protocol, maintain a bounded view of
//! the network, and run an authenticated, encrypted group-messaging protocol
//! with dynamic membership and key rotation on top of that overlay.
//!
//! ## Architecture
//!
//! The protocol engines are generic over an [`OverlayRpc`] collaborator that
//! abstracts the wire transport. The library never opens a socket: an
//! embedding transport adapter delivers inbound requests to the [`Node`]
//! handlers and implements [`OverlayRpc`] for outbound calls.
//!
//! All shared state (address book, peer table, group) lives behind
//! synchronized handles. Outbound network effects are dispatched as
//! fire-and-forget tasks on a bounded pool; per-task failures are logged and
//! never propagated to the initiating call.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API combining all components |
//! | `config` | Protocol version, capacities, timeouts |
//! | `crypto` | RSA-2048 signing/encryption, AES-GCM, key encoding |
//! | `identity` | Node keypair and CA-issued certificate |
//! | `addrbook` | Bounded store of known network locations |
//! | `peertable` | Bounded store of confirmed peers |
//! | `gossip` | Version handshake and address anti-entropy |
//! | `group` | Group membership, key rotation, message fan-out |
//! | `protocols` | The `OverlayRpc` collaborator trait |
//! | `messages` | Serialization types for all wire payloads |
//!
//! ## Security Model
//!
//! - A peer is only confirmed after a mutual Version handshake that carries
//!   its public key.
//! - Group membership changes travel asymmetrically encrypted per recipient;
//!   chat messages travel under the group's AEAD key.
//! - Every membership change rotates the group key; key and cipher are
//!   swapped as one atomic unit.
//! - Any holder of the current group key may change membership. There is no
//!   distinguished owner role.

mod addrbook;
mod config;
pub mod crypto;
mod gossip;
mod group;
mod identity;
mod messages;
mod node;
mod peertable;
mod protocols;

pub use addrbook::{Address, AddressBook, StoreError};
pub use config::Config;
pub use crypto::CryptoError;
pub use gossip::GossipEngine;
pub use group::{GroupError, GroupManager, ReceivedMessage};
pub use identity::Identity;
pub use messages::{AddressRecord, GroupChange, VersionRequest};
pub use node::Node;
pub use peertable::{Peer, PeerTable};
pub use protocols::{OverlayRpc, DEFAULT_RPC_TIMEOUT};
