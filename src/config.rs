//! Node configuration.
//!
//! A [`Config`] is fixed at node construction and shared read-only by every
//! component. Capacities bound the in-memory stores; timeouts govern the
//! handshake de-duplication window and the membership join grace period.

use std::time::Duration;

/// Configuration shared by all components of a node.
#[derive(Debug, Clone)]
pub struct Config {
    /// Protocol version exchanged in the Version handshake. Nodes with a
    /// different version are silently ignored.
    pub protocol_version: u32,
    /// Maximum number of entries in the address book.
    pub addr_capacity: usize,
    /// Maximum number of confirmed peers.
    pub peer_capacity: usize,
    /// Window during which a second Version handshake to the same location
    /// is suppressed.
    pub handshake_timeout: Duration,
    /// How long an inbound AddMember handler waits for handshakes with
    /// newly listed members to land before resolving them against the peer
    /// table.
    pub join_grace: Duration,
    /// Number of random peers a newly-informative address batch is
    /// forwarded to.
    pub gossip_fanout: usize,
    /// Maximum number of concurrently in-flight outbound dispatch tasks.
    pub dispatch_pool: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol_version: 0,
            addr_capacity: 1000,
            peer_capacity: 200,
            handshake_timeout: Duration::from_secs(2),
            join_grace: Duration::from_secs(1),
            gossip_fanout: 2,
            dispatch_pool: 32,
        }
    }
}
