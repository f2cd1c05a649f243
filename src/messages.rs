//! # Wire Protocol Messages
//!
//! Serializable types for the overlay's RPC surface. The transport
//! collaborator moves these as request/response payloads; the one payload
//! serialized inside the protocol itself is [`GroupChange`], which travels
//! as JSON text wrapped in per-recipient asymmetric encryption.

use serde::{Deserialize, Serialize};

/// A gossiped address record: a network location and when its owner was
/// last seen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    /// "host:port" string identifying a node on the overlay.
    pub location: String,
    /// Wire timestamp of the most recent observation.
    pub last_seen: u32,
}

/// The Version handshake request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VersionRequest {
    /// Sender's protocol version. A mismatch is silently ignored.
    pub protocol_version: u32,
    /// The receiver's location as the sender knows it.
    pub addr_you: String,
    /// The sender's own location.
    pub addr_me: String,
    /// SPKI PEM encoding of the sender's public key.
    pub public_key_pem: String,
}

/// A group membership change, sent asymmetrically encrypted to each
/// recipient.
///
/// For an add, `members` carries the full member-address list including the
/// sender; for a kick or a departure it carries only the removed address.
/// `key` is the regenerated group key; `sig_over_key` is the sender's
/// signature over it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupChange {
    /// The sender's CA-issued certificate.
    pub certificate: String,
    /// Member addresses: the full post-change list for an add, the single
    /// removed address for a kick or departure.
    pub members: Vec<String>,
    /// The new base64-encoded group key.
    pub key: String,
    /// Hex signature over `key` by the sender's identity key.
    pub sig_over_key: String,
}

impl GroupChange {
    /// Serialize to the JSON text that gets encrypted per recipient.
    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a decrypted JSON payload.
    pub fn deserialize(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_change_json_round_trip() {
        let change = GroupChange {
            certificate: "cert".into(),
            members: vec!["a:1".into(), "b:2".into()],
            key: "a2V5".into(),
            sig_over_key: "deadbeef".into(),
        };
        let text = change.serialize().expect("serialize must succeed");
        let parsed = GroupChange::deserialize(&text).expect("deserialize must succeed");
        assert_eq!(parsed.members, change.members);
        assert_eq!(parsed.key, change.key);
        assert_eq!(parsed.sig_over_key, change.sig_over_key);
    }

    #[test]
    fn group_change_rejects_malformed_json() {
        assert!(GroupChange::deserialize("{not json").is_err());
    }
}
