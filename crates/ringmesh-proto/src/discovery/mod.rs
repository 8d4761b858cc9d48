//! UDP-broadcast peer discovery with liveness tracking (§4.4).

mod udp;

pub use udp::{DiscoveryConfig, DiscoveryService};

use serde::{Deserialize, Serialize};

use crate::protocol::types::PeerInfo;

/// The JSON form broadcast and listened for on the discovery socket.
/// Unknown keys are ignored on decode (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub node_id: String,
    pub grpc_port: u16,
}

impl DiscoveryMessage {
    pub fn new(node_id: impl Into<String>, grpc_port: u16) -> Self {
        DiscoveryMessage {
            kind: "discovery".to_string(),
            node_id: node_id.into(),
            grpc_port,
        }
    }
}

/// Parse an inbound discovery datagram: JSON when it starts with `{`,
/// otherwise the legacy `<id>:<port>` form (§4.4, §6).
pub fn parse_datagram(payload: &[u8]) -> Option<(String, u16)> {
    let text = std::str::from_utf8(payload).ok()?;
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        let msg: DiscoveryMessage = serde_json::from_str(trimmed).ok()?;
        Some((msg.node_id, msg.grpc_port))
    } else {
        let (id, port) = trimmed.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        if id.is_empty() {
            return None;
        }
        Some((id.to_string(), port))
    }
}

/// Full snapshot of the live peer set, delivered on every mutation.
pub type PeerSnapshot = std::collections::HashMap<String, PeerInfo>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_form_ignoring_unknown_keys() {
        let raw = br#"{"type":"discovery","node_id":"n1","grpc_port":50051,"extra":"ignored"}"#;
        let (id, port) = parse_datagram(raw).unwrap();
        assert_eq!(id, "n1");
        assert_eq!(port, 50051);
    }

    #[test]
    fn parses_legacy_form() {
        let (id, port) = parse_datagram(b"n2:50052").unwrap();
        assert_eq!(id, "n2");
        assert_eq!(port, 50052);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_datagram(b"not a valid datagram").is_none());
        assert!(parse_datagram(b"{not json").is_none());
    }

    proptest::proptest! {
        /// Whatever id/port a node announces, encoding then parsing the
        /// datagram recovers it exactly — the wire round-trip discovery
        /// relies on for idempotent re-announcement (§4.4).
        #[test]
        fn discovery_message_round_trips_through_parse_datagram(
            node_id in "[a-zA-Z0-9_-]{1,32}",
            grpc_port in 1u16..=u16::MAX,
        ) {
            let msg = DiscoveryMessage::new(node_id.clone(), grpc_port);
            let raw = serde_json::to_vec(&msg).unwrap();
            let (id, port) = parse_datagram(&raw).unwrap();
            proptest::prop_assert_eq!(id, node_id);
            proptest::prop_assert_eq!(port, grpc_port);
        }
    }
}
