// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Wire protocol for neighbor discovery.
//!
//! Three message kinds ride a common envelope: `Hello` (periodic discovery
//! and timestamp reflection), `Handshake` (parameter negotiation) and
//! `Heartbeat` (liveness keep-alive). Exactly one of the three is present
//! per packet. Messages are serde-JSON encoded and must fit in the minimum
//! IPv6 MTU so that MTU discovery is never needed.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// The minimum IPv6 MTU. Packets larger than this are rejected on both the
/// send and receive paths.
pub const MAX_PACKET_SIZE: usize = 1280;

/// Timestamps a peer reflects back for one of its known neighbors, letting
/// that neighbor compute RTT without synchronized clocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectedNeighborInfo {
    /// Last sequence number seen from this neighbor.
    pub seq_num: u64,
    /// Send timestamp of the neighbor's last hello, as reported by the
    /// neighbor itself (microseconds since epoch).
    pub last_nbr_msg_sent_ts_us: u64,
    /// Local receive timestamp of that hello (microseconds since epoch).
    pub last_my_msg_rcvd_ts_us: u64,
}

/// Periodic multicast hello: identity, liveness sequence and the reflected
/// view of every neighbor heard on the interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMsg {
    pub node_name: String,
    pub domain_name: String,
    /// Sender's name for the interface the hello went out on.
    pub if_name: String,
    pub seq_num: u64,
    pub version: u32,
    /// Send timestamp in microseconds since epoch.
    pub sent_ts_us: u64,
    /// Set during fast-init; receivers reply immediately for convergence.
    pub solicit_response: bool,
    /// Set when the sender is about to restart gracefully.
    pub restarting: bool,
    /// Per-known-neighbor reflected timing, keyed by node name. A BTreeMap
    /// keeps encoding deterministic.
    pub neighbor_infos: BTreeMap<String, ReflectedNeighborInfo>,
}

/// Point-to-point negotiation message, multicast but addressed to one
/// neighbor via `neighbor_node_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMsg {
    pub node_name: String,
    /// Intended receiver; other nodes ignore the message. Absent for
    /// peers that predate targeted handshakes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neighbor_node_name: Option<String>,
    /// Whether the sender already considers the adjacency established.
    /// Receivers do not reply when set, which breaks reply ping-pong.
    pub is_adj_established: bool,
    /// Heartbeat hold time the sender asks us to honor, in milliseconds.
    pub hold_time_ms: u64,
    /// Graceful-restart window the sender asks us to honor, in milliseconds.
    pub graceful_restart_time_ms: u64,
    pub transport_address_v4: Option<Ipv4Addr>,
    pub transport_address_v6: Option<Ipv6Addr>,
    /// Key-value store control port.
    pub kvstore_port: u16,
    /// Management control port.
    pub ctrl_port: u16,
    /// Area the sender deduced for the receiver.
    pub area: String,
}

/// Cheap keep-alive refreshing the heartbeat hold timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMsg {
    pub node_name: String,
    pub seq_num: u64,
}

/// Envelope carrying exactly one message variant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hello: Option<HelloMsg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<HandshakeMsg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HeartbeatMsg>,
}

impl Envelope {
    pub fn from_hello(msg: HelloMsg) -> Self {
        Self {
            hello: Some(msg),
            ..Default::default()
        }
    }

    pub fn from_handshake(msg: HandshakeMsg) -> Self {
        Self {
            handshake: Some(msg),
            ..Default::default()
        }
    }

    pub fn from_heartbeat(msg: HeartbeatMsg) -> Self {
        Self {
            heartbeat: Some(msg),
            ..Default::default()
        }
    }

    fn variant_count(&self) -> usize {
        self.hello.is_some() as usize
            + self.handshake.is_some() as usize
            + self.heartbeat.is_some() as usize
    }

    /// Serialize for transmission. Fails if the encoding exceeds
    /// [`MAX_PACKET_SIZE`]; oversized packets must never hit the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self).context("failed to encode packet")?;
        if bytes.len() > MAX_PACKET_SIZE {
            bail!(
                "encoded packet is {} bytes, exceeding the {} byte limit",
                bytes.len(),
                MAX_PACKET_SIZE
            );
        }
        Ok(bytes)
    }

    /// Parse a received packet and enforce the exactly-one-variant rule.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_PACKET_SIZE {
            bail!(
                "received packet is {} bytes, exceeding the {} byte limit",
                bytes.len(),
                MAX_PACKET_SIZE
            );
        }
        let envelope: Envelope =
            serde_json::from_slice(bytes).context("failed to decode packet")?;
        match envelope.variant_count() {
            1 => Ok(envelope),
            n => bail!("envelope carries {} message variants, expected exactly 1", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hello() -> HelloMsg {
        HelloMsg {
            node_name: "node-1".to_string(),
            domain_name: "dc1".to_string(),
            if_name: "eth0".to_string(),
            seq_num: 42,
            version: 20260801,
            sent_ts_us: 1_700_000_000_000_000,
            solicit_response: true,
            restarting: false,
            neighbor_infos: [(
                "node-2".to_string(),
                ReflectedNeighborInfo {
                    seq_num: 7,
                    last_nbr_msg_sent_ts_us: 1_700_000_000_000_100,
                    last_my_msg_rcvd_ts_us: 1_700_000_000_000_200,
                },
            )]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn test_hello_roundtrip() {
        let envelope = Envelope::from_hello(sample_hello());
        let bytes = envelope.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn test_handshake_roundtrip() {
        let envelope = Envelope::from_handshake(HandshakeMsg {
            node_name: "node-1".to_string(),
            neighbor_node_name: Some("node-2".to_string()),
            is_adj_established: false,
            hold_time_ms: 9000,
            graceful_restart_time_ms: 30000,
            transport_address_v4: Some("10.0.0.1".parse().unwrap()),
            transport_address_v6: Some("fe80::1".parse().unwrap()),
            kvstore_port: 60001,
            ctrl_port: 2018,
            area: "0".to_string(),
        });
        let bytes = envelope.encode().unwrap();
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_decode_rejects_empty_envelope() {
        let bytes = serde_json::to_vec(&Envelope::default()).unwrap();
        assert!(Envelope::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_multiple_variants() {
        let envelope = Envelope {
            hello: Some(sample_hello()),
            heartbeat: Some(HeartbeatMsg {
                node_name: "node-1".to_string(),
                seq_num: 1,
            }),
            handshake: None,
        };
        let bytes = serde_json::to_vec(&envelope).unwrap();
        assert!(Envelope::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Envelope::decode(b"not json at all").is_err());
    }

    #[test]
    fn test_encode_enforces_size_limit() {
        let mut hello = sample_hello();
        // Blow well past the IPv6 minimum MTU with reflected entries.
        for i in 0..64 {
            hello.neighbor_infos.insert(
                format!("very-long-neighbor-node-name-number-{i:04}"),
                ReflectedNeighborInfo::default(),
            );
        }
        assert!(Envelope::from_hello(hello).encode().is_err());
    }

    #[test]
    fn test_handshake_without_target_decodes() {
        // Peers predating targeted handshakes omit the field entirely.
        let raw = serde_json::json!({
            "handshake": {
                "node_name": "node-9",
                "is_adj_established": true,
                "hold_time_ms": 9000,
                "graceful_restart_time_ms": 30000,
                "transport_address_v4": null,
                "transport_address_v6": "fe80::9",
                "kvstore_port": 60001,
                "ctrl_port": 2018,
                "area": "0",
            }
        });
        let envelope = Envelope::decode(raw.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.handshake.unwrap().neighbor_node_name, None);
    }
}
