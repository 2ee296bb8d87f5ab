// SPDX-License-Identifier: Apache-2.0 OR MIT

//! nbrd — neighbor discovery and liveness engine for a link-state routing
//! stack.
//!
//! The engine discovers directly attached peers over IPv6 link-local
//! multicast on each tracked interface, negotiates per-link parameters
//! (administrative area, hold times, transport addresses), tracks peer
//! liveness with heartbeats, measures round-trip time from reflected
//! timestamps, and publishes adjacency events to downstream consumers.
//!
//! This crate root holds the types crossing the engine boundary: interface
//! database snapshots coming in from the link monitor, and neighbor events
//! going out to route computation and flooding.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

pub mod config;
pub mod counters;
pub mod engine;
pub mod logging;
pub mod wire;

pub use config::Config;

/// An IP network: address plus prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpNetwork {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl IpNetwork {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    /// Whether `ip` falls inside this network. Mixed address families never
    /// match.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                if self.prefix_len >= 32 {
                    return net == addr;
                }
                let mask = !0u32 << (32 - self.prefix_len);
                (u32::from(net) & mask) == (u32::from(addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                if self.prefix_len >= 128 {
                    return net == addr;
                }
                let mask = !0u128 << (128 - self.prefix_len);
                (u128::from(net) & mask) == (u128::from(addr) & mask)
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// One interface as reported by the link monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub is_up: bool,
    pub if_index: u32,
    /// All addresses configured on the interface, any family.
    pub networks: Vec<IpNetwork>,
}

/// A full snapshot of the link monitor's interface view. The engine
/// reconciles each snapshot against its tracked set; feeding the same
/// snapshot twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDatabase {
    /// Name of the node this snapshot belongs to. Must match the engine's
    /// configured node name.
    pub node_name: String,
    pub interfaces: HashMap<String, InterfaceInfo>,
}

/// Kind of adjacency event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeighborEventType {
    NeighborUp,
    NeighborDown,
    NeighborRestarting,
    NeighborRestarted,
    NeighborRttChange,
}

/// Identity and capabilities of a neighbor, as carried in events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborInfo {
    pub node_name: String,
    pub domain_name: String,
    /// The neighbor's own name for the interface it heard us on.
    pub remote_if_name: String,
    pub area: String,
    pub transport_address_v4: Option<Ipv4Addr>,
    pub transport_address_v6: Option<Ipv6Addr>,
    /// Key-value store control port advertised in the handshake.
    pub kvstore_port: u16,
    /// Management control port advertised in the handshake.
    pub ctrl_port: u16,
}

/// Adjacency event published to downstream subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborEvent {
    pub event_type: NeighborEventType,
    /// Local interface the adjacency lives on.
    pub if_name: String,
    pub neighbor: NeighborInfo,
    /// Smoothed RTT in microseconds; 0 until the first sample lands.
    pub rtt_us: i64,
    /// Segment-routing label allocated for this adjacency.
    pub label: u32,
    pub support_flood_optimization: bool,
    pub area: String,
}
