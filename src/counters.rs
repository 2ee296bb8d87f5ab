// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Named counters for the discovery engine.
//!
//! Counters are plain in-process values owned by the engine loop; an
//! exporter can pull a snapshot through the engine handle. Monotonic
//! counters only ever grow; gauges are overwritten on each periodic
//! refresh.

use std::collections::BTreeMap;

/// Counter key constants. Drop reasons use the `invalid_hello.` prefix so
/// dashboards can aggregate them.
pub mod keys {
    pub const LOOPED_PACKET: &str = "invalid_hello.looped_packet";
    pub const DIFFERENT_DOMAIN: &str = "invalid_hello.different_domain";
    pub const INVALID_VERSION: &str = "invalid_hello.invalid_version";
    pub const MISSING_V4_ADDR: &str = "invalid_hello.missing_v4_addr";
    pub const DIFFERENT_SUBNET: &str = "invalid_hello.different_subnet";

    pub const HOP_LIMIT_REJECTED: &str = "hop_limit_rejected";
    pub const PACKET_RECV: &str = "hello_packet_recv";
    pub const PACKET_RECV_SIZE: &str = "hello_packet_recv_size";
    pub const PACKET_DROPPED: &str = "hello_packet_dropped";
    pub const PACKET_PROCESSED: &str = "hello_packet_processed";

    pub const HELLO_PACKETS_SENT: &str = "hello.packets_sent";
    pub const HELLO_BYTES_SENT: &str = "hello.bytes_sent";
    pub const HANDSHAKE_PACKETS_SENT: &str = "handshake.packets_sent";
    pub const HANDSHAKE_BYTES_SENT: &str = "handshake.bytes_sent";
    pub const HEARTBEAT_PACKETS_SENT: &str = "heartbeat.packets_sent";
    pub const HEARTBEAT_BYTES_SENT: &str = "heartbeat.bytes_sent";

    pub const NEIGHBOR_NO_AREA: &str = "neighbor_no_area";
    pub const NEIGHBOR_MULTIPLE_AREA: &str = "neighbor_multiple_area";

    pub const NUM_TRACKED_INTERFACES: &str = "num_tracked_interfaces";
    pub const NUM_TRACKED_NEIGHBORS: &str = "num_tracked_neighbors";
    pub const NUM_ADJACENT_NEIGHBORS: &str = "num_adjacent_neighbors";
    pub const MY_SEQ_NUM: &str = "my_seq_num";
}

/// Counter store. Keys are stable strings; per-neighbor gauges embed the
/// neighbor and interface names.
#[derive(Debug, Default)]
pub struct Counters {
    values: BTreeMap<String, u64>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a monotonic counter by one.
    pub fn bump(&mut self, key: &str) {
        self.bump_by(key, 1);
    }

    /// Increment a monotonic counter.
    pub fn bump_by(&mut self, key: &str, amount: u64) {
        *self.values.entry(key.to_string()).or_insert(0) += amount;
    }

    /// Overwrite a gauge.
    pub fn set_gauge(&mut self, key: &str, value: u64) {
        self.values.insert(key.to_string(), value);
    }

    /// Overwrite a gauge with a dynamically built key (per-neighbor values).
    pub fn set_gauge_owned(&mut self, key: String, value: u64) {
        self.values.insert(key, value);
    }

    pub fn get(&self, key: &str) -> u64 {
        self.values.get(key).copied().unwrap_or(0)
    }

    /// Copy of all counters, for queries and tests.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.values.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_accumulates() {
        let mut counters = Counters::new();
        counters.bump(keys::PACKET_RECV);
        counters.bump(keys::PACKET_RECV);
        counters.bump_by(keys::PACKET_RECV_SIZE, 512);
        assert_eq!(counters.get(keys::PACKET_RECV), 2);
        assert_eq!(counters.get(keys::PACKET_RECV_SIZE), 512);
    }

    #[test]
    fn test_unknown_key_reads_zero() {
        let counters = Counters::new();
        assert_eq!(counters.get(keys::LOOPED_PACKET), 0);
    }

    #[test]
    fn test_gauge_overwrites() {
        let mut counters = Counters::new();
        counters.set_gauge(keys::NUM_TRACKED_NEIGHBORS, 3);
        counters.set_gauge(keys::NUM_TRACKED_NEIGHBORS, 1);
        assert_eq!(counters.get(keys::NUM_TRACKED_NEIGHBORS), 1);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut counters = Counters::new();
        counters.bump(keys::PACKET_PROCESSED);
        let snap = counters.snapshot();
        counters.bump(keys::PACKET_PROCESSED);
        assert_eq!(snap.get(keys::PACKET_PROCESSED), Some(&1));
        assert_eq!(counters.get(keys::PACKET_PROCESSED), 2);
    }
}
