// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Interface tracking.
//!
//! The engine consumes full interface-database snapshots from the link
//! monitor and reconciles them against its tracked set by symmetric
//! difference. The table itself is pure bookkeeping; multicast membership
//! and timer churn happen in the engine loop around the computed plan.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use crate::{InterfaceDatabase, IpNetwork};

/// fe80::/10
fn is_v6_link_local(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
        IpAddr::V4(_) => false,
    }
}

/// One tracked interface.
#[derive(Debug, Clone)]
pub struct TrackedInterface {
    pub if_index: u32,
    /// Lowest IPv4 network on the interface; `None` when v4 is disabled.
    pub v4_network: Option<IpNetwork>,
    /// Lowest IPv6 link-local network on the interface.
    pub v6_link_local_network: IpNetwork,
    /// When tracking started; drives the fast-init hello phase.
    pub tracked_since: Instant,
}

impl TrackedInterface {
    /// Address-level equality, ignoring the tracking timestamp.
    fn same_as(&self, other: &TrackedInterface) -> bool {
        self.if_index == other.if_index
            && self.v4_network == other.v4_network
            && self.v6_link_local_network == other.v6_link_local_network
    }
}

/// Reconciliation plan: which interfaces to start tracking, stop tracking,
/// or update in place.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    pub to_add: Vec<String>,
    pub to_del: Vec<String>,
    /// (name, old ifIndex) pairs whose addresses or index changed. The new
    /// state is in the eligible map the plan was computed against.
    pub to_update: Vec<(String, u32)>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.to_add.is_empty() && self.to_del.is_empty() && self.to_update.is_empty()
    }
}

/// The set of tracked interfaces.
#[derive(Debug, Default)]
pub struct InterfaceTable {
    interfaces: HashMap<String, TrackedInterface>,
}

impl InterfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Distill a snapshot into the eligible interface set.
    ///
    /// An interface qualifies iff it is up, carries at least one IPv6
    /// link-local address, and (when v4 is enabled) at least one IPv4
    /// address. Within each family the numerically lowest network is
    /// chosen so both ends of a link pick the same addresses.
    pub fn eligible_from_snapshot(
        db: &InterfaceDatabase,
        enable_v4: bool,
        now: Instant,
    ) -> HashMap<String, TrackedInterface> {
        let mut eligible = HashMap::new();

        for (if_name, info) in &db.interfaces {
            if !info.is_up {
                continue;
            }

            let v6_link_local = info
                .networks
                .iter()
                .filter(|n| is_v6_link_local(n.addr))
                .min_by_key(|n| (n.addr, n.prefix_len))
                .copied();
            let Some(v6_link_local_network) = v6_link_local else {
                continue;
            };

            let v4_network = info
                .networks
                .iter()
                .filter(|n| n.addr.is_ipv4())
                .min_by_key(|n| (n.addr, n.prefix_len))
                .copied();
            if enable_v4 && v4_network.is_none() {
                continue;
            }

            eligible.insert(
                if_name.clone(),
                TrackedInterface {
                    if_index: info.if_index,
                    v4_network: if enable_v4 { v4_network } else { None },
                    v6_link_local_network,
                    tracked_since: now,
                },
            );
        }

        eligible
    }

    /// Diff the tracked set against a new eligible set.
    pub fn plan(&self, eligible: &HashMap<String, TrackedInterface>) -> ReconcilePlan {
        let mut plan = ReconcilePlan::default();

        for (name, new_state) in eligible {
            match self.interfaces.get(name) {
                None => plan.to_add.push(name.clone()),
                Some(current) if !current.same_as(new_state) => {
                    plan.to_update.push((name.clone(), current.if_index));
                }
                Some(_) => {} // unchanged
            }
        }

        for name in self.interfaces.keys() {
            if !eligible.contains_key(name) {
                plan.to_del.push(name.clone());
            }
        }

        // Deterministic application order keeps logs and tests stable.
        plan.to_add.sort();
        plan.to_del.sort();
        plan.to_update.sort();
        plan
    }

    /// Start tracking an interface.
    pub fn insert(&mut self, if_name: String, state: TrackedInterface) {
        self.interfaces.insert(if_name, state);
    }

    /// Replace addresses/index in place, preserving the original tracking
    /// timestamp so an address change does not re-enter fast-init.
    pub fn update(&mut self, if_name: &str, mut state: TrackedInterface) {
        if let Some(current) = self.interfaces.get(if_name) {
            state.tracked_since = current.tracked_since;
        }
        self.interfaces.insert(if_name.to_string(), state);
    }

    /// Stop tracking an interface, returning its final state.
    pub fn remove(&mut self, if_name: &str) -> Option<TrackedInterface> {
        self.interfaces.remove(if_name)
    }

    pub fn get(&self, if_name: &str) -> Option<&TrackedInterface> {
        self.interfaces.get(if_name)
    }

    pub fn contains(&self, if_name: &str) -> bool {
        self.interfaces.contains_key(if_name)
    }

    /// Reverse lookup from an ingress ifIndex. The tracked set is small, so
    /// a scan beats maintaining a second map.
    pub fn name_by_index(&self, if_index: u32) -> Option<&str> {
        self.interfaces
            .iter()
            .find(|(_, state)| state.if_index == if_index)
            .map(|(name, _)| name.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.interfaces.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InterfaceInfo;

    fn netw(addr: &str, prefix: u8) -> IpNetwork {
        IpNetwork::new(addr.parse().unwrap(), prefix)
    }

    fn snapshot(entries: &[(&str, bool, u32, Vec<IpNetwork>)]) -> InterfaceDatabase {
        InterfaceDatabase {
            node_name: "node-1".to_string(),
            interfaces: entries
                .iter()
                .map(|(name, is_up, if_index, networks)| {
                    (
                        name.to_string(),
                        InterfaceInfo {
                            is_up: *is_up,
                            if_index: *if_index,
                            networks: networks.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn test_eligibility_requires_up_and_link_local() {
        let db = snapshot(&[
            ("eth0", true, 2, vec![netw("fe80::1", 64)]),
            ("eth1", false, 3, vec![netw("fe80::2", 64)]),
            ("eth2", true, 4, vec![netw("10.0.0.1", 24)]),
        ]);
        let eligible = InterfaceTable::eligible_from_snapshot(&db, false, Instant::now());
        assert_eq!(eligible.len(), 1);
        assert!(eligible.contains_key("eth0"));
    }

    #[test]
    fn test_eligibility_v4_requirement() {
        let db = snapshot(&[
            ("eth0", true, 2, vec![netw("fe80::1", 64)]),
            (
                "eth1",
                true,
                3,
                vec![netw("fe80::2", 64), netw("10.0.0.1", 31)],
            ),
        ]);
        let eligible = InterfaceTable::eligible_from_snapshot(&db, true, Instant::now());
        assert_eq!(eligible.len(), 1);
        let eth1 = &eligible["eth1"];
        assert_eq!(eth1.v4_network, Some(netw("10.0.0.1", 31)));
    }

    #[test]
    fn test_lowest_address_selected_per_family() {
        let db = snapshot(&[(
            "eth0",
            true,
            2,
            vec![
                netw("fe80::9", 64),
                netw("fe80::2", 64),
                netw("10.0.0.9", 24),
                netw("10.0.0.3", 24),
            ],
        )]);
        let eligible = InterfaceTable::eligible_from_snapshot(&db, true, Instant::now());
        let eth0 = &eligible["eth0"];
        assert_eq!(eth0.v6_link_local_network, netw("fe80::2", 64));
        assert_eq!(eth0.v4_network, Some(netw("10.0.0.3", 24)));
    }

    #[test]
    fn test_v4_ignored_when_disabled() {
        let db = snapshot(&[(
            "eth0",
            true,
            2,
            vec![netw("fe80::1", 64), netw("10.0.0.1", 24)],
        )]);
        let eligible = InterfaceTable::eligible_from_snapshot(&db, false, Instant::now());
        assert_eq!(eligible["eth0"].v4_network, None);
    }

    #[test]
    fn test_plan_add_del_update() {
        let now = Instant::now();
        let mut table = InterfaceTable::new();

        let db1 = snapshot(&[
            ("eth0", true, 2, vec![netw("fe80::1", 64)]),
            ("eth1", true, 3, vec![netw("fe80::2", 64)]),
        ]);
        let eligible = InterfaceTable::eligible_from_snapshot(&db1, false, now);
        let plan = table.plan(&eligible);
        assert_eq!(plan.to_add, vec!["eth0", "eth1"]);
        assert!(plan.to_del.is_empty() && plan.to_update.is_empty());
        for name in &plan.to_add {
            table.insert(name.clone(), eligible[name].clone());
        }

        // eth1 drops out, eth0 gets a new ifIndex, eth2 appears.
        let db2 = snapshot(&[
            ("eth0", true, 7, vec![netw("fe80::1", 64)]),
            ("eth2", true, 4, vec![netw("fe80::3", 64)]),
        ]);
        let eligible2 = InterfaceTable::eligible_from_snapshot(&db2, false, now);
        let plan2 = table.plan(&eligible2);
        assert_eq!(plan2.to_add, vec!["eth2"]);
        assert_eq!(plan2.to_del, vec!["eth1"]);
        assert_eq!(plan2.to_update, vec![("eth0".to_string(), 2)]);
    }

    #[test]
    fn test_same_snapshot_twice_is_noop() {
        let now = Instant::now();
        let mut table = InterfaceTable::new();
        let db = snapshot(&[("eth0", true, 2, vec![netw("fe80::1", 64)])]);

        let eligible = InterfaceTable::eligible_from_snapshot(&db, false, now);
        for name in table.plan(&eligible).to_add {
            let state = eligible[&name].clone();
            table.insert(name, state);
        }

        // A later identical snapshot (fresh `now`) must not cause churn.
        let eligible2 = InterfaceTable::eligible_from_snapshot(
            &db,
            false,
            now + std::time::Duration::from_secs(60),
        );
        assert!(table.plan(&eligible2).is_noop());
    }

    #[test]
    fn test_update_preserves_tracking_timestamp() {
        let now = Instant::now();
        let mut table = InterfaceTable::new();
        table.insert(
            "eth0".to_string(),
            TrackedInterface {
                if_index: 2,
                v4_network: None,
                v6_link_local_network: netw("fe80::1", 64),
                tracked_since: now,
            },
        );
        table.update(
            "eth0",
            TrackedInterface {
                if_index: 9,
                v4_network: None,
                v6_link_local_network: netw("fe80::1", 64),
                tracked_since: now + std::time::Duration::from_secs(100),
            },
        );
        assert_eq!(table.get("eth0").unwrap().tracked_since, now);
        assert_eq!(table.get("eth0").unwrap().if_index, 9);
    }

    #[test]
    fn test_name_by_index() {
        let mut table = InterfaceTable::new();
        table.insert(
            "eth0".to_string(),
            TrackedInterface {
                if_index: 2,
                v4_network: None,
                v6_link_local_network: netw("fe80::1", 64),
                tracked_since: Instant::now(),
            },
        );
        assert_eq!(table.name_by_index(2), Some("eth0"));
        assert_eq!(table.name_by_index(3), None);
    }
}
