// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Protocol timer management.
//!
//! All protocol timers live in one priority queue inside the engine loop;
//! the earliest deadline decides how long the loop sleeps. Timers are
//! addressed by a [`TimerKey`] naming the interface or neighbor that owns
//! them: scheduling a key replaces any previous deadline for it, and
//! cancelled keys are dropped lazily when they surface at the top of the
//! heap. A callback for an erased owner therefore never fires — there is
//! nothing to look up, and nothing keeps the owner alive.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

/// Identity of a scheduled timer. Keys carry owner names, not references;
/// whoever handles the expiry looks the owner up and treats a miss as a
/// benign no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Periodic hello transmission on an interface.
    HelloTx { if_name: String },
    /// Periodic heartbeat transmission on an interface.
    HeartbeatTx { if_name: String },
    /// Periodic handshake retransmission while negotiating with a neighbor.
    NegotiateTx { if_name: String, node_name: String },
    /// Bound on time spent in NEGOTIATE.
    NegotiateHold { if_name: String, node_name: String },
    /// Liveness hold while ESTABLISHED.
    HeartbeatHold { if_name: String, node_name: String },
    /// Grace window while the neighbor restarts.
    GracefulRestartHold { if_name: String, node_name: String },
    /// Periodic counter refresh.
    CounterRefresh,
}

impl TimerKey {
    /// All per-neighbor keys for one record, for bulk cancellation when the
    /// record is erased.
    pub fn neighbor_keys(if_name: &str, node_name: &str) -> [TimerKey; 4] {
        [
            TimerKey::NegotiateTx {
                if_name: if_name.to_string(),
                node_name: node_name.to_string(),
            },
            TimerKey::NegotiateHold {
                if_name: if_name.to_string(),
                node_name: node_name.to_string(),
            },
            TimerKey::HeartbeatHold {
                if_name: if_name.to_string(),
                node_name: node_name.to_string(),
            },
            TimerKey::GracefulRestartHold {
                if_name: if_name.to_string(),
                node_name: node_name.to_string(),
            },
        ]
    }
}

#[derive(Debug, Clone)]
struct ScheduledTimer {
    fire_at: Instant,
    key: TimerKey,
}

impl PartialEq for ScheduledTimer {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.key == other.key
    }
}

impl Eq for ScheduledTimer {}

impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at.cmp(&other.fire_at)
    }
}

/// Priority queue of pending timers with replace-on-schedule and lazy
/// cancellation.
#[derive(Debug, Default)]
pub struct TimerManager {
    heap: BinaryHeap<Reverse<ScheduledTimer>>,
    /// Source of truth: a heap entry is live only while its (key, fire_at)
    /// matches this map.
    active: HashMap<TimerKey, Instant>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `key` to fire at `fire_at`, replacing any earlier schedule
    /// for the same key.
    pub fn schedule(&mut self, key: TimerKey, fire_at: Instant) {
        self.active.insert(key.clone(), fire_at);
        self.heap.push(Reverse(ScheduledTimer { fire_at, key }));
    }

    /// Cancel a key. Stale heap entries are skipped when they surface.
    pub fn cancel(&mut self, key: &TimerKey) {
        self.active.remove(key);
    }

    /// Cancel every per-neighbor timer of one record.
    pub fn cancel_neighbor(&mut self, if_name: &str, node_name: &str) {
        for key in TimerKey::neighbor_keys(if_name, node_name) {
            self.active.remove(&key);
        }
    }

    /// Cancel the per-interface transmit timers.
    pub fn cancel_interface(&mut self, if_name: &str) {
        self.active.remove(&TimerKey::HelloTx {
            if_name: if_name.to_string(),
        });
        self.active.remove(&TimerKey::HeartbeatTx {
            if_name: if_name.to_string(),
        });
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.active.contains_key(key)
    }

    /// Earliest live deadline, discarding cancelled and superseded heap
    /// entries on the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(top)) = self.heap.peek() {
            match self.active.get(&top.key) {
                Some(fire_at) if *fire_at == top.fire_at => return Some(top.fire_at),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Pop every timer due at or before `now`, in deadline order. Fired
    /// keys are disarmed before being returned.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimerKey> {
        let mut expired = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.fire_at > now {
                break;
            }
            let Reverse(timer) = self.heap.pop().expect("peeked entry vanished");
            match self.active.get(&timer.key) {
                Some(fire_at) if *fire_at == timer.fire_at => {
                    self.active.remove(&timer.key);
                    expired.push(timer.key);
                }
                _ => {} // cancelled or rescheduled; stale entry
            }
        }
        expired
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn hello(if_name: &str) -> TimerKey {
        TimerKey::HelloTx {
            if_name: if_name.to_string(),
        }
    }

    fn hold(if_name: &str, node: &str) -> TimerKey {
        TimerKey::HeartbeatHold {
            if_name: if_name.to_string(),
            node_name: node.to_string(),
        }
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let mut timers = TimerManager::new();
        let now = Instant::now();
        timers.schedule(hello("eth1"), now + Duration::from_millis(20));
        timers.schedule(hello("eth0"), now + Duration::from_millis(10));

        let expired = timers.pop_expired(now + Duration::from_millis(30));
        assert_eq!(expired, vec![hello("eth0"), hello("eth1")]);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_not_due_stays_armed() {
        let mut timers = TimerManager::new();
        let now = Instant::now();
        timers.schedule(hello("eth0"), now + Duration::from_secs(5));
        assert!(timers.pop_expired(now).is_empty());
        assert!(timers.is_armed(&hello("eth0")));
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_schedule_replaces_previous_deadline() {
        let mut timers = TimerManager::new();
        let now = Instant::now();
        timers.schedule(hold("eth0", "n1"), now + Duration::from_millis(10));
        // Hold timer extended; only the later deadline counts.
        timers.schedule(hold("eth0", "n1"), now + Duration::from_millis(500));

        assert!(timers.pop_expired(now + Duration::from_millis(100)).is_empty());
        let expired = timers.pop_expired(now + Duration::from_millis(600));
        assert_eq!(expired, vec![hold("eth0", "n1")]);
    }

    #[test]
    fn test_cancel_suppresses_firing() {
        let mut timers = TimerManager::new();
        let now = Instant::now();
        timers.schedule(hold("eth0", "n1"), now + Duration::from_millis(10));
        timers.cancel(&hold("eth0", "n1"));
        assert!(timers.pop_expired(now + Duration::from_secs(1)).is_empty());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_cancel_neighbor_clears_all_scoped_timers() {
        let mut timers = TimerManager::new();
        let now = Instant::now();
        for key in TimerKey::neighbor_keys("eth0", "n1") {
            timers.schedule(key, now + Duration::from_millis(10));
        }
        timers.schedule(hold("eth0", "n2"), now + Duration::from_millis(10));

        timers.cancel_neighbor("eth0", "n1");
        let expired = timers.pop_expired(now + Duration::from_secs(1));
        assert_eq!(expired, vec![hold("eth0", "n2")]);
    }

    #[test]
    fn test_next_deadline_skips_stale_entries() {
        let mut timers = TimerManager::new();
        let now = Instant::now();
        timers.schedule(hello("eth0"), now + Duration::from_millis(10));
        timers.schedule(hello("eth0"), now + Duration::from_millis(200));
        timers.schedule(hello("eth1"), now + Duration::from_millis(50));

        // The 10ms entry for eth0 was superseded, so eth1 is first.
        assert_eq!(
            timers.next_deadline(),
            Some(now + Duration::from_millis(50))
        );
    }
}
