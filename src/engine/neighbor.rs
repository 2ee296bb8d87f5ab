// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Neighbor tracking and the per-neighbor protocol procedures.
//!
//! The table maps (interface, neighbor node name) to a record owning the
//! neighbor's state machine, negotiated hold times and RTT estimator.
//! Handlers mutate the table and return a [`HandlerResult`] describing the
//! side effects — timer operations, outbound packets, adjacency events —
//! which the engine loop applies. Keeping the side effects out of the
//! handlers makes the protocol logic testable without sockets or a clock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::counters::{keys, Counters};
use crate::logging::{Facility, Logger};
use crate::wire::{HandshakeMsg, HelloMsg, HeartbeatMsg, ReflectedNeighborInfo};
use crate::{log_debug, log_info, log_notice, log_warning};
use crate::{NeighborEvent, NeighborEventType, NeighborInfo};

use super::area::{AreaMatch, AreaResolver, DEFAULT_AREA};
use super::interface::InterfaceTable;
use super::label::LabelAllocator;
use super::rtt::{compute_rtt, StepDetector};
use super::state_machine::{next_state, NeighEvent, NeighState};
use super::timer::TimerKey;

/// Timer side effect requested by a handler. Durations are relative; the
/// engine anchors them at its current tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerOp {
    Schedule { key: TimerKey, after: Duration },
    Cancel(TimerKey),
}

/// Outbound packet requested by a handler. The engine owns serialization,
/// the sequence number and the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Immediate hello on an interface (solicited reply).
    Hello { if_name: String },
    /// Targeted handshake to one neighbor.
    Handshake {
        if_name: String,
        neighbor_node_name: String,
        /// Area we deduced for the neighbor, echoed in the message.
        neighbor_area: String,
        is_adj_established: bool,
    },
}

/// Side effects of one handler invocation.
#[derive(Debug, Default)]
pub struct HandlerResult {
    pub timers: Vec<TimerOp>,
    pub packets: Vec<Outbound>,
    pub events: Vec<NeighborEvent>,
}

impl HandlerResult {
    pub fn new() -> Self {
        Self::default()
    }

    fn schedule(&mut self, key: TimerKey, after: Duration) {
        self.timers.push(TimerOp::Schedule { key, after });
    }

    fn cancel(&mut self, key: TimerKey) {
        self.timers.push(TimerOp::Cancel(key));
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty() && self.packets.is_empty() && self.events.is_empty()
    }

    pub fn merge(&mut self, other: HandlerResult) {
        self.timers.extend(other.timers);
        self.packets.extend(other.packets);
        self.events.extend(other.events);
    }
}

/// One tracked neighbor on one interface.
#[derive(Debug)]
pub struct NeighborRecord {
    pub domain_name: String,
    pub node_name: String,
    /// The neighbor's name for its side of the link.
    pub remote_if_name: String,
    pub area: String,
    pub label: u32,
    /// Latest sequence number learned from the peer.
    pub seq_num: u64,
    pub state: NeighState,

    /// Smoothed RTT in microseconds; 0 until the first accepted sample.
    pub rtt_us: i64,
    /// Most recent accepted raw sample.
    pub rtt_latest_us: i64,
    step_detector: StepDetector,

    pub transport_address_v4: Option<Ipv4Addr>,
    pub transport_address_v6: Option<Ipv6Addr>,
    pub kvstore_port: u16,
    pub ctrl_port: u16,

    /// Send timestamp of the peer's last hello (its clock, µs since epoch).
    pub neighbor_timestamp_us: u64,
    /// Local receive timestamp of that hello (our clock, µs since epoch).
    pub local_timestamp_us: u64,

    /// Hold times negotiated in the handshake: max(peer's ask, our floor).
    pub heartbeat_hold_time: Duration,
    pub graceful_restart_hold_time: Duration,
}

/// Result of the hello sanity checks.
#[derive(Debug, PartialEq, Eq)]
enum Sanity {
    Ok,
    /// Our own multicast came back; dropped silently.
    SkipLoopedSelf,
    Failure,
}

/// Point-in-time view of one neighbor, returned by queries.
#[derive(Debug, Clone)]
pub struct NeighborSnapshot {
    pub if_name: String,
    pub node_name: String,
    pub state: NeighState,
    pub area: String,
    pub label: u32,
    pub rtt_us: i64,
    pub seq_num: u64,
}

/// Per-interface neighbor map plus the label pool and the active
/// (ESTABLISHED) sets.
pub struct NeighborTable {
    my_node_name: String,
    my_domain_name: String,
    enable_v4: bool,
    min_supported_version: u32,
    /// Floor for the heartbeat hold we honor.
    my_heartbeat_hold_time: Duration,
    /// Floor for the graceful-restart hold we honor.
    my_hold_time: Duration,
    handshake_time: Duration,
    negotiate_hold_time: Duration,

    /// if_name -> node_name -> record. A bucket exists exactly while the
    /// interface is tracked.
    neighbors: HashMap<String, HashMap<String, NeighborRecord>>,
    /// ESTABLISHED neighbors per interface; heartbeats are suppressed on
    /// interfaces with an empty set.
    active: HashMap<String, HashSet<String>>,
    labels: LabelAllocator,
    logger: Logger,
}

impl NeighborTable {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        my_node_name: String,
        my_domain_name: String,
        enable_v4: bool,
        min_supported_version: u32,
        my_heartbeat_hold_time: Duration,
        my_hold_time: Duration,
        handshake_time: Duration,
        negotiate_hold_time: Duration,
        logger: Logger,
    ) -> Self {
        Self {
            my_node_name,
            my_domain_name,
            enable_v4,
            min_supported_version,
            my_heartbeat_hold_time,
            my_hold_time,
            handshake_time,
            negotiate_hold_time,
            neighbors: HashMap::new(),
            active: HashMap::new(),
            labels: LabelAllocator::new(),
            logger,
        }
    }

    /// Create the (empty) neighbor bucket for a newly tracked interface.
    pub fn add_interface(&mut self, if_name: &str) {
        self.neighbors.entry(if_name.to_string()).or_default();
    }

    /// Tear down every neighbor on a no-longer-tracked interface.
    ///
    /// DOWN is only published for neighbors whose transport addresses were
    /// learned (v6, plus v4 when enabled); a half-negotiated neighbor was
    /// never announced UP and has nothing to retract.
    pub fn remove_interface(&mut self, if_name: &str) -> HandlerResult {
        let mut result = HandlerResult::new();

        if let Some(bucket) = self.neighbors.remove(if_name) {
            for (node_name, record) in bucket {
                self.labels.free(record.label);
                log_info!(
                    self.logger,
                    Facility::Neighbor,
                    "Neighbor {} removed, interface {} no longer tracked",
                    node_name,
                    if_name
                );

                for key in TimerKey::neighbor_keys(if_name, &node_name) {
                    result.cancel(key);
                }

                let addresses_known = record.transport_address_v6.is_some()
                    && (!self.enable_v4 || record.transport_address_v4.is_some());
                if addresses_known {
                    result
                        .events
                        .push(self.make_event(if_name, &record, NeighborEventType::NeighborDown));
                }
            }
        }
        self.active.remove(if_name);
        result
    }

    /// Hello sanity checks: loop, domain, version.
    fn sanity_check_hello(&self, msg: &HelloMsg, counters: &mut Counters) -> Sanity {
        if msg.node_name == self.my_node_name {
            counters.bump(keys::LOOPED_PACKET);
            return Sanity::SkipLoopedSelf;
        }
        if msg.domain_name != self.my_domain_name {
            log_warning!(
                self.logger,
                Facility::Neighbor,
                "Ignoring hello from {} on remote interface {}: domain {} differs from ours ({})",
                msg.node_name,
                msg.if_name,
                msg.domain_name,
                self.my_domain_name
            );
            counters.bump(keys::DIFFERENT_DOMAIN);
            return Sanity::Failure;
        }
        if msg.version < self.min_supported_version {
            log_warning!(
                self.logger,
                Facility::Neighbor,
                "Unsupported version {} from {}, need at least {}",
                msg.version,
                msg.node_name,
                self.min_supported_version
            );
            counters.bump(keys::INVALID_VERSION);
            return Sanity::Failure;
        }
        Sanity::Ok
    }

    fn log_transition(&self, node_name: &str, if_name: &str, from: NeighState, to: NeighState) {
        log_notice!(
            self.logger,
            Facility::Neighbor,
            "State change [{}] -> [{}] for neighbor {} on interface {}",
            from,
            to,
            node_name,
            if_name
        );
    }

    fn make_event(
        &self,
        if_name: &str,
        record: &NeighborRecord,
        event_type: NeighborEventType,
    ) -> NeighborEvent {
        // Flood optimization is only meaningful on edges that change the
        // adjacency set.
        let support_flood_optimization = matches!(
            event_type,
            NeighborEventType::NeighborUp
                | NeighborEventType::NeighborDown
                | NeighborEventType::NeighborRestarted
        );
        NeighborEvent {
            event_type,
            if_name: if_name.to_string(),
            neighbor: NeighborInfo {
                node_name: record.node_name.clone(),
                domain_name: record.domain_name.clone(),
                remote_if_name: record.remote_if_name.clone(),
                area: record.area.clone(),
                transport_address_v4: record.transport_address_v4,
                transport_address_v6: record.transport_address_v6,
                kvstore_port: record.kvstore_port,
                ctrl_port: record.ctrl_port,
            },
            rtt_us: record.rtt_us,
            label: record.label,
            support_flood_optimization,
            area: record.area.clone(),
        }
    }

    /// Drop a record: free its label, cancel its timers and detach it from
    /// the active set.
    fn erase_record(&mut self, if_name: &str, node_name: &str, result: &mut HandlerResult) {
        if let Some(bucket) = self.neighbors.get_mut(if_name) {
            if let Some(record) = bucket.remove(node_name) {
                self.labels.free(record.label);
            }
        }
        if let Some(active) = self.active.get_mut(if_name) {
            active.remove(node_name);
            if active.is_empty() {
                self.active.remove(if_name);
            }
        }
        for key in TimerKey::neighbor_keys(if_name, node_name) {
            result.cancel(key);
        }
    }

    /// Process a hello heard on `if_name`.
    ///
    /// `recv_time_us` is the kernel receive timestamp, `my_seq_num` the
    /// engine's current outbound sequence number, `if_index` the tracked
    /// interface index (for label preference).
    #[allow(clippy::too_many_arguments)]
    pub fn handle_hello(
        &mut self,
        if_name: &str,
        msg: &HelloMsg,
        recv_time_us: u64,
        my_seq_num: u64,
        if_index: u32,
        areas: &AreaResolver,
        counters: &mut Counters,
    ) -> Result<HandlerResult> {
        let mut result = HandlerResult::new();

        if !self.neighbors.contains_key(if_name) {
            log_warning!(
                self.logger,
                Facility::Neighbor,
                "Ignoring hello from {} on untracked interface {}",
                msg.node_name,
                if_name
            );
            return Ok(result);
        }

        match self.sanity_check_hello(msg, counters) {
            Sanity::SkipLoopedSelf => {
                log_debug!(
                    self.logger,
                    Facility::Neighbor,
                    "Dropped self-looped hello on {}",
                    if_name
                );
                return Ok(result);
            }
            Sanity::Failure => return Ok(result),
            Sanity::Ok => {}
        }

        let node_name = &msg.node_name;

        if !self.neighbors[if_name].contains_key(node_name) {
            // Area is deduced once, for unknown neighbors only; rule churn
            // at runtime is not supported.
            let area = match areas.resolve(node_name, if_name) {
                AreaMatch::Unique(area) => area,
                AreaMatch::None => {
                    log_warning!(
                        self.logger,
                        Facility::Neighbor,
                        "No area rule matches neighbor {} on {}; ignoring it",
                        node_name,
                        if_name
                    );
                    counters.bump(keys::NEIGHBOR_NO_AREA);
                    return Ok(result);
                }
                AreaMatch::Ambiguous => {
                    log_warning!(
                        self.logger,
                        Facility::Neighbor,
                        "Multiple area rules match neighbor {} on {}; ignoring it",
                        node_name,
                        if_name
                    );
                    counters.bump(keys::NEIGHBOR_MULTIPLE_AREA);
                    return Ok(result);
                }
            };

            let label = self
                .labels
                .allocate(if_index)
                .context("allocating segment-routing label")?;

            log_info!(
                self.logger,
                Facility::Neighbor,
                "Tracking new neighbor {} on interface {} (area {}, label {})",
                node_name,
                if_name,
                area,
                label
            );

            self.neighbors.get_mut(if_name).expect("bucket exists").insert(
                node_name.clone(),
                NeighborRecord {
                    domain_name: msg.domain_name.clone(),
                    node_name: node_name.clone(),
                    remote_if_name: msg.if_name.clone(),
                    area,
                    label,
                    seq_num: msg.seq_num,
                    state: NeighState::Idle,
                    rtt_us: 0,
                    rtt_latest_us: 0,
                    step_detector: StepDetector::new(),
                    transport_address_v4: None,
                    transport_address_v6: None,
                    kvstore_port: 0,
                    ctrl_port: 0,
                    neighbor_timestamp_us: 0,
                    local_timestamp_us: 0,
                    heartbeat_hold_time: self.my_heartbeat_hold_time,
                    graceful_restart_hold_time: self.my_hold_time,
                },
            );
        }

        let reflected = msg.neighbor_infos.get(&self.my_node_name).cloned();

        // Timestamp bookkeeping and RTT feed happen for every state.
        let rtt_change = {
            let record = self
                .neighbors
                .get_mut(if_name)
                .and_then(|b| b.get_mut(node_name))
                .expect("record just ensured");

            record.neighbor_timestamp_us = msg.sent_ts_us;
            record.local_timestamp_us = recv_time_us;

            let mut change = None;
            if let Some(ts) = &reflected {
                if let Some(rtt) = compute_rtt(
                    ts.last_nbr_msg_sent_ts_us,
                    ts.last_my_msg_rcvd_ts_us,
                    msg.sent_ts_us,
                    recv_time_us,
                ) {
                    if record.rtt_us == 0 {
                        record.rtt_us = rtt;
                    }
                    record.rtt_latest_us = rtt;
                    if let Some(new_level) = record.step_detector.add_value(rtt) {
                        if record.state == NeighState::Established {
                            record.rtt_us = new_level;
                            change = Some(new_level);
                        }
                    }
                }
            }
            change
        };

        if let Some(new_level) = rtt_change {
            let record = &self.neighbors[if_name][node_name];
            log_info!(
                self.logger,
                Facility::Neighbor,
                "RTT for neighbor {} on {} changed to {}us",
                node_name,
                if_name,
                new_level
            );
            result
                .events
                .push(self.make_event(if_name, record, NeighborEventType::NeighborRttChange));
        }

        // A peer in fast-init wants an immediate reply for convergence.
        if msg.solicit_response {
            result.packets.push(Outbound::Hello {
                if_name: if_name.to_string(),
            });
        }

        let state = self.neighbors[if_name][node_name].state;
        match state {
            NeighState::Idle => {
                let to = next_state(state, NeighEvent::HelloRcvdNoInfo)?;
                self.log_transition(node_name, if_name, state, to);
                self.neighbors.get_mut(if_name).unwrap().get_mut(node_name).unwrap().state = to;
            }

            NeighState::Warm => {
                let record = self
                    .neighbors
                    .get_mut(if_name)
                    .unwrap()
                    .get_mut(node_name)
                    .unwrap();
                record.seq_num = msg.seq_num;

                // The peer has not echoed us back yet; stay warm.
                let Some(ts) = &reflected else {
                    return Ok(result);
                };

                // The peer cannot legitimately have seen a seq number we
                // have not sent yet; a reflected value at or above ours is
                // an echo of our previous incarnation. Wait for the peer to
                // catch up.
                if ts.seq_num >= my_seq_num {
                    log_debug!(
                        self.logger,
                        Facility::Neighbor,
                        "Neighbor {} reflects seq {} >= our {}; previous incarnation, ignoring",
                        node_name,
                        ts.seq_num,
                        my_seq_num
                    );
                    return Ok(result);
                }

                result.schedule(
                    TimerKey::NegotiateTx {
                        if_name: if_name.to_string(),
                        node_name: node_name.clone(),
                    },
                    self.handshake_time,
                );
                result.schedule(
                    TimerKey::NegotiateHold {
                        if_name: if_name.to_string(),
                        node_name: node_name.clone(),
                    },
                    self.negotiate_hold_time,
                );

                let to = next_state(state, NeighEvent::HelloRcvdInfo)?;
                self.log_transition(node_name, if_name, state, to);
                self.neighbors.get_mut(if_name).unwrap().get_mut(node_name).unwrap().state = to;
            }

            NeighState::Negotiate => {
                // Parameter exchange is driven by handshakes; hellos carry
                // nothing new for this state.
            }

            NeighState::Established => {
                {
                    let record = self
                        .neighbors
                        .get_mut(if_name)
                        .unwrap()
                        .get_mut(node_name)
                        .unwrap();
                    record.seq_num = msg.seq_num;
                }

                if msg.restarting {
                    log_notice!(
                        self.logger,
                        Facility::Neighbor,
                        "Adjacent neighbor {} on interface {} is restarting",
                        node_name,
                        if_name
                    );
                    let record = &self.neighbors[if_name][node_name];
                    result.events.push(self.make_event(
                        if_name,
                        record,
                        NeighborEventType::NeighborRestarting,
                    ));
                    result.schedule(
                        TimerKey::GracefulRestartHold {
                            if_name: if_name.to_string(),
                            node_name: node_name.clone(),
                        },
                        record.graceful_restart_hold_time,
                    );
                    result.cancel(TimerKey::HeartbeatHold {
                        if_name: if_name.to_string(),
                        node_name: node_name.clone(),
                    });

                    let to = next_state(state, NeighEvent::HelloRcvdRestart)?;
                    self.log_transition(node_name, if_name, state, to);
                    self.neighbors.get_mut(if_name).unwrap().get_mut(node_name).unwrap().state =
                        to;
                    return Ok(result);
                }

                if reflected.is_none() {
                    // The peer dropped us from its reflected list; it no
                    // longer wants the adjacency.
                    let to = next_state(state, NeighEvent::HelloRcvdNoInfo)?;
                    self.log_transition(node_name, if_name, state, to);

                    let record = &self.neighbors[if_name][node_name];
                    result
                        .events
                        .push(self.make_event(if_name, record, NeighborEventType::NeighborDown));
                    self.erase_record(if_name, node_name, &mut result);
                }
            }

            NeighState::Restart => {
                let Some(_ts) = &reflected else {
                    return Ok(result);
                };

                let record_seq = self.neighbors[if_name][node_name].seq_num;
                if msg.seq_num <= record_seq {
                    // Stale traffic from before the restart; let the grace
                    // timer decide.
                    log_debug!(
                        self.logger,
                        Facility::Neighbor,
                        "Hello seq {} from restarting neighbor {} not beyond {}; ignoring",
                        msg.seq_num,
                        node_name,
                        record_seq
                    );
                    return Ok(result);
                }

                log_notice!(
                    self.logger,
                    Facility::Neighbor,
                    "Neighbor {} on interface {} is back from restart (seq {} > {})",
                    node_name,
                    if_name,
                    msg.seq_num,
                    record_seq
                );

                {
                    let record = self
                        .neighbors
                        .get_mut(if_name)
                        .unwrap()
                        .get_mut(node_name)
                        .unwrap();
                    record.seq_num = msg.seq_num;
                }

                let record = &self.neighbors[if_name][node_name];
                result.events.push(self.make_event(
                    if_name,
                    record,
                    NeighborEventType::NeighborRestarted,
                ));
                result.schedule(
                    TimerKey::HeartbeatHold {
                        if_name: if_name.to_string(),
                        node_name: node_name.clone(),
                    },
                    record.heartbeat_hold_time,
                );
                result.cancel(TimerKey::GracefulRestartHold {
                    if_name: if_name.to_string(),
                    node_name: node_name.clone(),
                });

                let to = next_state(state, NeighEvent::HelloRcvdInfo)?;
                self.log_transition(node_name, if_name, state, to);
                self.neighbors.get_mut(if_name).unwrap().get_mut(node_name).unwrap().state = to;
            }
        }

        Ok(result)
    }

    /// Process a handshake heard on `if_name`.
    pub fn handle_handshake(
        &mut self,
        if_name: &str,
        msg: &HandshakeMsg,
        interfaces: &InterfaceTable,
        counters: &mut Counters,
    ) -> Result<HandlerResult> {
        let mut result = HandlerResult::new();

        // Handshakes are point-to-point over multicast; only the addressee
        // processes them.
        if let Some(target) = &msg.neighbor_node_name {
            if *target != self.my_node_name {
                log_debug!(
                    self.logger,
                    Facility::Neighbor,
                    "Ignoring handshake targeted at {}",
                    target
                );
                return Ok(result);
            }
        }

        let node_name = &msg.node_name;
        let Some(record) = self
            .neighbors
            .get_mut(if_name)
            .and_then(|b| b.get_mut(node_name))
        else {
            // Out-of-order under quick flapping; only tracked neighbors
            // negotiate.
            log_debug!(
                self.logger,
                Facility::Neighbor,
                "Handshake from unknown neighbor {} on {}; ignoring",
                node_name,
                if_name
            );
            return Ok(result);
        };

        // Reply while the peer still wants an answer, but never ask for a
        // reply ourselves once we are out of NEGOTIATE: a node whose v4
        // validation failed would otherwise bounce handshakes forever.
        if !msg.is_adj_established {
            result.packets.push(Outbound::Handshake {
                if_name: if_name.to_string(),
                neighbor_node_name: node_name.clone(),
                neighbor_area: record.area.clone(),
                is_adj_established: record.state != NeighState::Negotiate,
            });
        }

        // A restarted peer re-negotiates while we still count it as
        // ESTABLISHED; extending the hold keeps reordered handshakes from
        // tearing the adjacency down.
        if record.state == NeighState::Established {
            result.schedule(
                TimerKey::HeartbeatHold {
                    if_name: if_name.to_string(),
                    node_name: node_name.clone(),
                },
                record.heartbeat_hold_time,
            );
        }

        if record.state != NeighState::Negotiate {
            log_debug!(
                self.logger,
                Facility::Neighbor,
                "Handshake from {} in state {}; negotiation not in progress",
                node_name,
                record.state
            );
            return Ok(result);
        }

        record.transport_address_v4 = msg.transport_address_v4;
        record.transport_address_v6 = msg.transport_address_v6;
        record.kvstore_port = msg.kvstore_port;
        record.ctrl_port = msg.ctrl_port;
        record.heartbeat_hold_time = Duration::from_millis(msg.hold_time_ms)
            .max(self.my_heartbeat_hold_time);
        record.graceful_restart_hold_time =
            Duration::from_millis(msg.graceful_restart_time_ms).max(self.my_hold_time);

        if self.enable_v4 {
            let my_v4 = interfaces.get(if_name).and_then(|i| i.v4_network);
            let valid = match (my_v4, msg.transport_address_v4) {
                (Some(my_net), Some(peer_addr)) => {
                    if my_net.contains(std::net::IpAddr::V4(peer_addr)) {
                        true
                    } else {
                        log_warning!(
                            self.logger,
                            Facility::Neighbor,
                            "Neighbor {} v4 address {} not in local network {}",
                            node_name,
                            peer_addr,
                            my_net
                        );
                        counters.bump(keys::DIFFERENT_SUBNET);
                        false
                    }
                }
                _ => {
                    log_warning!(
                        self.logger,
                        Facility::Neighbor,
                        "Neighbor {} advertised no usable v4 address",
                        node_name
                    );
                    counters.bump(keys::MISSING_V4_ADDR);
                    false
                }
            };
            if !valid {
                return self.fail_negotiation(if_name, node_name, &mut result).map(|_| result);
            }
        }

        // Compare the area the peer deduced for us with the one we deduced
        // for the peer. Non-default areas must agree; a default on either
        // side means that node predates area support and both fall back.
        let record = self
            .neighbors
            .get_mut(if_name)
            .unwrap()
            .get_mut(node_name)
            .unwrap();
        if record.area != DEFAULT_AREA && msg.area != DEFAULT_AREA {
            if record.area != msg.area {
                log_warning!(
                    self.logger,
                    Facility::Neighbor,
                    "Area mismatch with {}: we deduced [{}], peer deduced [{}]",
                    node_name,
                    record.area,
                    msg.area
                );
                return self.fail_negotiation(if_name, node_name, &mut result).map(|_| result);
            }
        } else {
            record.area = DEFAULT_AREA.to_string();
        }

        let from = record.state;
        let to = next_state(from, NeighEvent::HandshakeRcvd)?;
        record.state = to;
        let hold = record.heartbeat_hold_time;
        self.log_transition(node_name, if_name, from, to);

        result.cancel(TimerKey::NegotiateTx {
            if_name: if_name.to_string(),
            node_name: node_name.clone(),
        });
        result.cancel(TimerKey::NegotiateHold {
            if_name: if_name.to_string(),
            node_name: node_name.clone(),
        });
        result.schedule(
            TimerKey::HeartbeatHold {
                if_name: if_name.to_string(),
                node_name: node_name.clone(),
            },
            hold,
        );

        self.active
            .entry(if_name.to_string())
            .or_default()
            .insert(node_name.clone());

        let record = &self.neighbors[if_name][node_name];
        result
            .events
            .push(self.make_event(if_name, record, NeighborEventType::NeighborUp));

        Ok(result)
    }

    /// Negotiation failed: fall back to WARM and stop handshaking.
    fn fail_negotiation(
        &mut self,
        if_name: &str,
        node_name: &str,
        result: &mut HandlerResult,
    ) -> Result<()> {
        let record = self
            .neighbors
            .get_mut(if_name)
            .unwrap()
            .get_mut(node_name)
            .unwrap();
        let from = record.state;
        let to = next_state(from, NeighEvent::NegotiationFailure)?;
        record.state = to;
        self.log_transition(node_name, if_name, from, to);

        result.cancel(TimerKey::NegotiateTx {
            if_name: if_name.to_string(),
            node_name: node_name.to_string(),
        });
        result.cancel(TimerKey::NegotiateHold {
            if_name: if_name.to_string(),
            node_name: node_name.to_string(),
        });
        Ok(())
    }

    /// Process a heartbeat: refresh the hold timer of an established
    /// neighbor, drop anything else.
    pub fn handle_heartbeat(&mut self, if_name: &str, msg: &HeartbeatMsg) -> HandlerResult {
        let mut result = HandlerResult::new();

        let Some(record) = self
            .neighbors
            .get(if_name)
            .and_then(|b| b.get(&msg.node_name))
        else {
            // During our own restart several hellos are needed before the
            // peer is tracked again; its heartbeats are meaningless until
            // then.
            return result;
        };

        if record.state != NeighState::Established {
            log_debug!(
                self.logger,
                Facility::Neighbor,
                "Heartbeat from {} in state {}; ignoring",
                msg.node_name,
                record.state
            );
            return result;
        }

        result.schedule(
            TimerKey::HeartbeatHold {
                if_name: if_name.to_string(),
                node_name: msg.node_name.clone(),
            },
            record.heartbeat_hold_time,
        );
        result
    }

    /// Heartbeat hold expired: the adjacency is gone.
    pub fn handle_heartbeat_hold_expiry(
        &mut self,
        if_name: &str,
        node_name: &str,
    ) -> Result<HandlerResult> {
        let mut result = HandlerResult::new();
        let Some(record) = self.neighbors.get_mut(if_name).and_then(|b| b.get_mut(node_name))
        else {
            return Ok(result); // owner erased first; stale fire
        };

        log_notice!(
            self.logger,
            Facility::Neighbor,
            "Heartbeat hold expired for neighbor {} on interface {}",
            node_name,
            if_name
        );

        let from = record.state;
        let to = next_state(from, NeighEvent::HeartbeatTimerExpire)?;
        record.state = to;
        self.log_transition(node_name, if_name, from, to);

        let record = &self.neighbors[if_name][node_name];
        result
            .events
            .push(self.make_event(if_name, record, NeighborEventType::NeighborDown));
        self.erase_record(if_name, node_name, &mut result);
        Ok(result)
    }

    /// Negotiate hold expired: stop handshaking, fall back to WARM.
    pub fn handle_negotiate_hold_expiry(
        &mut self,
        if_name: &str,
        node_name: &str,
    ) -> Result<HandlerResult> {
        let mut result = HandlerResult::new();
        let Some(record) = self.neighbors.get_mut(if_name).and_then(|b| b.get_mut(node_name))
        else {
            return Ok(result);
        };

        log_info!(
            self.logger,
            Facility::Neighbor,
            "Negotiate hold expired for neighbor {} on interface {}",
            node_name,
            if_name
        );

        let from = record.state;
        let to = next_state(from, NeighEvent::NegotiateTimerExpire)?;
        record.state = to;
        self.log_transition(node_name, if_name, from, to);

        result.cancel(TimerKey::NegotiateTx {
            if_name: if_name.to_string(),
            node_name: node_name.to_string(),
        });
        Ok(result)
    }

    /// Graceful-restart window expired without the peer coming back.
    pub fn handle_gr_hold_expiry(
        &mut self,
        if_name: &str,
        node_name: &str,
    ) -> Result<HandlerResult> {
        let mut result = HandlerResult::new();
        let Some(record) = self.neighbors.get_mut(if_name).and_then(|b| b.get_mut(node_name))
        else {
            return Ok(result);
        };

        log_notice!(
            self.logger,
            Facility::Neighbor,
            "Graceful restart window expired for neighbor {} on interface {}",
            node_name,
            if_name
        );

        let from = record.state;
        let to = next_state(from, NeighEvent::GrTimerExpire)?;
        record.state = to;
        self.log_transition(node_name, if_name, from, to);

        let record = &self.neighbors[if_name][node_name];
        result
            .events
            .push(self.make_event(if_name, record, NeighborEventType::NeighborDown));
        self.erase_record(if_name, node_name, &mut result);
        Ok(result)
    }

    /// Periodic handshake retransmission while negotiating.
    pub fn handle_negotiate_tx_fire(&mut self, if_name: &str, node_name: &str) -> HandlerResult {
        let mut result = HandlerResult::new();
        let Some(record) = self.neighbors.get(if_name).and_then(|b| b.get(node_name)) else {
            return result;
        };
        if record.state != NeighState::Negotiate {
            return result;
        }

        result.packets.push(Outbound::Handshake {
            if_name: if_name.to_string(),
            neighbor_node_name: node_name.to_string(),
            neighbor_area: record.area.clone(),
            is_adj_established: false,
        });
        result.schedule(
            TimerKey::NegotiateTx {
                if_name: if_name.to_string(),
                node_name: node_name.to_string(),
            },
            self.handshake_time,
        );
        result
    }

    /// Reflected timing block for an outbound hello on `if_name`.
    pub fn reflected_infos(&self, if_name: &str) -> BTreeMap<String, ReflectedNeighborInfo> {
        let mut infos = BTreeMap::new();
        if let Some(bucket) = self.neighbors.get(if_name) {
            for (node_name, record) in bucket {
                infos.insert(
                    node_name.clone(),
                    ReflectedNeighborInfo {
                        seq_num: record.seq_num,
                        last_nbr_msg_sent_ts_us: record.neighbor_timestamp_us,
                        last_my_msg_rcvd_ts_us: record.local_timestamp_us,
                    },
                );
            }
        }
        infos
    }

    /// Whether any neighbor on the interface is ESTABLISHED. Heartbeats are
    /// pointless without one.
    pub fn has_active_neighbors(&self, if_name: &str) -> bool {
        self.active.get(if_name).is_some_and(|s| !s.is_empty())
    }

    pub fn state_of(&self, if_name: &str, node_name: &str) -> Option<NeighState> {
        self.neighbors
            .get(if_name)
            .and_then(|b| b.get(node_name))
            .map(|r| r.state)
    }

    pub fn get(&self, if_name: &str, node_name: &str) -> Option<&NeighborRecord> {
        self.neighbors.get(if_name).and_then(|b| b.get(node_name))
    }

    /// All records, for gauge refresh and snapshots.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &NeighborRecord)> {
        self.neighbors.iter().flat_map(|(if_name, bucket)| {
            bucket
                .iter()
                .map(move |(node_name, record)| (if_name.as_str(), node_name.as_str(), record))
        })
    }

    pub fn snapshot(&self) -> Vec<NeighborSnapshot> {
        let mut snaps: Vec<NeighborSnapshot> = self
            .iter()
            .map(|(if_name, node_name, record)| NeighborSnapshot {
                if_name: if_name.to_string(),
                node_name: node_name.to_string(),
                state: record.state,
                area: record.area.clone(),
                label: record.label,
                rtt_us: record.rtt_us,
                seq_num: record.seq_num,
            })
            .collect();
        snaps.sort_by(|a, b| (&a.if_name, &a.node_name).cmp(&(&b.if_name, &b.node_name)));
        snaps
    }

    pub fn num_tracked(&self) -> usize {
        self.neighbors.values().map(|b| b.len()).sum()
    }

    pub fn num_adjacent(&self) -> usize {
        self.active.values().map(|s| s.len()).sum()
    }

    pub fn label_is_allocated(&self, label: u32) -> bool {
        self.labels.contains(label)
    }

    pub fn num_allocated_labels(&self) -> usize {
        self.labels.len()
    }
}
