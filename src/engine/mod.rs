// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The discovery engine: a single cooperative event loop owning the
//! socket, the interface table, the neighbor table and all protocol
//! timers.
//!
//! External producers and consumers talk to the loop through channels on
//! the [`EngineHandle`]: interface snapshots flow in, adjacency events flow
//! out, and queries are marshalled through oneshot replies so callers see
//! consistent snapshots without sharing state.

pub mod area;
pub mod events;
pub mod interface;
pub mod label;
pub mod neighbor;
pub mod rate_limit;
pub mod rtt;
pub mod socket;
pub mod state_machine;
pub mod timer;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use rand::Rng;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::Config;
use crate::counters::{keys, Counters};
use crate::logging::{Facility, Logger};
use crate::wire::{Envelope, HandshakeMsg, HeartbeatMsg, HelloMsg, MAX_PACKET_SIZE};
use crate::{log_debug, log_error, log_info, log_notice, log_warning};
use crate::{InterfaceDatabase, NeighborEvent};

use area::AreaResolver;
use events::EventPublisher;
use interface::InterfaceTable;
use neighbor::{HandlerResult, NeighborSnapshot, NeighborTable, Outbound, TimerOp};
use rate_limit::PacketRateLimiter;
use socket::{current_time_us, NeighborSocket, RecvMeta, REQUIRED_HOP_LIMIT};
use state_machine::NeighState;
use timer::{TimerKey, TimerManager};

/// Restarting hellos sent per interface on shutdown; duplicates absorb
/// packet loss.
const NUM_RESTARTING_PKT_SENT: usize = 3;

/// Fast-init lasts this many fast-hello intervals after an interface is
/// added. Forming an adjacency needs at least two hellos, so this leaves
/// a comfortable margin.
const FAST_INIT_INTERVALS: u32 = 6;

/// How often gauges are recomputed.
const COUNTER_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Sleep used when no timer is armed.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

/// Query marshalled onto the event loop.
pub enum Query {
    NeighborState {
        if_name: String,
        node_name: String,
        reply: oneshot::Sender<Option<NeighState>>,
    },
    Neighbors {
        reply: oneshot::Sender<Vec<NeighborSnapshot>>,
    },
    Counters {
        reply: oneshot::Sender<BTreeMap<String, u64>>,
    },
}

/// External interface to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    interface_tx: mpsc::Sender<InterfaceDatabase>,
    query_tx: mpsc::Sender<Query>,
    publisher: EventPublisher,
    shutdown_tx: watch::Sender<bool>,
}

impl EngineHandle {
    /// Feed one interface-database snapshot to the engine.
    pub async fn push_interface_db(&self, db: InterfaceDatabase) -> Result<()> {
        self.interface_tx
            .send(db)
            .await
            .context("engine is gone; interface update dropped")
    }

    /// Subscribe to adjacency events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<NeighborEvent> {
        self.publisher.subscribe()
    }

    /// State of one neighbor, or `None` if it is not tracked.
    pub async fn neighbor_state(&self, if_name: &str, node_name: &str) -> Option<NeighState> {
        let (reply, rx) = oneshot::channel();
        self.query_tx
            .send(Query::NeighborState {
                if_name: if_name.to_string(),
                node_name: node_name.to_string(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Snapshot of every tracked neighbor.
    pub async fn neighbors(&self) -> Vec<NeighborSnapshot> {
        let (reply, rx) = oneshot::channel();
        if self
            .query_tx
            .send(Query::Neighbors { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Snapshot of all counters and gauges.
    pub async fn counters(&self) -> BTreeMap<String, u64> {
        let (reply, rx) = oneshot::channel();
        if self
            .query_tx
            .send(Query::Counters { reply })
            .await
            .is_err()
        {
            return BTreeMap::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Ask the engine to announce restart and stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// The engine. Construct with [`Engine::new`], then drive with
/// [`Engine::run`] until shutdown.
pub struct Engine {
    my_node_name: String,
    my_domain_name: String,
    enable_v4: bool,
    version: u32,
    kvstore_port: u16,
    ctrl_port: u16,
    timing: crate::config::TimingConfig,

    socket: AsyncFd<NeighborSocket>,
    interfaces: InterfaceTable,
    neighbors: NeighborTable,
    timers: TimerManager,
    areas: AreaResolver,
    rate_limiter: PacketRateLimiter,
    counters: Counters,
    publisher: EventPublisher,

    /// Monotonic over the process lifetime; incremented after every hello
    /// and heartbeat send, success or failure.
    my_seq_num: u64,

    interface_rx: mpsc::Receiver<InterfaceDatabase>,
    interface_closed: bool,
    query_rx: mpsc::Receiver<Query>,
    queries_closed: bool,
    shutdown_rx: watch::Receiver<bool>,

    logger: Logger,
}

impl Engine {
    /// Build the engine from a validated config. Socket setup failures and
    /// incoherent configuration are fatal.
    pub fn new(config: Config, logger: Logger) -> Result<(Self, EngineHandle)> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("configuration rejected: {e}"))?;

        let areas =
            AreaResolver::from_config(&config.areas).context("compiling area rules")?;

        let raw_socket = NeighborSocket::open(config.udp_mcast_port, config.ip_tos, &logger)
            .context("discovery socket setup")?;
        let socket = AsyncFd::new(raw_socket).context("registering discovery socket")?;

        let neighbors = NeighborTable::new(
            config.node_name.clone(),
            config.domain_name.clone(),
            config.enable_v4,
            config.min_supported_version,
            config.timing.heartbeat_hold_time(),
            config.timing.hold_time(),
            config.timing.handshake_time(),
            config.timing.negotiate_hold_time(),
            logger.clone(),
        );

        let (interface_tx, interface_rx) = mpsc::channel(64);
        let (query_tx, query_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let publisher = EventPublisher::default();

        let handle = EngineHandle {
            interface_tx,
            query_tx,
            publisher: publisher.clone(),
            shutdown_tx,
        };

        let engine = Self {
            my_node_name: config.node_name,
            my_domain_name: config.domain_name,
            enable_v4: config.enable_v4,
            version: config.version,
            kvstore_port: config.kvstore_port,
            ctrl_port: config.ctrl_port,
            timing: config.timing,
            socket,
            interfaces: InterfaceTable::new(),
            neighbors,
            timers: TimerManager::new(),
            areas,
            rate_limiter: PacketRateLimiter::new(),
            counters: Counters::new(),
            publisher,
            my_seq_num: 1,
            interface_rx,
            interface_closed: false,
            query_rx,
            queries_closed: false,
            shutdown_rx,
            logger,
        };

        Ok((engine, handle))
    }

    /// Run the event loop until shutdown is requested. An `Err` return is a
    /// fatal condition; the caller exits and the supervisor restarts us.
    pub async fn run(mut self) -> Result<()> {
        log_notice!(
            self.logger,
            Facility::Engine,
            "Discovery engine started (node {}, domain {})",
            self.my_node_name,
            self.my_domain_name
        );

        self.timers
            .schedule(TimerKey::CounterRefresh, Instant::now() + COUNTER_REFRESH_INTERVAL);

        let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];

        loop {
            let sleep_duration = match self.timers.next_deadline() {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => IDLE_SLEEP,
            };

            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    match changed {
                        Ok(()) => {
                            if *self.shutdown_rx.borrow() {
                                break;
                            }
                        }
                        // Every handle is gone; nothing can drive us again.
                        Err(_) => break,
                    }
                }

                maybe_db = self.interface_rx.recv(), if !self.interface_closed => {
                    match maybe_db {
                        Some(db) => self.process_interface_updates(db)?,
                        None => {
                            log_info!(
                                self.logger,
                                Facility::Engine,
                                "Interface update channel closed"
                            );
                            self.interface_closed = true;
                        }
                    }
                }

                maybe_query = self.query_rx.recv(), if !self.queries_closed => {
                    match maybe_query {
                        Some(query) => self.answer_query(query),
                        None => self.queries_closed = true,
                    }
                }

                result = self.socket.readable() => {
                    let mut guard = result.context("waiting for discovery socket")?;
                    // Drain in bounded batches so timers and updates still
                    // get their turn under load.
                    let mut batch: Vec<(Vec<u8>, RecvMeta)> = Vec::new();
                    loop {
                        match guard.get_inner().recv(&mut buf) {
                            Ok(meta) => {
                                batch.push((buf[..meta.len].to_vec(), meta));
                                if batch.len() >= 64 {
                                    break;
                                }
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                                guard.clear_ready();
                                break;
                            }
                            Err(e) => {
                                log_error!(
                                    self.logger,
                                    Facility::Transceiver,
                                    "Discovery socket read error: {}",
                                    e
                                );
                                guard.clear_ready();
                                break;
                            }
                        }
                    }
                    drop(guard);
                    for (payload, meta) in batch {
                        self.handle_packet(&payload, meta)?;
                    }
                }

                _ = tokio::time::sleep(sleep_duration) => {
                    for key in self.timers.pop_expired(Instant::now()) {
                        self.handle_timer(key)?;
                    }
                }
            }
        }

        self.announce_restart();
        log_notice!(
            self.logger,
            Facility::Engine,
            "Restarting hellos sent to all neighbors; engine stopping"
        );
        Ok(())
    }

    /// Shutdown path: tell every neighbor we are restarting so they hold
    /// our routes through the grace window.
    fn announce_restart(&mut self) {
        let if_names: Vec<String> = self.interfaces.names().map(|s| s.to_string()).collect();
        for _ in 0..NUM_RESTARTING_PKT_SENT {
            for if_name in &if_names {
                self.send_hello(if_name, false, true);
            }
        }
    }

    fn answer_query(&mut self, query: Query) {
        match query {
            Query::NeighborState {
                if_name,
                node_name,
                reply,
            } => {
                let _ = reply.send(self.neighbors.state_of(&if_name, &node_name));
            }
            Query::Neighbors { reply } => {
                let _ = reply.send(self.neighbors.snapshot());
            }
            Query::Counters { reply } => {
                self.refresh_counters();
                let _ = reply.send(self.counters.snapshot());
            }
        }
    }

    /// The receive pipeline: hop-limit guard, interface resolution, rate
    /// limiting, decode, dispatch.
    fn handle_packet(&mut self, payload: &[u8], meta: RecvMeta) -> Result<()> {
        if meta.hop_limit < REQUIRED_HOP_LIMIT {
            log_warning!(
                self.logger,
                Facility::Transceiver,
                "Rejecting packet from {} with hop limit {}",
                meta.src_addr,
                meta.hop_limit
            );
            self.counters.bump(keys::HOP_LIMIT_REJECTED);
            return Ok(());
        }

        let Some(if_name) = self.interfaces.name_by_index(meta.if_index).map(String::from)
        else {
            log_warning!(
                self.logger,
                Facility::Transceiver,
                "Packet from {} on unknown ifIndex {}; ignoring",
                meta.src_addr,
                meta.if_index
            );
            return Ok(());
        };

        self.counters.bump(keys::PACKET_RECV);
        self.counters.bump_by(keys::PACKET_RECV_SIZE, meta.len as u64);

        if !self
            .rate_limiter
            .allow(&if_name, IpAddr::V6(meta.src_addr), Instant::now())
        {
            log_warning!(
                self.logger,
                Facility::Transceiver,
                "Rate limit exceeded for {} on {}; dropping packet",
                meta.src_addr,
                if_name
            );
            self.counters.bump(keys::PACKET_DROPPED);
            return Ok(());
        }

        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                log_warning!(
                    self.logger,
                    Facility::Transceiver,
                    "Undecodable packet from {} on {}: {}",
                    meta.src_addr,
                    if_name,
                    e
                );
                self.counters.bump(keys::PACKET_DROPPED);
                return Ok(());
            }
        };
        self.counters.bump(keys::PACKET_PROCESSED);

        let result = if let Some(hello) = &envelope.hello {
            self.neighbors.handle_hello(
                &if_name,
                hello,
                meta.recv_time_us,
                self.my_seq_num,
                meta.if_index,
                &self.areas,
                &mut self.counters,
            )?
        } else if let Some(handshake) = &envelope.handshake {
            self.neighbors
                .handle_handshake(&if_name, handshake, &self.interfaces, &mut self.counters)?
        } else if let Some(heartbeat) = &envelope.heartbeat {
            self.neighbors.handle_heartbeat(&if_name, heartbeat)
        } else {
            HandlerResult::new()
        };

        self.apply(result);
        Ok(())
    }

    /// Apply the side effects a handler requested.
    fn apply(&mut self, result: HandlerResult) {
        let now = Instant::now();
        for op in result.timers {
            match op {
                TimerOp::Schedule { key, after } => self.timers.schedule(key, now + after),
                TimerOp::Cancel(key) => self.timers.cancel(&key),
            }
        }
        for packet in result.packets {
            match packet {
                Outbound::Hello { if_name } => self.send_hello(&if_name, false, false),
                Outbound::Handshake {
                    if_name,
                    neighbor_node_name,
                    neighbor_area,
                    is_adj_established,
                } => self.send_handshake(
                    &if_name,
                    &neighbor_node_name,
                    &neighbor_area,
                    is_adj_established,
                ),
            }
        }
        for event in result.events {
            self.publisher.publish(event);
        }
    }

    fn handle_timer(&mut self, key: TimerKey) -> Result<()> {
        match key {
            TimerKey::HelloTx { if_name } => {
                let Some(interface) = self.interfaces.get(&if_name) else {
                    return Ok(()); // untracked since scheduling; let it die
                };
                let fast_window =
                    self.timing.hello_fast_init_time() * FAST_INIT_INTERVALS;
                let in_fast_init = interface.tracked_since.elapsed() <= fast_window;

                self.send_hello(&if_name, in_fast_init, false);

                let base = if in_fast_init {
                    self.timing.hello_fast_init_time()
                } else {
                    self.timing.hello_time()
                };
                self.timers
                    .schedule(TimerKey::HelloTx { if_name }, Instant::now() + jittered(base));
            }

            TimerKey::HeartbeatTx { if_name } => {
                if !self.interfaces.contains(&if_name) {
                    return Ok(());
                }
                self.send_heartbeat(&if_name);
                self.timers.schedule(
                    TimerKey::HeartbeatTx { if_name },
                    Instant::now() + self.timing.heartbeat_time(),
                );
            }

            TimerKey::NegotiateTx { if_name, node_name } => {
                let result = self.neighbors.handle_negotiate_tx_fire(&if_name, &node_name);
                self.apply(result);
            }

            TimerKey::NegotiateHold { if_name, node_name } => {
                let result = self
                    .neighbors
                    .handle_negotiate_hold_expiry(&if_name, &node_name)?;
                self.apply(result);
            }

            TimerKey::HeartbeatHold { if_name, node_name } => {
                let result = self
                    .neighbors
                    .handle_heartbeat_hold_expiry(&if_name, &node_name)?;
                self.apply(result);
            }

            TimerKey::GracefulRestartHold { if_name, node_name } => {
                let result = self.neighbors.handle_gr_hold_expiry(&if_name, &node_name)?;
                self.apply(result);
            }

            TimerKey::CounterRefresh => {
                self.refresh_counters();
                self.timers
                    .schedule(TimerKey::CounterRefresh, Instant::now() + COUNTER_REFRESH_INTERVAL);
            }
        }
        Ok(())
    }

    /// Reconcile one interface snapshot. Deletions run first so a rename
    /// never has two tracked interfaces claiming one ifIndex.
    fn process_interface_updates(&mut self, db: InterfaceDatabase) -> Result<()> {
        if db.node_name != self.my_node_name {
            bail!(
                "interface snapshot for node {} does not match my node name {}",
                db.node_name,
                self.my_node_name
            );
        }

        let eligible =
            InterfaceTable::eligible_from_snapshot(&db, self.enable_v4, Instant::now());
        let plan = self.interfaces.plan(&eligible);
        if plan.is_noop() {
            log_debug!(
                self.logger,
                Facility::Interface,
                "Interface snapshot produced no changes"
            );
            return Ok(());
        }

        for if_name in &plan.to_del {
            log_notice!(
                self.logger,
                Facility::Interface,
                "Removing interface {}; declaring its neighbors down",
                if_name
            );
            let result = self.neighbors.remove_interface(if_name);
            self.apply(result);
            self.timers.cancel_interface(if_name);
            if let Some(state) = self.interfaces.remove(if_name) {
                // Membership is best-effort on the way down; the kernel
                // drops it with the ifIndex anyway.
                if let Err(e) = self.socket.get_ref().leave_group(state.if_index) {
                    log_warning!(self.logger, Facility::Interface, "{}", e);
                }
            }
        }

        for if_name in &plan.to_add {
            let state = eligible[if_name].clone();
            anyhow::ensure!(state.if_index != 0, "interface {} has no ifIndex", if_name);

            self.socket.get_ref().join_group(state.if_index)?;
            log_notice!(
                self.logger,
                Facility::Interface,
                "Tracking interface {} (ifIndex {}, v6 {}, v4 {})",
                if_name,
                state.if_index,
                state.v6_link_local_network,
                state
                    .v4_network
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );

            self.interfaces.insert(if_name.clone(), state);
            self.neighbors.add_interface(if_name);

            let now = Instant::now();
            self.timers.schedule(
                TimerKey::HeartbeatTx {
                    if_name: if_name.clone(),
                },
                now + self.timing.heartbeat_time(),
            );
            // The first hello is deliberately delayed one fast interval:
            // the link-local address may not be usable the instant the
            // interface appears.
            self.timers.schedule(
                TimerKey::HelloTx {
                    if_name: if_name.clone(),
                },
                now + jittered(self.timing.hello_fast_init_time()),
            );
        }

        for (if_name, old_if_index) in &plan.to_update {
            let state = eligible[if_name].clone();
            if state.if_index != *old_if_index {
                log_notice!(
                    self.logger,
                    Facility::Interface,
                    "Interface {} changed ifIndex {} -> {}",
                    if_name,
                    old_if_index,
                    state.if_index
                );
                if let Err(e) = self.socket.get_ref().leave_group(*old_if_index) {
                    log_warning!(self.logger, Facility::Interface, "{}", e);
                }
                self.socket.get_ref().join_group(state.if_index)?;
            } else {
                log_info!(
                    self.logger,
                    Facility::Interface,
                    "Interface {} addresses updated in place",
                    if_name
                );
            }
            self.interfaces.update(if_name, state);
        }

        Ok(())
    }

    /// Build and transmit a hello. The sequence number advances whether or
    /// not the packet made it out.
    fn send_hello(&mut self, if_name: &str, in_fast_init: bool, restarting: bool) {
        let Some(interface) = self.interfaces.get(if_name) else {
            log_warning!(
                self.logger,
                Facility::Transceiver,
                "Interface {} is no longer tracked; hello skipped",
                if_name
            );
            return;
        };
        let if_index = interface.if_index;
        let src_addr = match interface.v6_link_local_network.addr {
            IpAddr::V6(addr) => addr,
            IpAddr::V4(_) => unreachable!("tracked interface without v6 link-local"),
        };

        let msg = HelloMsg {
            node_name: self.my_node_name.clone(),
            domain_name: self.my_domain_name.clone(),
            if_name: if_name.to_string(),
            seq_num: self.my_seq_num,
            version: self.version,
            sent_ts_us: current_time_us(),
            solicit_response: in_fast_init,
            restarting,
            neighbor_infos: self.neighbors.reflected_infos(if_name),
        };
        self.my_seq_num += 1;

        match Envelope::from_hello(msg).encode() {
            Ok(payload) => {
                if self.transmit(&payload, if_index, src_addr, if_name) {
                    self.counters.bump(keys::HELLO_PACKETS_SENT);
                    self.counters.bump_by(keys::HELLO_BYTES_SENT, payload.len() as u64);
                }
            }
            Err(e) => {
                log_error!(
                    self.logger,
                    Facility::Transceiver,
                    "Hello on {} not sent: {}",
                    if_name,
                    e
                );
            }
        }
    }

    /// Build and transmit a targeted handshake.
    fn send_handshake(
        &mut self,
        if_name: &str,
        neighbor_node_name: &str,
        neighbor_area: &str,
        is_adj_established: bool,
    ) {
        let Some(interface) = self.interfaces.get(if_name) else {
            log_warning!(
                self.logger,
                Facility::Transceiver,
                "Interface {} is no longer tracked; handshake skipped",
                if_name
            );
            return;
        };
        let if_index = interface.if_index;
        let src_addr = match interface.v6_link_local_network.addr {
            IpAddr::V6(addr) => addr,
            IpAddr::V4(_) => unreachable!("tracked interface without v6 link-local"),
        };
        let v4_addr = interface.v4_network.and_then(|n| match n.addr {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        });

        let msg = HandshakeMsg {
            node_name: self.my_node_name.clone(),
            neighbor_node_name: Some(neighbor_node_name.to_string()),
            is_adj_established,
            hold_time_ms: self.timing.heartbeat_hold_time_ms,
            graceful_restart_time_ms: self.timing.hold_time_ms,
            transport_address_v4: v4_addr,
            transport_address_v6: Some(src_addr),
            kvstore_port: self.kvstore_port,
            ctrl_port: self.ctrl_port,
            area: neighbor_area.to_string(),
        };

        match Envelope::from_handshake(msg).encode() {
            Ok(payload) => {
                if self.transmit(&payload, if_index, src_addr, if_name) {
                    self.counters.bump(keys::HANDSHAKE_PACKETS_SENT);
                    self.counters
                        .bump_by(keys::HANDSHAKE_BYTES_SENT, payload.len() as u64);
                }
            }
            Err(e) => {
                log_error!(
                    self.logger,
                    Facility::Transceiver,
                    "Handshake on {} not sent: {}",
                    if_name,
                    e
                );
            }
        }
    }

    /// Build and transmit a heartbeat. Interfaces without an established
    /// neighbor stay quiet, but the sequence number still advances.
    fn send_heartbeat(&mut self, if_name: &str) {
        let seq_num = self.my_seq_num;
        self.my_seq_num += 1;

        if !self.neighbors.has_active_neighbors(if_name) {
            return;
        }
        let Some(interface) = self.interfaces.get(if_name) else {
            return;
        };
        let if_index = interface.if_index;
        let src_addr = match interface.v6_link_local_network.addr {
            IpAddr::V6(addr) => addr,
            IpAddr::V4(_) => unreachable!("tracked interface without v6 link-local"),
        };

        let msg = HeartbeatMsg {
            node_name: self.my_node_name.clone(),
            seq_num,
        };

        match Envelope::from_heartbeat(msg).encode() {
            Ok(payload) => {
                if self.transmit(&payload, if_index, src_addr, if_name) {
                    self.counters.bump(keys::HEARTBEAT_PACKETS_SENT);
                    self.counters
                        .bump_by(keys::HEARTBEAT_BYTES_SENT, payload.len() as u64);
                }
            }
            Err(e) => {
                log_error!(
                    self.logger,
                    Facility::Transceiver,
                    "Heartbeat on {} not sent: {}",
                    if_name,
                    e
                );
            }
        }
    }

    /// Put one payload on the wire. Send failures are logged, not fatal:
    /// the interface may be mid-teardown and a down event on its way.
    fn transmit(
        &self,
        payload: &[u8],
        if_index: u32,
        src_addr: std::net::Ipv6Addr,
        if_name: &str,
    ) -> bool {
        match self.socket.get_ref().send(payload, if_index, src_addr) {
            Ok(sent) if sent == payload.len() => true,
            Ok(sent) => {
                log_warning!(
                    self.logger,
                    Facility::Transceiver,
                    "Short send on {}: {} of {} bytes",
                    if_name,
                    sent,
                    payload.len()
                );
                false
            }
            Err(e) => {
                log_warning!(
                    self.logger,
                    Facility::Transceiver,
                    "Multicast send on {} failed: {}",
                    if_name,
                    e
                );
                false
            }
        }
    }

    fn refresh_counters(&mut self) {
        self.counters
            .set_gauge(keys::NUM_TRACKED_INTERFACES, self.interfaces.len() as u64);
        self.counters
            .set_gauge(keys::NUM_TRACKED_NEIGHBORS, self.neighbors.num_tracked() as u64);
        self.counters
            .set_gauge(keys::NUM_ADJACENT_NEIGHBORS, self.neighbors.num_adjacent() as u64);
        self.counters.set_gauge(keys::MY_SEQ_NUM, self.my_seq_num);

        let mut gauges: Vec<(String, u64)> = Vec::new();
        for (if_name, node_name, record) in self.neighbors.iter() {
            gauges.push((
                format!("rtt_us.{}.{}", node_name, if_name),
                record.rtt_us as u64,
            ));
            gauges.push((
                format!("rtt_latest_us.{}", node_name),
                record.rtt_latest_us as u64,
            ));
            gauges.push((format!("seq_num.{}", node_name), record.seq_num));
        }
        for (key, value) in gauges {
            self.counters.set_gauge_owned(key, value);
        }
    }
}

/// Add ±20% of jitter to a timer period so hellos from a fleet of nodes
/// do not synchronize.
fn jittered(base: Duration) -> Duration {
    let base_ms = base.as_millis() as i64;
    if base_ms < 5 {
        return base;
    }
    let spread = base_ms / 5;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis((base_ms + offset).max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::Severity;

    #[test]
    fn test_jitter_stays_within_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..200 {
            let value = jittered(base).as_millis() as i64;
            assert!((800..=1200).contains(&value), "jitter {} out of range", value);
        }
    }

    #[test]
    fn test_jitter_passthrough_for_tiny_periods() {
        assert_eq!(jittered(Duration::from_millis(2)), Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_engine_lifecycle_and_queries() {
        let config = Config::parse(r#"{ node_name: "node-1", domain_name: "dc1", udp_mcast_port: 0 }"#)
            .unwrap();
        let logger = Logger::stderr(Severity::Error);
        // Environments without IPv6 cannot open the socket; nothing to
        // exercise there.
        let Ok((engine, handle)) = Engine::new(config, logger) else {
            eprintln!("skipping: IPv6 socket unavailable");
            return;
        };

        let task = tokio::spawn(engine.run());

        // An empty snapshot is valid and tracks nothing.
        handle
            .push_interface_db(InterfaceDatabase {
                node_name: "node-1".to_string(),
                interfaces: Default::default(),
            })
            .await
            .unwrap();

        assert!(handle.neighbors().await.is_empty());
        assert_eq!(handle.neighbor_state("eth0", "nobody").await, None);
        let counters = handle.counters().await;
        assert_eq!(counters.get(keys::NUM_TRACKED_INTERFACES), Some(&0));

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_spoofed_hop_limit_is_rejected_before_tracking() {
        let config = Config::parse(r#"{ node_name: "node-1", domain_name: "dc1", udp_mcast_port: 0 }"#)
            .unwrap();
        let logger = Logger::stderr(Severity::Error);
        let Ok((mut engine, _handle)) = Engine::new(config, logger) else {
            eprintln!("skipping: IPv6 socket unavailable");
            return;
        };

        let hello = crate::wire::HelloMsg {
            node_name: "node-2".to_string(),
            domain_name: "dc1".to_string(),
            if_name: "eth9".to_string(),
            seq_num: 1,
            version: 20260801,
            sent_ts_us: 1,
            solicit_response: false,
            restarting: false,
            neighbor_infos: Default::default(),
        };
        let payload = Envelope::from_hello(hello).encode().unwrap();
        let meta = RecvMeta {
            len: payload.len(),
            if_index: 2,
            src_addr: "fe80::2".parse().unwrap(),
            hop_limit: 64,
            recv_time_us: 1,
        };

        engine.handle_packet(&payload, meta).unwrap();

        // Dropped at the hop-limit guard: counted there, nowhere else, and
        // no neighbor state came into existence.
        assert_eq!(engine.counters.get(keys::HOP_LIMIT_REJECTED), 1);
        assert_eq!(engine.counters.get(keys::LOOPED_PACKET), 0);
        assert_eq!(engine.counters.get(keys::PACKET_RECV), 0);
        assert_eq!(engine.neighbors.num_tracked(), 0);
    }

    #[tokio::test]
    async fn test_engine_rejects_foreign_snapshot() {
        let config = Config::parse(r#"{ node_name: "node-1", domain_name: "dc1", udp_mcast_port: 0 }"#)
            .unwrap();
        let logger = Logger::stderr(Severity::Error);
        let Ok((engine, handle)) = Engine::new(config, logger) else {
            eprintln!("skipping: IPv6 socket unavailable");
            return;
        };

        let task = tokio::spawn(engine.run());
        handle
            .push_interface_db(InterfaceDatabase {
                node_name: "someone-else".to_string(),
                interfaces: Default::default(),
            })
            .await
            .unwrap();

        // A snapshot for another node is a fatal wiring error.
        let result = task.await.unwrap();
        assert!(result.is_err());
    }
}
