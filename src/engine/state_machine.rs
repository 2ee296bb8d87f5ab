// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-neighbor finite state machine.
//!
//! The transition table is a pure function of (state, event). Side effects
//! (timer arm/cancel, event publishing, label bookkeeping) live at the call
//! sites in the neighbor table, keeping the table testable in isolation.
//!
//! WARM means "I have heard the peer"; NEGOTIATE means "the peer has heard
//! me back and parameters are being exchanged"; ESTABLISHED means the
//! adjacency is up; RESTART is a grace window preserving routes while the
//! peer reboots.

/// Neighbor adjacency state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NeighState {
    Idle,
    Warm,
    Negotiate,
    Established,
    Restart,
}

impl NeighState {
    pub const fn as_str(self) -> &'static str {
        match self {
            NeighState::Idle => "IDLE",
            NeighState::Warm => "WARM",
            NeighState::Negotiate => "NEGOTIATE",
            NeighState::Established => "ESTABLISHED",
            NeighState::Restart => "RESTART",
        }
    }
}

impl std::fmt::Display for NeighState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event driving the neighbor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighEvent {
    /// Hello received whose reflected neighbor list includes us.
    HelloRcvdInfo,
    /// Hello received that does not mention us.
    HelloRcvdNoInfo,
    /// Hello received with the restarting flag set.
    HelloRcvdRestart,
    HandshakeRcvd,
    HeartbeatRcvd,
    HeartbeatTimerExpire,
    NegotiateTimerExpire,
    GrTimerExpire,
    NegotiationFailure,
}

impl NeighEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            NeighEvent::HelloRcvdInfo => "HELLO_RCVD_INFO",
            NeighEvent::HelloRcvdNoInfo => "HELLO_RCVD_NO_INFO",
            NeighEvent::HelloRcvdRestart => "HELLO_RCVD_RESTART",
            NeighEvent::HandshakeRcvd => "HANDSHAKE_RCVD",
            NeighEvent::HeartbeatRcvd => "HEARTBEAT_RCVD",
            NeighEvent::HeartbeatTimerExpire => "HEARTBEAT_TIMER_EXPIRE",
            NeighEvent::NegotiateTimerExpire => "NEGOTIATE_TIMER_EXPIRE",
            NeighEvent::GrTimerExpire => "GR_TIMER_EXPIRE",
            NeighEvent::NegotiationFailure => "NEGOTIATION_FAILURE",
        }
    }
}

impl std::fmt::Display for NeighEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An event arrived in a state that has no transition for it. This is a
/// programming error, not a protocol condition; callers treat it as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub state: NeighState,
    pub event: NeighEvent,
}

impl std::fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "illegal state machine transition: no edge for event {} in state {}",
            self.event, self.state
        )
    }
}

impl std::error::Error for IllegalTransition {}

/// Look up the successor state for (state, event).
pub fn next_state(state: NeighState, event: NeighEvent) -> Result<NeighState, IllegalTransition> {
    use NeighEvent::*;
    use NeighState::*;

    match (state, event) {
        (Idle, HelloRcvdInfo) => Ok(Warm),
        (Idle, HelloRcvdNoInfo) => Ok(Warm),

        (Warm, HelloRcvdInfo) => Ok(Negotiate),

        (Negotiate, HandshakeRcvd) => Ok(Established),
        (Negotiate, NegotiateTimerExpire) => Ok(Warm),
        (Negotiate, NegotiationFailure) => Ok(Warm),

        (Established, HelloRcvdNoInfo) => Ok(Idle),
        (Established, HelloRcvdRestart) => Ok(Restart),
        (Established, HeartbeatRcvd) => Ok(Established),
        (Established, HeartbeatTimerExpire) => Ok(Idle),

        (Restart, HelloRcvdInfo) => Ok(Established),
        (Restart, GrTimerExpire) => Ok(Idle),

        _ => Err(IllegalTransition { state, event }),
    }
}
