// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Facility-scoped logging for the discovery engine.
//!
//! Every component logs through a cloneable [`Logger`] handle tagged with a
//! [`Facility`]. A global minimum severity plus optional per-facility
//! overrides decide what reaches the sink; filtered messages are dropped
//! before formatting.

mod logger;
mod macros;

pub use logger::Logger;

/// Log severity levels, most severe first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Error conditions (packet path failures, negotiation breakdown)
    Error = 0,
    /// Warning conditions (degraded timestamping, lagging subscribers)
    Warning = 1,
    /// Significant normal events (adjacency up/down, interface tracking)
    Notice = 2,
    /// Informational (state transitions, timer activity)
    Info = 3,
    /// Verbose per-packet traces
    Debug = 4,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
        }
    }

    /// Parse a severity name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "error" => Some(Severity::Error),
            "warning" | "warn" => Some(Severity::Warning),
            "notice" => Some(Severity::Notice),
            "info" => Some(Severity::Info),
            "debug" => Some(Severity::Debug),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Component that produced a log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facility {
    /// Event loop core, startup and shutdown
    Engine,
    /// Interface tracking and multicast membership
    Interface,
    /// Neighbor records and the per-neighbor state machine
    Neighbor,
    /// Socket send/receive path
    Transceiver,
    /// Timer scheduling
    Timer,
    /// Configuration loading
    Config,
    /// Counter maintenance
    Stats,
    /// Test fixtures
    Test,
}

impl Facility {
    pub const fn as_str(self) -> &'static str {
        match self {
            Facility::Engine => "Engine",
            Facility::Interface => "Interface",
            Facility::Neighbor => "Neighbor",
            Facility::Transceiver => "Transceiver",
            Facility::Timer => "Timer",
            Facility::Config => "Config",
            Facility::Stats => "Stats",
            Facility::Test => "Test",
        }
    }
}

impl std::fmt::Display for Facility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Error < Severity::Warning);
        assert!(Severity::Warning < Severity::Notice);
        assert!(Severity::Notice < Severity::Info);
        assert!(Severity::Info < Severity::Debug);
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("debug"), Some(Severity::Debug));
        assert_eq!(Severity::parse("WARN"), Some(Severity::Warning));
        assert_eq!(Severity::parse("bogus"), None);
    }

    #[test]
    fn test_facility_display() {
        assert_eq!(format!("{}", Facility::Neighbor), "Neighbor");
        assert_eq!(format!("{}", Facility::Transceiver), "Transceiver");
    }
}
