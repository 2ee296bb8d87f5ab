// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Configuration file types and parsing for nbrd.
//!
//! JSON5 configuration format supporting comments and trailing commas.
//! Carries node identity, protocol timing, area-assignment rules and the
//! socket parameters of the discovery engine. An incoherent configuration
//! is refused before the engine starts.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Startup configuration (JSON5 file format).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// This node's name, as advertised in every hello.
    pub node_name: String,

    /// Routing domain. Hellos from other domains are dropped.
    pub domain_name: String,

    /// UDP port for the link-local multicast exchange.
    #[serde(default = "default_udp_mcast_port")]
    pub udp_mcast_port: u16,

    /// Track IPv4 addresses and validate shared v4 subnets during
    /// negotiation.
    #[serde(default)]
    pub enable_v4: bool,

    /// Optional traffic class for outgoing packets (IPV6_TCLASS).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_tos: Option<u32>,

    /// Protocol version advertised in hellos.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Oldest peer version we accept.
    #[serde(default = "default_min_supported_version")]
    pub min_supported_version: u32,

    /// Key-value store control port advertised in handshakes.
    #[serde(default = "default_kvstore_port")]
    pub kvstore_port: u16,

    /// Management control port advertised in handshakes.
    #[serde(default = "default_ctrl_port")]
    pub ctrl_port: u16,

    /// Ordered area-assignment rules. Empty means every neighbor lands in
    /// the default area.
    #[serde(default)]
    pub areas: Vec<AreaConfig>,

    /// Protocol timing. All values in milliseconds.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Minimum log severity ("error", "warning", "notice", "info", "debug").
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// One area-assignment rule. A neighbor matches when every non-empty regex
/// list matches; at least one list must be non-empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AreaConfig {
    pub area_id: String,
    #[serde(default)]
    pub neighbor_regexes: Vec<String>,
    #[serde(default)]
    pub interface_regexes: Vec<String>,
}

/// Protocol timing parameters, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    /// Graceful-restart hold window we advertise, and the floor for the
    /// window we honor for peers.
    #[serde(default = "default_hold_time_ms")]
    pub hold_time_ms: u64,

    /// Keep-alive cadence. The RTT step detector samples at this period and
    /// `hold_time_ms` must be at least three times this value.
    #[serde(default = "default_keep_alive_time_ms")]
    pub keep_alive_time_ms: u64,

    /// Keep-alive cadence during fast-init. Must not exceed
    /// `keep_alive_time_ms`.
    #[serde(default = "default_fast_init_keep_alive_time_ms")]
    pub fast_init_keep_alive_time_ms: u64,

    /// Steady-state hello transmit interval (jittered ±20%).
    #[serde(default = "default_hello_time_ms")]
    pub hello_time_ms: u64,

    /// Hello transmit interval during the fast-init phase after an
    /// interface is added.
    #[serde(default = "default_hello_fast_init_time_ms")]
    pub hello_fast_init_time_ms: u64,

    /// Handshake retransmit interval while negotiating.
    #[serde(default = "default_handshake_time_ms")]
    pub handshake_time_ms: u64,

    /// Heartbeat transmit interval per interface.
    #[serde(default = "default_heartbeat_time_ms")]
    pub heartbeat_time_ms: u64,

    /// How long a neighbor may sit in NEGOTIATE before falling back to WARM.
    #[serde(default = "default_negotiate_hold_time_ms")]
    pub negotiate_hold_time_ms: u64,

    /// Heartbeat hold window we advertise, and the floor for the window we
    /// honor for peers.
    #[serde(default = "default_heartbeat_hold_time_ms")]
    pub heartbeat_hold_time_ms: u64,
}

fn default_udp_mcast_port() -> u16 {
    6666
}
fn default_version() -> u32 {
    20260801
}
fn default_min_supported_version() -> u32 {
    20250101
}
fn default_kvstore_port() -> u16 {
    60001
}
fn default_ctrl_port() -> u16 {
    2018
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_hold_time_ms() -> u64 {
    30_000
}
fn default_keep_alive_time_ms() -> u64 {
    2_000
}
fn default_fast_init_keep_alive_time_ms() -> u64 {
    500
}
fn default_hello_time_ms() -> u64 {
    20_000
}
fn default_hello_fast_init_time_ms() -> u64 {
    500
}
fn default_handshake_time_ms() -> u64 {
    500
}
fn default_heartbeat_time_ms() -> u64 {
    3_000
}
fn default_negotiate_hold_time_ms() -> u64 {
    10_000
}
fn default_heartbeat_hold_time_ms() -> u64 {
    9_000
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            hold_time_ms: default_hold_time_ms(),
            keep_alive_time_ms: default_keep_alive_time_ms(),
            fast_init_keep_alive_time_ms: default_fast_init_keep_alive_time_ms(),
            hello_time_ms: default_hello_time_ms(),
            hello_fast_init_time_ms: default_hello_fast_init_time_ms(),
            handshake_time_ms: default_handshake_time_ms(),
            heartbeat_time_ms: default_heartbeat_time_ms(),
            negotiate_hold_time_ms: default_negotiate_hold_time_ms(),
            heartbeat_hold_time_ms: default_heartbeat_hold_time_ms(),
        }
    }
}

impl TimingConfig {
    pub fn hold_time(&self) -> Duration {
        Duration::from_millis(self.hold_time_ms)
    }
    pub fn keep_alive_time(&self) -> Duration {
        Duration::from_millis(self.keep_alive_time_ms)
    }
    pub fn hello_time(&self) -> Duration {
        Duration::from_millis(self.hello_time_ms)
    }
    pub fn hello_fast_init_time(&self) -> Duration {
        Duration::from_millis(self.hello_fast_init_time_ms)
    }
    pub fn handshake_time(&self) -> Duration {
        Duration::from_millis(self.handshake_time_ms)
    }
    pub fn heartbeat_time(&self) -> Duration {
        Duration::from_millis(self.heartbeat_time_ms)
    }
    pub fn negotiate_hold_time(&self) -> Duration {
        Duration::from_millis(self.negotiate_hold_time_ms)
    }
    pub fn heartbeat_hold_time(&self) -> Duration {
        Duration::from_millis(self.heartbeat_hold_time_ms)
    }
}

impl Config {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate the configuration. An error here is fatal; the engine never
    /// starts with an incoherent config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.is_empty() {
            return Err(ConfigError::EmptyNodeName);
        }
        if self.domain_name.is_empty() {
            return Err(ConfigError::EmptyDomainName);
        }

        let t = &self.timing;
        if t.keep_alive_time_ms == 0 {
            return Err(ConfigError::ZeroKeepAlive);
        }
        if t.hold_time_ms < 3 * t.keep_alive_time_ms {
            return Err(ConfigError::HoldTimeTooSmall {
                hold_time_ms: t.hold_time_ms,
                keep_alive_time_ms: t.keep_alive_time_ms,
            });
        }
        if t.fast_init_keep_alive_time_ms == 0
            || t.fast_init_keep_alive_time_ms > t.keep_alive_time_ms
        {
            return Err(ConfigError::InvalidFastInitKeepAlive {
                fast_init_ms: t.fast_init_keep_alive_time_ms,
                keep_alive_time_ms: t.keep_alive_time_ms,
            });
        }

        if self.min_supported_version > self.version {
            return Err(ConfigError::InvalidVersionPair {
                version: self.version,
                min_supported_version: self.min_supported_version,
            });
        }

        for area in &self.areas {
            if area.neighbor_regexes.is_empty() && area.interface_regexes.is_empty() {
                return Err(ConfigError::EmptyAreaRule {
                    area_id: area.area_id.clone(),
                });
            }
            for pattern in area.neighbor_regexes.iter().chain(&area.interface_regexes) {
                if let Err(e) = regex::Regex::new(pattern) {
                    return Err(ConfigError::InvalidRegex {
                        area_id: area.area_id.clone(),
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    IoError(std::path::PathBuf, String),
    ParseError(String),
    EmptyNodeName,
    EmptyDomainName,
    ZeroKeepAlive,
    HoldTimeTooSmall {
        hold_time_ms: u64,
        keep_alive_time_ms: u64,
    },
    InvalidFastInitKeepAlive {
        fast_init_ms: u64,
        keep_alive_time_ms: u64,
    },
    InvalidVersionPair {
        version: u32,
        min_supported_version: u32,
    },
    EmptyAreaRule {
        area_id: String,
    },
    InvalidRegex {
        area_id: String,
        pattern: String,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, msg) => {
                write!(f, "failed to read config file '{}': {}", path.display(), msg)
            }
            ConfigError::ParseError(msg) => write!(f, "failed to parse config: {}", msg),
            ConfigError::EmptyNodeName => write!(f, "node_name must not be empty"),
            ConfigError::EmptyDomainName => write!(f, "domain_name must not be empty"),
            ConfigError::ZeroKeepAlive => write!(f, "keep_alive_time_ms must be non-zero"),
            ConfigError::HoldTimeTooSmall {
                hold_time_ms,
                keep_alive_time_ms,
            } => write!(
                f,
                "hold_time_ms ({}) must be at least 3x keep_alive_time_ms ({})",
                hold_time_ms, keep_alive_time_ms
            ),
            ConfigError::InvalidFastInitKeepAlive {
                fast_init_ms,
                keep_alive_time_ms,
            } => write!(
                f,
                "fast_init_keep_alive_time_ms ({}) must be non-zero and no larger than keep_alive_time_ms ({})",
                fast_init_ms, keep_alive_time_ms
            ),
            ConfigError::InvalidVersionPair {
                version,
                min_supported_version,
            } => write!(
                f,
                "min_supported_version ({}) exceeds version ({})",
                min_supported_version, version
            ),
            ConfigError::EmptyAreaRule { area_id } => write!(
                f,
                "area rule '{}' needs at least one neighbor or interface regex",
                area_id
            ),
            ConfigError::InvalidRegex {
                area_id,
                pattern,
                reason,
            } => write!(
                f,
                "invalid regex '{}' in area rule '{}': {}",
                pattern, area_id, reason
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        Config::parse(r#"{ node_name: "node-1", domain_name: "dc1" }"#).unwrap()
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = minimal_config();
        assert_eq!(config.node_name, "node-1");
        assert_eq!(config.udp_mcast_port, 6666);
        assert!(!config.enable_v4);
        assert!(config.areas.is_empty());
        assert_eq!(config.timing, TimingConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_config_with_comments() {
        let config = Config::parse(
            r#"{
                // identity
                node_name: "node-1",
                domain_name: "dc1",
                enable_v4: true,
                timing: {
                    hello_time_ms: 10000, // faster hellos
                },
            }"#,
        )
        .unwrap();
        assert!(config.enable_v4);
        assert_eq!(config.timing.hello_time_ms, 10_000);
        // Unspecified timing fields keep their defaults.
        assert_eq!(config.timing.heartbeat_time_ms, 3_000);
    }

    #[test]
    fn test_parse_config_with_areas() {
        let config = Config::parse(
            r#"{
                node_name: "node-1",
                domain_name: "dc1",
                areas: [
                    { area_id: "pod-1", neighbor_regexes: ["rsw.*"], interface_regexes: [] },
                    { area_id: "spine", interface_regexes: ["eth[0-9]+"] },
                ],
            }"#,
        )
        .unwrap();
        assert_eq!(config.areas.len(), 2);
        assert_eq!(config.areas[0].area_id, "pod-1");
        assert!(config.areas[1].neighbor_regexes.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_empty_node_name() {
        let config = Config::parse(r#"{ node_name: "", domain_name: "dc1" }"#).unwrap();
        assert_eq!(config.validate(), Err(ConfigError::EmptyNodeName));
    }

    #[test]
    fn test_validate_zero_keep_alive() {
        let config = Config::parse(
            r#"{ node_name: "n", domain_name: "d", timing: { keep_alive_time_ms: 0 } }"#,
        )
        .unwrap();
        assert_eq!(config.validate(), Err(ConfigError::ZeroKeepAlive));
    }

    #[test]
    fn test_validate_hold_time_coherence() {
        let config = Config::parse(
            r#"{ node_name: "n", domain_name: "d",
                 timing: { hold_time_ms: 5000, keep_alive_time_ms: 2000 } }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HoldTimeTooSmall { .. })
        ));
    }

    #[test]
    fn test_validate_fast_init_bounds() {
        let config = Config::parse(
            r#"{ node_name: "n", domain_name: "d",
                 timing: { fast_init_keep_alive_time_ms: 4000 } }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFastInitKeepAlive { .. })
        ));
    }

    #[test]
    fn test_validate_empty_area_rule() {
        let config = Config::parse(
            r#"{ node_name: "n", domain_name: "d",
                 areas: [{ area_id: "x" }] }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyAreaRule { .. })
        ));
    }

    #[test]
    fn test_validate_bad_regex() {
        let config = Config::parse(
            r#"{ node_name: "n", domain_name: "d",
                 areas: [{ area_id: "x", neighbor_regexes: ["rsw[" ] }] }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_validate_version_pair() {
        let config = Config::parse(
            r#"{ node_name: "n", domain_name: "d",
                 version: 1, min_supported_version: 2 }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidVersionPair { .. })
        ));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = minimal_config();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = Config::parse(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
