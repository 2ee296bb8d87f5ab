// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Area assignment.
//!
//! Each peer is matched against an ordered list of (area-id, neighbor-regex,
//! interface-regex) rules to derive the administrative area used during
//! negotiation. Rules are compiled once at startup and immutable afterwards.

use anyhow::{Context, Result};
use regex::RegexSet;

use crate::config::AreaConfig;

/// Area used when no rules are configured and when a peer predates area
/// support.
pub const DEFAULT_AREA: &str = "0";

/// Outcome of area resolution for one (peer, interface) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AreaMatch {
    /// Exactly one rule matched.
    Unique(String),
    /// No rule matched; the neighbor is ignored.
    None,
    /// More than one rule matched; ambiguous, the neighbor is ignored.
    Ambiguous,
}

struct AreaRule {
    area_id: String,
    neighbor_regexes: Option<RegexSet>,
    interface_regexes: Option<RegexSet>,
}

/// Compiled, ordered area rules shared by reference from the engine.
pub struct AreaResolver {
    rules: Vec<AreaRule>,
}

/// Anchor a pattern to the full string and make it case-insensitive.
fn anchored(pattern: &str) -> String {
    format!("(?i)^(?:{})$", pattern)
}

fn compile_set(patterns: &[String], area_id: &str) -> Result<Option<RegexSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let anchored: Vec<String> = patterns.iter().map(|p| anchored(p)).collect();
    let set = RegexSet::new(&anchored)
        .with_context(|| format!("invalid regex in area rule '{}'", area_id))?;
    Ok(Some(set))
}

impl AreaResolver {
    /// Compile rules from config. With no rules configured, everything maps
    /// to [`DEFAULT_AREA`] via an implicit catch-all, matching nodes that
    /// predate area configuration.
    pub fn from_config(areas: &[AreaConfig]) -> Result<Self> {
        if areas.is_empty() {
            return Self::from_config(&[AreaConfig {
                area_id: DEFAULT_AREA.to_string(),
                neighbor_regexes: vec![".*".to_string()],
                interface_regexes: vec![".*".to_string()],
            }]);
        }

        let mut rules = Vec::with_capacity(areas.len());
        for area in areas {
            let neighbor_regexes = compile_set(&area.neighbor_regexes, &area.area_id)?;
            let interface_regexes = compile_set(&area.interface_regexes, &area.area_id)?;
            anyhow::ensure!(
                neighbor_regexes.is_some() || interface_regexes.is_some(),
                "area rule '{}' needs at least one neighbor or interface regex",
                area.area_id
            );
            rules.push(AreaRule {
                area_id: area.area_id.clone(),
                neighbor_regexes,
                interface_regexes,
            });
        }
        Ok(Self { rules })
    }

    /// Resolve the area for a peer heard on a local interface. When a rule
    /// carries both regex lists, both must match; with only one list, that
    /// one decides.
    pub fn resolve(&self, peer_node_name: &str, local_if_name: &str) -> AreaMatch {
        let mut candidates: Vec<&str> = Vec::new();

        for rule in &self.rules {
            let matched = match (&rule.neighbor_regexes, &rule.interface_regexes) {
                (Some(nbr), Some(ifc)) => {
                    nbr.is_match(peer_node_name) && ifc.is_match(local_if_name)
                }
                (Some(nbr), None) => nbr.is_match(peer_node_name),
                (None, Some(ifc)) => ifc.is_match(local_if_name),
                (None, None) => false,
            };
            if matched {
                candidates.push(&rule.area_id);
            }
        }

        match candidates.len() {
            0 => AreaMatch::None,
            1 => AreaMatch::Unique(candidates[0].to_string()),
            _ => AreaMatch::Ambiguous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(area_id: &str, neighbors: &[&str], interfaces: &[&str]) -> AreaConfig {
        AreaConfig {
            area_id: area_id.to_string(),
            neighbor_regexes: neighbors.iter().map(|s| s.to_string()).collect(),
            interface_regexes: interfaces.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_no_rules_maps_everything_to_default() {
        let resolver = AreaResolver::from_config(&[]).unwrap();
        assert_eq!(
            resolver.resolve("any-node", "any-if"),
            AreaMatch::Unique(DEFAULT_AREA.to_string())
        );
    }

    #[test]
    fn test_unique_match_by_neighbor() {
        let resolver = AreaResolver::from_config(&[
            rule("pod-1", &["rsw.*"], &[]),
            rule("spine", &["ssw.*"], &[]),
        ])
        .unwrap();
        assert_eq!(
            resolver.resolve("rsw001", "eth0"),
            AreaMatch::Unique("pod-1".to_string())
        );
        assert_eq!(
            resolver.resolve("ssw042", "eth0"),
            AreaMatch::Unique("spine".to_string())
        );
    }

    #[test]
    fn test_both_lists_must_match() {
        let resolver =
            AreaResolver::from_config(&[rule("pod-1", &["rsw.*"], &["eth[0-3]"])]).unwrap();
        assert_eq!(
            resolver.resolve("rsw001", "eth2"),
            AreaMatch::Unique("pod-1".to_string())
        );
        assert_eq!(resolver.resolve("rsw001", "eth9"), AreaMatch::None);
        assert_eq!(resolver.resolve("fsw001", "eth2"), AreaMatch::None);
    }

    #[test]
    fn test_no_match_ignored() {
        let resolver = AreaResolver::from_config(&[rule("pod-1", &["rsw.*"], &[])]).unwrap();
        assert_eq!(resolver.resolve("ssw001", "eth0"), AreaMatch::None);
    }

    #[test]
    fn test_ambiguous_match_ignored() {
        let resolver = AreaResolver::from_config(&[
            rule("pod-1", &["rsw.*"], &[]),
            rule("pod-2", &[".*001"], &[]),
        ])
        .unwrap();
        assert_eq!(resolver.resolve("rsw001", "eth0"), AreaMatch::Ambiguous);
    }

    #[test]
    fn test_matching_is_case_insensitive_and_anchored() {
        let resolver = AreaResolver::from_config(&[rule("pod-1", &["RSW[0-9]+"], &[])]).unwrap();
        assert_eq!(
            resolver.resolve("rsw001", "eth0"),
            AreaMatch::Unique("pod-1".to_string())
        );
        // Substring matches are not full-string matches.
        assert_eq!(resolver.resolve("xrsw001x", "eth0"), AreaMatch::None);
    }

    #[test]
    fn test_interface_only_rule() {
        let resolver = AreaResolver::from_config(&[rule("mgmt", &[], &["mgmt.*"])]).unwrap();
        assert_eq!(
            resolver.resolve("whatever", "mgmt0"),
            AreaMatch::Unique("mgmt".to_string())
        );
    }
}
