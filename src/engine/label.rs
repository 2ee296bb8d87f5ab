// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Segment-routing label allocation.
//!
//! Every adjacency gets a label from the reserved local range. The
//! preferred label for a neighbor is `base + ifIndex` so that labels stay
//! stable across restarts on boxes with stable interface indexes; on
//! conflict the allocator scans down from the top of the range.

use std::collections::HashSet;

/// First label of the reserved local range.
pub const SR_LOCAL_RANGE_MIN: u32 = 50_000;

/// Last label of the reserved local range.
pub const SR_LOCAL_RANGE_MAX: u32 = 59_999;

/// The local label space is exhausted. Fatal: the engine cannot track more
/// adjacencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelExhausted;

impl std::fmt::Display for LabelExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ran out of local segment-routing label space")
    }
}

impl std::error::Error for LabelExhausted {}

/// Tracks the labels of all currently-tracked neighbors.
#[derive(Debug, Default)]
pub struct LabelAllocator {
    allocated: HashSet<u32>,
}

impl LabelAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a label for an adjacency on the interface with `if_index`.
    pub fn allocate(&mut self, if_index: u32) -> Result<u32, LabelExhausted> {
        let preferred = SR_LOCAL_RANGE_MIN + if_index;
        if preferred <= SR_LOCAL_RANGE_MAX && self.allocated.insert(preferred) {
            return Ok(preferred);
        }

        // Preferred label taken (or ifIndex out of range): scan down from
        // the top of the range.
        let mut label = SR_LOCAL_RANGE_MAX;
        while !self.allocated.insert(label) {
            if label == SR_LOCAL_RANGE_MIN {
                return Err(LabelExhausted);
            }
            label -= 1;
        }
        Ok(label)
    }

    /// Return a label to the pool. Freeing an unallocated label is a no-op.
    pub fn free(&mut self, label: u32) {
        self.allocated.remove(&label);
    }

    pub fn contains(&self, label: u32) -> bool {
        self.allocated.contains(&label)
    }

    pub fn len(&self) -> usize {
        self.allocated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_base_plus_ifindex() {
        let mut alloc = LabelAllocator::new();
        assert_eq!(alloc.allocate(2), Ok(SR_LOCAL_RANGE_MIN + 2));
        assert_eq!(alloc.allocate(7), Ok(SR_LOCAL_RANGE_MIN + 7));
    }

    #[test]
    fn test_conflict_scans_down_from_top() {
        let mut alloc = LabelAllocator::new();
        assert_eq!(alloc.allocate(2), Ok(SR_LOCAL_RANGE_MIN + 2));
        // Same ifIndex again (second neighbor on the interface).
        assert_eq!(alloc.allocate(2), Ok(SR_LOCAL_RANGE_MAX));
        assert_eq!(alloc.allocate(2), Ok(SR_LOCAL_RANGE_MAX - 1));
    }

    #[test]
    fn test_free_makes_label_reusable() {
        let mut alloc = LabelAllocator::new();
        let label = alloc.allocate(3).unwrap();
        assert!(alloc.contains(label));
        alloc.free(label);
        assert!(!alloc.contains(label));
        assert_eq!(alloc.allocate(3), Ok(label));
    }

    #[test]
    fn test_out_of_range_ifindex_falls_back() {
        let mut alloc = LabelAllocator::new();
        let label = alloc.allocate(SR_LOCAL_RANGE_MAX - SR_LOCAL_RANGE_MIN + 100).unwrap();
        assert_eq!(label, SR_LOCAL_RANGE_MAX);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let mut alloc = LabelAllocator::new();
        for label in SR_LOCAL_RANGE_MIN..=SR_LOCAL_RANGE_MAX {
            alloc.allocated.insert(label);
        }
        assert_eq!(alloc.allocate(1), Err(LabelExhausted));
    }
}
