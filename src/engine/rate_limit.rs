// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Receive-path rate limiting.
//!
//! A fixed pool of bucketed one-second sliding-window counters protects the
//! engine from multicast storms. Each inbound packet hashes its
//! (interface, source address) pair onto one counter; once a counter
//! exceeds the per-second cap the packet is dropped before
//! deserialization. Distinct flows land on distinct counters with high
//! probability, so one noisy source cannot starve its neighbors on other
//! interfaces.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Number of independent time-series counters.
pub const NUM_TIME_SERIES: usize = 1024;

/// Maximum packets per second tolerated per (interface, source) slot.
pub const MAX_ALLOWED_PPS: u64 = 9600;

const WINDOW: Duration = Duration::from_secs(1);
const NUM_BUCKETS: usize = 8;
const BUCKET_WIDTH: Duration = Duration::from_millis(125);

/// A sliding one-second window of event counts, kept as a ring of
/// sub-buckets so old events age out in 125 ms steps.
struct BucketedSeries {
    buckets: [u64; NUM_BUCKETS],
    /// Global index of the bucket last written (elapsed / BUCKET_WIDTH).
    last_slot: u64,
}

impl BucketedSeries {
    fn new() -> Self {
        Self {
            buckets: [0; NUM_BUCKETS],
            last_slot: 0,
        }
    }

    /// Age out buckets the window has slid past.
    fn advance(&mut self, slot: u64) {
        if slot <= self.last_slot {
            return;
        }
        let stale = (slot - self.last_slot).min(NUM_BUCKETS as u64);
        for i in 1..=stale {
            self.buckets[((self.last_slot + i) % NUM_BUCKETS as u64) as usize] = 0;
        }
        self.last_slot = slot;
    }

    fn count(&self) -> u64 {
        self.buckets.iter().sum()
    }

    fn add(&mut self, slot: u64) {
        self.buckets[(slot % NUM_BUCKETS as u64) as usize] += 1;
    }
}

/// Pool of [`NUM_TIME_SERIES`] windowed counters keyed by hash of
/// (interface, source address).
pub struct PacketRateLimiter {
    series: Vec<BucketedSeries>,
    max_pps: u64,
    epoch: Instant,
}

impl PacketRateLimiter {
    pub fn new() -> Self {
        Self::with_limit(MAX_ALLOWED_PPS)
    }

    pub fn with_limit(max_pps: u64) -> Self {
        Self {
            series: (0..NUM_TIME_SERIES).map(|_| BucketedSeries::new()).collect(),
            max_pps,
            epoch: Instant::now(),
        }
    }

    fn slot_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.epoch);
        (elapsed.as_millis() / BUCKET_WIDTH.as_millis()) as u64
    }

    /// Account one packet from (if_name, source) at `now`. Returns whether
    /// the packet may be processed; `false` means the slot is over its cap
    /// and the packet must be dropped.
    pub fn allow(&mut self, if_name: &str, source: IpAddr, now: Instant) -> bool {
        let mut hasher = DefaultHasher::new();
        if_name.hash(&mut hasher);
        source.hash(&mut hasher);
        let index = (hasher.finish() % NUM_TIME_SERIES as u64) as usize;

        let slot = self.slot_at(now);
        let series = &mut self.series[index];
        series.advance(slot);

        if series.count() > self.max_pps {
            return false;
        }
        series.add(slot);
        true
    }

    /// Length of the sliding window. Exposed so tests can step past it.
    pub fn window(&self) -> Duration {
        WINDOW
    }
}

impl Default for PacketRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(last: u8) -> IpAddr {
        IpAddr::V6(format!("fe80::{:x}", last).parse().unwrap())
    }

    #[test]
    fn test_allows_under_cap() {
        let mut limiter = PacketRateLimiter::with_limit(100);
        let now = Instant::now();
        for _ in 0..100 {
            assert!(limiter.allow("eth0", src(1), now));
        }
    }

    #[test]
    fn test_drops_over_cap() {
        let mut limiter = PacketRateLimiter::with_limit(10);
        let now = Instant::now();
        let mut allowed = 0;
        for _ in 0..50 {
            if limiter.allow("eth0", src(1), now) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 11);
    }

    #[test]
    fn test_distinct_flows_do_not_interfere() {
        let mut limiter = PacketRateLimiter::with_limit(10);
        let now = Instant::now();
        while limiter.allow("eth0", src(1), now) {}
        // Other flows hash to other slots (modulo unlucky collisions, so
        // accept any of several candidates passing).
        let passed = (2..8).any(|i| limiter.allow("eth7", src(i), now));
        assert!(passed);
    }

    #[test]
    fn test_window_slides() {
        let mut limiter = PacketRateLimiter::with_limit(10);
        let now = Instant::now();
        while limiter.allow("eth0", src(1), now) {}
        assert!(!limiter.allow("eth0", src(1), now));

        // A full window later the counts have aged out.
        let later = now + limiter.window() + Duration::from_millis(200);
        assert!(limiter.allow("eth0", src(1), later));
    }

    #[test]
    fn test_partial_aging() {
        let mut limiter = PacketRateLimiter::with_limit(10);
        let now = Instant::now();
        while limiter.allow("eth0", src(1), now) {}

        // Half a window is not enough for the whole burst to age out.
        let later = now + Duration::from_millis(500);
        assert!(!limiter.allow("eth0", src(1), later));
    }
}
