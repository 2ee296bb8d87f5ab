// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Round-trip time estimation from reflected timestamps.
//!
//! Each peer echoes the send/receive timestamps of the last hello it saw
//! from us; combined with our own clock this yields an RTT without any
//! clock synchronization:
//!
//! ```text
//! rtt = (my_recv - my_sent) - (nbr_sent - nbr_recv)
//! ```
//!
//! Raw samples are noisy (userspace scheduling, clock adjustments), so each
//! neighbor owns a [`StepDetector`] that separates sustained level shifts
//! from jitter before an RTT change is reported downstream.

use std::collections::VecDeque;

/// Samples in the fast sliding window.
const FAST_WINDOW_SIZE: usize = 10;

/// Samples in the slow sliding window.
const SLOW_WINDOW_SIZE: usize = 60;

/// Lower divergence threshold, percent. Below this the level is stable.
const LO_THRESHOLD_PCT: i64 = 2;

/// Upper divergence threshold, percent. At or above this a step is reported.
const HI_THRESHOLD_PCT: i64 = 5;

/// Absolute divergence floor in microseconds; percent thresholds alone
/// would fire on sub-millisecond noise for very small RTTs.
const ABS_THRESHOLD_US: i64 = 500;

/// Compute one RTT sample in microseconds from the four timestamps, or
/// `None` when the sample must be rejected.
///
/// Rejections: a zero `my_sent`/`nbr_recv` (peer has not reflected us yet),
/// reversed orderings on either clock, and negative results (clock jumps;
/// the next sample self-corrects). Accepted samples are truncated to
/// millisecond granularity with a 1 ms floor, since microsecond accuracy is
/// meaningless for a userspace measurement.
pub fn compute_rtt(
    my_sent_us: u64,
    nbr_recv_us: u64,
    nbr_sent_us: u64,
    my_recv_us: u64,
) -> Option<i64> {
    if my_sent_us == 0 || nbr_recv_us == 0 {
        return None;
    }
    if nbr_sent_us < nbr_recv_us || my_recv_us < my_sent_us {
        return None;
    }

    let rtt = (my_recv_us - my_sent_us) as i64 - (nbr_sent_us - nbr_recv_us) as i64;
    if rtt < 0 {
        return None;
    }

    Some((rtt / 1000 * 1000).max(1000))
}

/// Detects sustained level changes in a stream of RTT samples by comparing
/// the means of a fast and a slow sliding window.
///
/// Feeding a steady stream of equal values never reports a step: both
/// windows restart at the new level once a step is reported, making
/// detection edge-triggered.
#[derive(Debug)]
pub struct StepDetector {
    fast: VecDeque<i64>,
    slow: VecDeque<i64>,
}

impl StepDetector {
    pub fn new() -> Self {
        Self {
            fast: VecDeque::with_capacity(FAST_WINDOW_SIZE),
            slow: VecDeque::with_capacity(SLOW_WINDOW_SIZE),
        }
    }

    fn mean(window: &VecDeque<i64>) -> i64 {
        if window.is_empty() {
            return 0;
        }
        window.iter().sum::<i64>() / window.len() as i64
    }

    /// Feed one RTT sample (microseconds). Returns the new RTT level when a
    /// sustained change is detected, `None` otherwise.
    pub fn add_value(&mut self, rtt_us: i64) -> Option<i64> {
        if self.fast.len() == FAST_WINDOW_SIZE {
            self.fast.pop_front();
        }
        self.fast.push_back(rtt_us);

        if self.slow.len() == SLOW_WINDOW_SIZE {
            self.slow.pop_front();
        }
        self.slow.push_back(rtt_us);

        // Hold off until the fast window carries enough signal.
        if self.fast.len() < FAST_WINDOW_SIZE {
            return None;
        }

        let fast_mean = Self::mean(&self.fast);
        let slow_mean = Self::mean(&self.slow);
        let diff = (fast_mean - slow_mean).abs();

        if diff < ABS_THRESHOLD_US {
            return None;
        }

        let pct = if slow_mean != 0 {
            diff * 100 / slow_mean.abs()
        } else {
            100
        };

        // Between the two thresholds the signal is ambiguous; only a
        // divergence clearing the high mark is a step.
        if pct <= LO_THRESHOLD_PCT || pct < HI_THRESHOLD_PCT {
            return None;
        }

        // Restart both windows at the new level so detection is
        // edge-triggered: samples straddling the step must not count
        // against the post-step baseline.
        let level = fast_mean;
        self.fast.clear();
        self.slow.clear();
        self.fast.push_back(rtt_us);
        self.slow.push_back(rtt_us);

        Some(level)
    }
}

impl Default for StepDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_basic_computation() {
        // 300us on the wire each way, 100us of peer turnaround.
        let rtt = compute_rtt(1_000_000, 1_000_300, 1_000_400, 1_001_000).unwrap();
        // (1000 - 100) = 900us, floored to 1ms.
        assert_eq!(rtt, 1000);
    }

    #[test]
    fn test_rtt_millisecond_truncation() {
        // 10.7ms total, 1.2ms turnaround: raw 9.5ms, truncated to 9ms.
        let rtt = compute_rtt(1_000, 5_000, 6_200, 11_700).unwrap();
        assert_eq!(rtt, 9_000);
    }

    #[test]
    fn test_rtt_rejects_missing_timestamps() {
        assert_eq!(compute_rtt(0, 100, 200, 300), None);
        assert_eq!(compute_rtt(100, 0, 200, 300), None);
    }

    #[test]
    fn test_rtt_rejects_time_anomalies() {
        // Peer claims it sent before it received.
        assert_eq!(compute_rtt(100, 500, 400, 900), None);
        // We received before we sent.
        assert_eq!(compute_rtt(900, 950, 960, 100), None);
        // Peer turnaround longer than our round trip.
        assert_eq!(compute_rtt(100, 200, 5_000, 600), None);
    }

    #[test]
    fn test_rtt_floors_at_one_millisecond() {
        let rtt = compute_rtt(100, 150, 160, 300).unwrap();
        assert_eq!(rtt, 1000);
    }

    #[test]
    fn test_step_detector_steady_state_is_quiet() {
        let mut detector = StepDetector::new();
        for _ in 0..200 {
            assert_eq!(detector.add_value(20_000), None);
        }
    }

    #[test]
    fn test_step_detector_reports_sustained_shift() {
        let mut detector = StepDetector::new();
        for _ in 0..SLOW_WINDOW_SIZE {
            assert_eq!(detector.add_value(20_000), None);
        }
        // Level shifts from 20ms to 40ms; once the fast window fills with
        // the new level the divergence clears both thresholds.
        let mut reported = None;
        for _ in 0..FAST_WINDOW_SIZE {
            if let Some(level) = detector.add_value(40_000) {
                reported = Some(level);
                break;
            }
        }
        let level = reported.expect("step not detected");
        assert!(level > 20_000, "reported level {} not above old", level);

        // Edge-triggered: staying at the new level is quiet again.
        for _ in 0..100 {
            assert_eq!(detector.add_value(40_000), None);
        }
    }

    #[test]
    fn test_step_detector_ignores_small_drift() {
        let mut detector = StepDetector::new();
        for _ in 0..SLOW_WINDOW_SIZE {
            detector.add_value(100_000);
        }
        // 1% drift stays under both the percent and the useful range of
        // the absolute threshold criteria.
        for _ in 0..100 {
            assert_eq!(detector.add_value(101_000), None);
        }
    }

    #[test]
    fn test_step_detector_absolute_floor() {
        let mut detector = StepDetector::new();
        // Tiny RTTs: a 25% jump that stays under 500us absolute is noise.
        for _ in 0..SLOW_WINDOW_SIZE {
            detector.add_value(1_000);
        }
        for _ in 0..100 {
            assert_eq!(detector.add_value(1_250), None);
        }
    }
}
