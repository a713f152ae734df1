//! Stall detection over a trailing window of CPU samples.
//!
//! A unit is judged stalled only when every sample inside a fully-populated
//! `stall_timeout`-wide trailing window is at or below the CPU threshold. A
//! single low reading amid otherwise-active samples never triggers, and no
//! verdict is produced before the window has filled.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::prelude::*;

pub struct StallDetector {
    window: VecDeque<(Instant, f64)>,
    stall_timeout: Duration,
    cpu_threshold_percent: f64,
}

impl StallDetector {
    pub fn new(stall_timeout: Duration, cpu_threshold_percent: f64) -> Self {
        Self {
            window: VecDeque::new(),
            stall_timeout,
            cpu_threshold_percent,
        }
    }

    /// Feeds one aggregate CPU sample. Returns true once a stall is
    /// confirmed.
    pub fn observe(&mut self, now: Instant, cpu_total: f64) -> bool {
        self.window.push_back((now, cpu_total));

        let Some(cutoff) = now.checked_sub(self.stall_timeout) else {
            // The process hasn't even been up for a full window.
            return false;
        };

        // Evict samples that fell out of the trailing window, keeping the
        // newest at-or-before-cutoff sample so the window stays contiguous
        // and still spans the full width.
        while self.window.len() >= 2 && self.window[1].0 <= cutoff {
            self.window.pop_front();
        }

        let Some(&(oldest, _)) = self.window.front() else {
            return false;
        };
        if oldest > cutoff {
            // Window not fully populated yet: no premature judgement.
            return false;
        }

        // Inclusive: a sample sitting exactly at the threshold is inactive.
        let stalled = self
            .window
            .iter()
            .all(|&(_, cpu)| cpu <= self.cpu_threshold_percent);
        if stalled {
            debug!(
                "stall confirmed: {} samples at or below {}% over {:?}",
                self.window.len(),
                self.cpu_threshold_percent,
                self.stall_timeout
            );
        }
        stalled
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(timeout_ms: u64, threshold: f64) -> StallDetector {
        StallDetector::new(Duration::from_millis(timeout_ms), threshold)
    }

    /// A base instant far enough in the past that `checked_sub` never
    /// underflows in tests.
    fn base() -> Instant {
        Instant::now()
    }

    #[test]
    fn no_verdict_before_window_is_populated() {
        let mut detector = detector(500, 10.0);
        let t0 = base();
        assert!(!detector.observe(t0, 0.0));
        assert!(!detector.observe(t0 + Duration::from_millis(100), 0.0));
        assert!(!detector.observe(t0 + Duration::from_millis(400), 0.0));
    }

    #[test]
    fn sustained_low_cpu_over_full_window_is_a_stall() {
        let mut detector = detector(500, 10.0);
        let t0 = base();
        let mut stalled = false;
        for step in 0..=6 {
            stalled = detector.observe(t0 + Duration::from_millis(step * 100), 0.5);
        }
        assert!(stalled);
    }

    #[test]
    fn single_low_sample_amid_activity_never_triggers() {
        let mut detector = detector(500, 10.0);
        let t0 = base();
        for (step, cpu) in [50.0, 60.0, 0.1, 55.0, 70.0, 45.0, 80.0].iter().enumerate() {
            assert!(!detector.observe(t0 + Duration::from_millis(step as u64 * 100), *cpu));
        }
    }

    #[test]
    fn recovers_once_active_samples_enter_the_window() {
        let mut detector = detector(300, 10.0);
        let t0 = base();
        for step in 0..=4 {
            detector.observe(t0 + Duration::from_millis(step * 100), 0.0);
        }
        // Activity resumes: the window still contains low samples but the
        // new one is above threshold.
        assert!(!detector.observe(t0 + Duration::from_millis(500), 90.0));
        // Once the active sample ages out and only low samples span the
        // window again, the stall re-confirms.
        for step in 6..=10 {
            let _ = detector.observe(t0 + Duration::from_millis(step * 100), 0.0);
        }
        assert!(detector.observe(t0 + Duration::from_millis(1100), 0.0));
    }

    #[test]
    fn samples_at_the_threshold_count_as_inactive() {
        let mut detector = detector(300, 10.0);
        let t0 = base();
        let mut stalled = false;
        for step in 0..=5 {
            stalled = detector.observe(t0 + Duration::from_millis(step * 100), 10.0);
        }
        assert!(stalled);
    }

    #[test]
    fn samples_just_above_the_threshold_count_as_active() {
        let mut detector = detector(300, 10.0);
        let t0 = base();
        for step in 0..=5 {
            assert!(!detector.observe(t0 + Duration::from_millis(step * 100), 10.1));
        }
    }

    #[test]
    fn reset_discards_the_window() {
        let mut detector = detector(200, 10.0);
        let t0 = base();
        for step in 0..=3 {
            detector.observe(t0 + Duration::from_millis(step * 100), 0.0);
        }
        detector.reset();
        assert!(!detector.observe(t0 + Duration::from_millis(400), 0.0));
    }
}
