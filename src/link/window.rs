//! Adaptive bound on the number of unacknowledged in-flight DATA entries.
//!
//! This is an AIMD-flavoured heuristic, not interoperable congestion control: its job is
//!  to bound the memory held in the retransmission table and to back off when the network
//!  (or the receiving process) is dropping a large share of what we send. The controller
//!  samples the ack / timeout counts over a fixed interval and adjusts multiplicatively
//!  in both directions based on the ack ratio.

use crate::config::BroadcastConfig;
use std::cmp::{max, min};
use tracing::debug;

#[derive(Debug)]
pub struct AimdWindow {
    window: u32,
    min_window: u32,
    max_window: u32,
    decrease_below: f64,
    increase_above: f64,

    acked: u64,
    timed_out: u64,
}

impl AimdWindow {
    pub fn new(config: &BroadcastConfig) -> AimdWindow {
        AimdWindow {
            window: config.initial_window,
            min_window: config.min_window,
            max_window: config.max_window,
            decrease_below: config.window_decrease_below,
            increase_above: config.window_increase_above,
            acked: 0,
            timed_out: 0,
        }
    }

    /// Current bound on in-flight DATA entries.
    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn on_acked(&mut self, num_entries: usize) {
        self.acked += num_entries as u64;
    }

    pub fn on_timed_out(&mut self, num_entries: usize) {
        self.timed_out += num_entries as u64;
    }

    /// Closes the current sample interval: computes `acked / (acked + timed out)`,
    ///  adjusts the window (halve below the lower threshold, double above the upper one,
    ///  otherwise unchanged), resets the counters and returns the new window.
    ///
    /// An interval without any ack or timeout events carries no signal and leaves the
    ///  window unchanged.
    pub fn sample(&mut self) -> u32 {
        let acked = self.acked;
        let timed_out = self.timed_out;
        self.acked = 0;
        self.timed_out = 0;

        let total = acked + timed_out;
        if total == 0 {
            return self.window;
        }

        let ratio = acked as f64 / total as f64;
        let before = self.window;

        if ratio < self.decrease_below {
            self.window = max(self.window / 2, self.min_window);
        }
        else if ratio > self.increase_above {
            self.window = min(self.window.saturating_mul(2), self.max_window);
        }

        if self.window != before {
            debug!("ack ratio {:.2} over sample interval - adjusting window {} -> {}", ratio, before, self.window);
        }
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use std::time::Duration;

    fn window_config(initial: u32, min: u32, max: u32) -> BroadcastConfig {
        BroadcastConfig {
            initial_window: initial,
            min_window: min,
            max_window: max,
            window_sample_interval: Duration::from_millis(500),
            ..BroadcastConfig::new()
        }
    }

    #[rstest]
    #[case::low_ratio_halves(64, 8, 1024, 2, 8, 32)]
    #[case::all_timeouts_halve(64, 8, 1024, 0, 5, 32)]
    #[case::halving_floors_at_min(10, 8, 1024, 0, 5, 8)]
    #[case::at_min_stays_at_min(8, 8, 1024, 0, 5, 8)]
    #[case::high_ratio_doubles(64, 8, 1024, 8, 1, 128)]
    #[case::all_acks_double(64, 8, 1024, 10, 0, 128)]
    #[case::doubling_caps_at_max(700, 8, 1024, 10, 0, 1024)]
    #[case::at_max_stays_at_max(1024, 8, 1024, 10, 0, 1024)]
    #[case::middle_ratio_unchanged(64, 8, 1024, 5, 5, 64)]
    #[case::exactly_lower_threshold_unchanged(64, 8, 1024, 3, 7, 64)]
    #[case::exactly_upper_threshold_unchanged(64, 8, 1024, 7, 3, 64)]
    #[case::no_events_unchanged(64, 8, 1024, 0, 0, 64)]
    fn test_sample(
        #[case] initial: u32,
        #[case] min: u32,
        #[case] max: u32,
        #[case] acked: usize,
        #[case] timed_out: usize,
        #[case] expected: u32,
    ) {
        let mut window = AimdWindow::new(&window_config(initial, min, max));
        window.on_acked(acked);
        window.on_timed_out(timed_out);

        assert_eq!(window.sample(), expected);
        assert_eq!(window.window(), expected);
    }

    #[test]
    fn test_counters_reset_between_samples() {
        let mut window = AimdWindow::new(&window_config(64, 8, 1024));

        window.on_timed_out(10);
        assert_eq!(window.sample(), 32);

        // previous interval's timeouts must not bleed into this one
        assert_eq!(window.sample(), 32);

        window.on_acked(10);
        assert_eq!(window.sample(), 64);
    }
}
