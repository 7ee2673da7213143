use anyhow::bail;
use std::time::Duration;

/// Tuning knobs for the perfect link and the broadcast layer on top of it.
///
/// The defaults are sized for a small group of processes on a LAN or on localhost, which
///  is the environment this stack is benchmarked in. All of them can be overridden before
///  the link is created; the config is immutable afterwards.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// A sent datagram that is not link-acked within this duration is re-sent, repeatedly
    ///  and indefinitely - there is no permanent-failure detection, destinations are
    ///  assumed to become reachable eventually.
    pub retransmit_timeout: Duration,

    /// Granularity at which the retransmission table is scanned for timed-out entries.
    ///  Should be noticeably smaller than `retransmit_timeout`.
    pub retransmit_tick: Duration,

    /// Maximum number of `(creator, seq)` entries batched into one DATA datagram for the
    ///  same destination, amortizing per-datagram overhead.
    pub max_entries_per_packet: usize,

    /// Capacity of the outgoing queue. When it is full, `send` blocks the caller until
    ///  the drain worker catches up - messages are never dropped on the sending side.
    pub send_queue_capacity: usize,

    /// Window size (in unacked in-flight DATA entries) that the link starts out with.
    pub initial_window: u32,
    /// Lower bound for the adaptive window - halving floors here.
    pub min_window: u32,
    /// Upper bound for the adaptive window - doubling caps here.
    pub max_window: u32,

    /// Interval over which ack / timeout counts are sampled for window adaptation.
    pub window_sample_interval: Duration,
    /// An ack ratio below this halves the window.
    pub window_decrease_below: f64,
    /// An ack ratio above this doubles the window.
    pub window_increase_above: f64,
}

impl BroadcastConfig {
    pub fn new() -> BroadcastConfig {
        BroadcastConfig {
            retransmit_timeout: Duration::from_millis(100),
            retransmit_tick: Duration::from_millis(50),
            max_entries_per_packet: 8,
            send_queue_capacity: 1024,
            initial_window: 64,
            min_window: 8,
            max_window: 32 * 1024,
            window_sample_interval: Duration::from_millis(500),
            window_decrease_below: 0.3,
            window_increase_above: 0.7,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_entries_per_packet == 0 {
            bail!("max_entries_per_packet must be at least 1");
        }
        if self.send_queue_capacity == 0 {
            bail!("send_queue_capacity must be at least 1");
        }
        if self.min_window == 0 {
            bail!("min_window must be at least 1");
        }
        if self.min_window > self.initial_window || self.initial_window > self.max_window {
            bail!("window bounds must satisfy min <= initial <= max");
        }
        if self.retransmit_tick > self.retransmit_timeout {
            bail!("retransmit_tick must not exceed retransmit_timeout");
        }
        if !(0.0 < self.window_decrease_below && self.window_decrease_below < 1.0)
            || !(0.0 < self.window_increase_above && self.window_increase_above < 1.0)
        {
            bail!("window thresholds must be strictly between 0 and 1");
        }
        if self.window_decrease_below >= self.window_increase_above {
            bail!("window_decrease_below must be below window_increase_above");
        }
        Ok(())
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        BroadcastConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(BroadcastConfig::new().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BroadcastConfig::new();
        config.max_entries_per_packet = 0;
        assert!(config.validate().is_err());

        let mut config = BroadcastConfig::new();
        config.min_window = config.max_window + 1;
        assert!(config.validate().is_err());

        let mut config = BroadcastConfig::new();
        config.initial_window = config.max_window + 1;
        assert!(config.validate().is_err());

        let mut config = BroadcastConfig::new();
        config.retransmit_tick = config.retransmit_timeout * 2;
        assert!(config.validate().is_err());

        let mut config = BroadcastConfig::new();
        config.window_decrease_below = 0.8;
        config.window_increase_above = 0.7;
        assert!(config.validate().is_err());

        let mut config = BroadcastConfig::new();
        config.window_increase_above = 1.5;
        assert!(config.validate().is_err());
    }
}
