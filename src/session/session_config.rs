use std::time::Duration;

use anyhow::bail;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// interval of the heartbeat timer. All silence thresholds are counted in ticks of this
    ///  interval.
    pub tick_interval: Duration,

    /// consecutive silent ticks after which a running session goes to sleep
    pub idle_ticks_before_sleep: u32,
    /// silent ticks in sleeping state (counted from when the session fell asleep) before the
    ///  session is terminated
    pub sleep_timeout_ticks: u32,
    /// ticks after a disconnect during which a reconnect handoff is accepted
    pub disconnected_timeout_ticks: u32,

    /// number of slots in the replay cache, i.e. the window of requests for which a retransmitted
    ///  request is answered without re-executing it
    pub replay_cache_size: usize,

    /// maximum payload length of a single frame in both directions (the 'server quantum')
    pub max_payload_len: usize,

    /// A frame (reply, keepalive, attention or handoff ack) that cannot be written within this
    ///  time is treated as a dead connection. The heartbeat never waits longer than this on a
    ///  peer that stopped reading.
    pub keepalive_send_timeout: Duration,

    /// attentions sent to the peer without having been acknowledged. Further notifications stay
    ///  pending until the peer catches up.
    pub max_outstanding_attentions: u32,

    pub control_channel_capacity: usize,
}

impl SessionConfig {
    pub fn new() -> SessionConfig {
        SessionConfig {
            tick_interval: Duration::from_secs(30),
            idle_ticks_before_sleep: 4,
            sleep_timeout_ticks: 1200,         // 10 hours
            disconnected_timeout_ticks: 2880,  // 24 hours
            replay_cache_size: 128,
            max_payload_len: 1024 * 1024,
            keepalive_send_timeout: Duration::from_secs(5),
            max_outstanding_attentions: 10,
            control_channel_capacity: 16,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval.is_zero() {
            bail!("tick interval must not be zero");
        }
        if self.idle_ticks_before_sleep == 0 || self.sleep_timeout_ticks == 0 || self.disconnected_timeout_ticks == 0 {
            bail!("silence thresholds must be at least one tick");
        }
        if self.replay_cache_size == 0 {
            bail!("replay cache needs at least one slot");
        }
        if self.max_payload_len > u32::MAX as usize {
            bail!("maximum payload length {} does not fit the frame header", self.max_payload_len);
        }
        if self.keepalive_send_timeout > self.tick_interval {
            bail!("keepalive send timeout {:?} exceeds the tick interval {:?}", self.keepalive_send_timeout, self.tick_interval);
        }
        if self.control_channel_capacity == 0 {
            bail!("control channel capacity must not be zero");
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        SessionConfig::new().validate().unwrap();
    }

    #[rstest]
    #[case::zero_tick(|c: &mut SessionConfig| c.tick_interval = Duration::ZERO)]
    #[case::zero_idle(|c: &mut SessionConfig| c.idle_ticks_before_sleep = 0)]
    #[case::zero_sleep(|c: &mut SessionConfig| c.sleep_timeout_ticks = 0)]
    #[case::zero_disconnected(|c: &mut SessionConfig| c.disconnected_timeout_ticks = 0)]
    #[case::zero_cache(|c: &mut SessionConfig| c.replay_cache_size = 0)]
    #[case::slow_keepalive(|c: &mut SessionConfig| c.keepalive_send_timeout = Duration::from_secs(31))]
    #[case::zero_channel(|c: &mut SessionConfig| c.control_channel_capacity = 0)]
    #[case::huge_payload(|c: &mut SessionConfig| c.max_payload_len = usize::MAX)]
    fn test_validate(#[case] modify: fn(&mut SessionConfig)) {
        let mut config = SessionConfig::new();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
