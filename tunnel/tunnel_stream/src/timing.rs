// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Stream timing parameters and their runtime adaptation.
//!
//! Each transmission control keeps two records: the fixed initial
//! timing it was configured with, and the live timing the input worker
//! adapts to the observed traffic. An idle peer (keep-alives) doubles
//! the live intervals up to eight times the initial values; arriving
//! data halves them back down, floored at the initial values. Read and
//! write deadlines never adapt.

use std::time::Duration;
use tunnel_protocol::InitiatorConfig;

/// Factor bounding how far live intervals may stretch above their
/// initial values.
const MAX_SLACK: u32 = 8;

/// Timing parameters of one transmission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTiming {
    /// Pause between output decisions while the sliding window is
    /// saturated, and after a retransmission burst.
    pub sliding_window_wait: Duration,
    /// Silence after which unacknowledged output is retransmitted.
    pub retransmission_interval: Duration,
    /// Grace period before received data is acknowledged with a bare
    /// ack segment.
    pub ack_delay: Duration,
    /// Deadline observed by a blocked [`read`](crate::TransmissionControl::read).
    pub read_timeout: Duration,
    /// Deadline observed by a blocked [`write`](crate::TransmissionControl::write).
    pub write_timeout: Duration,
    /// Idle time after which a keep-alive segment is emitted.
    pub keep_alive_interval: Duration,
    /// Maximum gap between a segment header and its data on the input
    /// transport.
    pub segment_data_timeout: Duration,
}

impl Default for StreamTiming {
    fn default() -> Self {
        Self {
            sliding_window_wait: Duration::from_secs(3),
            retransmission_interval: Duration::from_secs(12),
            ack_delay: Duration::from_millis(500),
            read_timeout: Duration::from_secs(25),
            write_timeout: Duration::from_secs(25),
            keep_alive_interval: Duration::from_secs(8),
            segment_data_timeout: Duration::from_secs(5),
        }
    }
}

impl StreamTiming {
    /// Replaces zero durations with their defaults, so callers can
    /// construct a partial record and leave the rest alone.
    pub fn or_default(mut self) -> Self {
        let defaults = Self::default();
        for (value, default) in [
            (&mut self.sliding_window_wait, defaults.sliding_window_wait),
            (
                &mut self.retransmission_interval,
                defaults.retransmission_interval,
            ),
            (&mut self.ack_delay, defaults.ack_delay),
            (&mut self.read_timeout, defaults.read_timeout),
            (&mut self.write_timeout, defaults.write_timeout),
            (&mut self.keep_alive_interval, defaults.keep_alive_interval),
            (&mut self.segment_data_timeout, defaults.segment_data_timeout),
        ] {
            if value.is_zero() {
                *value = default;
            }
        }
        self
    }

    /// Overrides fields with the non-zero values a peer supplied in its
    /// handshake configuration.
    pub fn merge_config(mut self, config: &InitiatorConfig) -> Self {
        for (value, supplied) in [
            (&mut self.sliding_window_wait, config.sliding_window_wait),
            (
                &mut self.retransmission_interval,
                config.retransmission_interval,
            ),
            (&mut self.ack_delay, config.ack_delay),
            (&mut self.read_timeout, config.read_timeout),
            (&mut self.write_timeout, config.write_timeout),
            (&mut self.keep_alive_interval, config.keep_alive_interval),
        ] {
            if !supplied.is_zero() {
                *value = supplied;
            }
        }
        self
    }
}

/// The fixed initial timing paired with the currently-active adaptive
/// copy.
#[derive(Debug, Clone)]
pub struct LiveTiming {
    initial: StreamTiming,
    live: StreamTiming,
}

impl LiveTiming {
    /// Starts with `initial` as both records.
    pub fn new(initial: StreamTiming) -> Self {
        Self {
            initial,
            live: initial,
        }
    }

    /// The currently-active timing.
    pub fn live(&self) -> &StreamTiming {
        &self.live
    }

    /// The fixed timing the stream was configured with.
    pub fn initial(&self) -> &StreamTiming {
        &self.initial
    }

    /// Doubles the adaptive intervals, capped at [`MAX_SLACK`] times
    /// their initial values.
    pub fn increase(&mut self) {
        for (live, initial) in self.adaptive() {
            *live = (*live * 2).min(initial * MAX_SLACK);
        }
    }

    /// Halves the adaptive intervals, floored at their initial values.
    pub fn decrease(&mut self) {
        for (live, initial) in self.adaptive() {
            *live = (*live / 2).max(initial);
        }
    }

    fn adaptive(&mut self) -> [(&mut Duration, Duration); 4] {
        [
            (
                &mut self.live.sliding_window_wait,
                self.initial.sliding_window_wait,
            ),
            (
                &mut self.live.retransmission_interval,
                self.initial.retransmission_interval,
            ),
            (&mut self.live.ack_delay, self.initial.ack_delay),
            (
                &mut self.live.keep_alive_interval,
                self.initial.keep_alive_interval,
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_fields_take_defaults() {
        let timing = StreamTiming {
            ack_delay: Duration::from_millis(50),
            read_timeout: Duration::ZERO,
            ..StreamTiming::default()
        }
        .or_default();
        assert_eq!(timing.ack_delay, Duration::from_millis(50));
        assert_eq!(timing.read_timeout, StreamTiming::default().read_timeout);
    }

    #[test]
    fn increase_is_capped_and_decrease_is_floored() {
        let initial = StreamTiming {
            keep_alive_interval: Duration::from_secs(1),
            ..StreamTiming::default()
        };
        let mut timing = LiveTiming::new(initial);
        for _ in 0..10 {
            timing.increase();
        }
        assert_eq!(
            timing.live().keep_alive_interval,
            Duration::from_secs(u64::from(MAX_SLACK))
        );
        for _ in 0..10 {
            timing.decrease();
        }
        assert_eq!(timing.live().keep_alive_interval, Duration::from_secs(1));
    }

    #[test]
    fn config_overrides_only_supplied_fields() {
        let config = InitiatorConfig {
            ack_delay: Duration::from_millis(125),
            ..InitiatorConfig::default()
        };
        let timing = StreamTiming::default().merge_config(&config);
        assert_eq!(timing.ack_delay, Duration::from_millis(125));
        assert_eq!(
            timing.keep_alive_interval,
            StreamTiming::default().keep_alive_interval
        );
    }

    #[test]
    fn read_write_timeouts_do_not_adapt() {
        let mut timing = LiveTiming::new(StreamTiming::default());
        timing.increase();
        assert_eq!(
            timing.live().read_timeout,
            StreamTiming::default().read_timeout
        );
        assert_eq!(
            timing.live().write_timeout,
            StreamTiming::default().write_timeout
        );
    }
}
