// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The fixed-length configuration frame an initiator places at the
//! front of its handshake-syn data, instructing the responder how to
//! configure its side of the stream.

use static_assertions::const_assert_eq;
use std::time::Duration;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::big_endian::U16 as u16_be;
use zerocopy::big_endian::U32 as u32_be;

/// Size of the serialised [`InitiatorConfig`] frame.
pub const INITIATOR_CONFIG_LEN: usize = size_of::<InitiatorConfigWire>();
const_assert_eq!(INITIATOR_CONFIG_LEN, 28);

/// Wire layout of [`InitiatorConfig`]; durations in whole milliseconds.
#[repr(C)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
struct InitiatorConfigWire {
    set_config: u8,
    debug: u8,
    max_segment_len_excl_header: u16_be,
    sliding_window_wait_ms: u32_be,
    retransmission_interval_ms: u32_be,
    ack_delay_ms: u32_be,
    read_timeout_ms: u32_be,
    write_timeout_ms: u32_be,
    keep_alive_interval_ms: u32_be,
}

/// Stream parameters carried from initiator to responder inside the
/// first handshake segment.
///
/// A zero-valued field asks the responder to keep its own default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InitiatorConfig {
    /// Apply these parameters on the responder side.
    pub set_config: bool,
    /// Enable verbose per-stream logging on the responder side.
    pub debug: bool,
    /// Maximum data bytes per emitted segment, excluding the header.
    pub max_segment_len_excl_header: u16,
    /// Pause between decisions while the sliding window is saturated.
    pub sliding_window_wait: Duration,
    /// Silence after which unacknowledged output is retransmitted.
    pub retransmission_interval: Duration,
    /// Grace period before a received-data-only stream emits a bare
    /// acknowledgement.
    pub ack_delay: Duration,
    /// Deadline observed by blocked stream reads.
    pub read_timeout: Duration,
    /// Deadline observed by blocked stream writes.
    pub write_timeout: Duration,
    /// Idle interval after which a keep-alive segment is emitted.
    pub keep_alive_interval: Duration,
}

fn ms(d: Duration) -> u32_be {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX).into()
}

fn dur(ms: u32_be) -> Duration {
    Duration::from_millis(ms.get().into())
}

impl InitiatorConfig {
    /// Serialises the frame (big-endian, millisecond durations).
    pub fn to_bytes(&self) -> [u8; INITIATOR_CONFIG_LEN] {
        let wire = InitiatorConfigWire {
            set_config: self.set_config.into(),
            debug: self.debug.into(),
            max_segment_len_excl_header: self.max_segment_len_excl_header.into(),
            sliding_window_wait_ms: ms(self.sliding_window_wait),
            retransmission_interval_ms: ms(self.retransmission_interval),
            ack_delay_ms: ms(self.ack_delay),
            read_timeout_ms: ms(self.read_timeout),
            write_timeout_ms: ms(self.write_timeout),
            keep_alive_interval_ms: ms(self.keep_alive_interval),
        };
        let mut bytes = [0; INITIATOR_CONFIG_LEN];
        bytes.copy_from_slice(wire.as_bytes());
        bytes
    }

    /// Deserialises a frame from the first [`INITIATOR_CONFIG_LEN`]
    /// bytes of `data`, or `None` when `data` is too short.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let (wire, _) = InitiatorConfigWire::read_from_prefix(data).ok()?;
        Some(Self {
            set_config: wire.set_config != 0,
            debug: wire.debug != 0,
            max_segment_len_excl_header: wire.max_segment_len_excl_header.get(),
            sliding_window_wait: dur(wire.sliding_window_wait_ms),
            retransmission_interval: dur(wire.retransmission_interval_ms),
            ack_delay: dur(wire.ack_delay_ms),
            read_timeout: dur(wire.read_timeout_ms),
            write_timeout: dur(wire.write_timeout_ms),
            keep_alive_interval: dur(wire.keep_alive_interval_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let config = InitiatorConfig {
            set_config: true,
            debug: false,
            max_segment_len_excl_header: 150,
            sliding_window_wait: Duration::from_millis(3000),
            retransmission_interval: Duration::from_millis(12_000),
            ack_delay: Duration::from_millis(500),
            read_timeout: Duration::from_secs(25),
            write_timeout: Duration::from_secs(25),
            keep_alive_interval: Duration::from_millis(8250),
        };
        let bytes = config.to_bytes();
        assert_eq!(InitiatorConfig::from_bytes(&bytes), Some(config));
    }

    #[test]
    fn wire_layout() {
        let config = InitiatorConfig {
            set_config: true,
            debug: true,
            max_segment_len_excl_header: 0x0102,
            sliding_window_wait: Duration::from_millis(0x0304_0506),
            ..InitiatorConfig::default()
        };
        let bytes = config.to_bytes();
        assert_eq!(&bytes[..8], &[1, 1, 1, 2, 3, 4, 5, 6]);
        assert_eq!(&bytes[8..], &[0; 20]);
    }

    #[test]
    fn short_input_is_rejected() {
        assert_eq!(
            InitiatorConfig::from_bytes(&[0; INITIATOR_CONFIG_LEN - 1]),
            None
        );
    }

    #[test]
    fn extra_input_is_ignored() {
        let mut data = InitiatorConfig::default().to_bytes().to_vec();
        data.extend_from_slice(b"payload");
        assert_eq!(
            InitiatorConfig::from_bytes(&data),
            Some(InitiatorConfig::default())
        );
    }
}
