// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The segment frame: the atomic unit moved between two transmission
//! controls.
//!
//! Wire layout (big-endian):
//! `[ID u16][Flags u16][SeqNum u32][AckNum u32][Reserved u16][Length u16][Data]`.
//!
//! Decoding never fails at the call site: every malformed input yields a
//! sentinel segment with the [`SegmentFlags::malformed`] bit set and a
//! human-readable reason in its data, so receive pipelines can log and
//! move on without an error taxonomy of their own.

use crate::config::INITIATOR_CONFIG_LEN;
use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::big_endian::U16 as u16_be;
use zerocopy::big_endian::U32 as u32_be;

/// Size of the fixed segment header on the wire.
pub const SEGMENT_HEADER_LEN: usize = size_of::<SegmentHeader>();
const_assert_eq!(SEGMENT_HEADER_LEN, 16);

/// Upper bound a decoder will accept for a segment's declared data
/// length when the caller has no tighter per-stream limit.
pub const MAX_SEGMENT_DATA_LEN: usize = 8192;

/// Control bits carried in the segment header.
///
/// `malformed` is an in-process sentinel produced by the decoder and is
/// never placed on the wire.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct SegmentFlags {
    /// Connection request; carries the serialised initiator
    /// configuration as the first bytes of data.
    pub handshake_syn: bool,
    /// Acknowledges a connection request.
    pub handshake_ack: bool,
    /// Carries no stream data, only an up-to-date acknowledgement.
    pub ack_only: bool,
    /// Emitted on an idle stream to keep middleboxes and the peer's
    /// timers alive.
    pub keep_alive: bool,
    /// The sender has finished; the stream is being torn down.
    pub reset_terminate: bool,
    /// Decoder sentinel, never transmitted.
    pub malformed: bool,
    #[bits(10)]
    _reserved: u16,
}

impl SegmentFlags {
    /// True when any handshake bit is set.
    pub fn is_handshake(&self) -> bool {
        self.handshake_syn() || self.handshake_ack()
    }
}

/// Fixed-size header preceding segment data on the wire.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct SegmentHeader {
    /// Identifier of the transmission control that emitted the segment.
    pub id: u16_be,
    /// Raw [`SegmentFlags`] bits.
    pub flags: u16_be,
    /// Byte offset of the first data byte in the sender's stream.
    pub seq_num: u32_be,
    /// Highest contiguous byte offset received from the peer.
    pub ack_num: u32_be,
    /// Random salt, refreshed for every transmission to defeat DNS
    /// caches along the path.
    pub reserved: u16_be,
    /// Length of the data that follows the header.
    pub length: u16_be,
}

/// A single protocol segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Identifier of the emitting transmission control, echoed by the
    /// peer.
    pub id: u16,
    /// Control bits.
    pub flags: SegmentFlags,
    /// Byte offset of the first data byte in the sender's stream.
    pub seq_num: u32,
    /// Highest contiguous byte offset received from the peer.
    pub ack_num: u32,
    /// Per-transmission random salt.
    pub reserved: u16,
    /// Stream payload (or the handshake payload for syn segments).
    pub data: Vec<u8>,
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            id: 0,
            flags: SegmentFlags::new(),
            seq_num: 0,
            ack_num: 0,
            reserved: 0,
            data: Vec::new(),
        }
    }
}

impl Segment {
    /// Builds the malformed sentinel carrying `reason` as its data.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self {
            flags: SegmentFlags::new().with_malformed(true),
            data: reason.into().into_bytes(),
            ..Self::default()
        }
    }

    /// True when this segment is the decoder's malformed sentinel.
    pub fn is_malformed(&self) -> bool {
        self.flags.malformed()
    }

    /// Serialises the segment: header followed by data verbatim.
    pub fn to_packet(&self) -> Vec<u8> {
        let header = SegmentHeader {
            id: self.id.into(),
            flags: self.flags.into_bits().into(),
            seq_num: self.seq_num.into(),
            ack_num: self.ack_num.into(),
            reserved: self.reserved.into(),
            length: (self.data.len() as u16).into(),
        };
        let mut packet = Vec::with_capacity(SEGMENT_HEADER_LEN + self.data.len());
        packet.extend_from_slice(header.as_bytes());
        packet.extend_from_slice(&self.data);
        packet
    }

    /// Decodes a segment from `packet`, accepting at most
    /// `max_data_len` bytes of declared data.
    ///
    /// Malformed input (truncated header, over-declared length, a syn
    /// segment too short to carry the initiator configuration) yields
    /// the sentinel from [`Segment::malformed`]. Bytes past the
    /// declared length are ignored.
    pub fn from_packet(packet: &[u8], max_data_len: usize) -> Self {
        let Ok((header, rest)) = SegmentHeader::read_from_prefix(packet) else {
            return Self::malformed(format!(
                "packet too short for header: {} < {SEGMENT_HEADER_LEN}",
                packet.len()
            ));
        };
        let length = header.length.get() as usize;
        if length > max_data_len {
            return Self::malformed(format!(
                "declared length {length} exceeds limit {max_data_len}"
            ));
        }
        if length > rest.len() {
            return Self::malformed(format!(
                "declared length {length} exceeds remaining {} bytes",
                rest.len()
            ));
        }
        let flags = SegmentFlags::from_bits(header.flags.get());
        if flags.handshake_syn() && length < INITIATOR_CONFIG_LEN {
            return Self::malformed(format!(
                "syn data {length} shorter than initiator config {INITIATOR_CONFIG_LEN}"
            ));
        }
        Self {
            id: header.id.get(),
            flags,
            seq_num: header.seq_num.get(),
            ack_num: header.ack_num.get(),
            reserved: header.reserved.get(),
            data: rest[..length].to_vec(),
        }
    }

    /// Compares everything but the [`Segment::reserved`] salt, which
    /// changes on every transmission.
    pub fn equivalent(&self, other: &Self) -> bool {
        self.id == other.id
            && self.flags == other.flags
            && self.seq_num == other.seq_num
            && self.ack_num == other.ack_num
            && self.data == other.data
    }

    /// Length of the serialised segment.
    pub fn packet_len(&self) -> usize {
        SEGMENT_HEADER_LEN + self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InitiatorConfig;

    fn sample() -> Segment {
        Segment {
            id: 0x1234,
            flags: SegmentFlags::new().with_keep_alive(true).with_ack_only(true),
            seq_num: 0xdead_beef,
            ack_num: 0x0bad_cafe,
            reserved: 0x5a5a,
            data: vec![1, 2, 3, 4, 5],
        }
    }

    #[test]
    fn packet_round_trip() {
        let seg = sample();
        let packet = seg.to_packet();
        assert_eq!(packet.len(), SEGMENT_HEADER_LEN + 5);
        let back = Segment::from_packet(&packet, MAX_SEGMENT_DATA_LEN);
        assert_eq!(back, seg);
    }

    #[test]
    fn header_layout_is_big_endian() {
        let seg = Segment {
            id: 0x0102,
            flags: SegmentFlags::from_bits(0x0304),
            seq_num: 0x0506_0708,
            ack_num: 0x090a_0b0c,
            reserved: 0x0d0e,
            data: vec![0xff],
        };
        let packet = seg.to_packet();
        assert_eq!(
            &packet[..SEGMENT_HEADER_LEN],
            &[1, 2, 3, 4, 5, 6, 7, 8, 9, 0xa, 0xb, 0xc, 0xd, 0xe, 0, 1]
        );
    }

    #[test]
    fn short_packet_is_malformed() {
        let seg = Segment::from_packet(&[0; SEGMENT_HEADER_LEN - 1], MAX_SEGMENT_DATA_LEN);
        assert!(seg.is_malformed());
    }

    #[test]
    fn over_declared_length_is_malformed() {
        let mut packet = sample().to_packet();
        // Claim one more byte than the packet carries.
        packet[15] = 6;
        assert!(Segment::from_packet(&packet, MAX_SEGMENT_DATA_LEN).is_malformed());
    }

    #[test]
    fn length_above_limit_is_malformed() {
        let packet = sample().to_packet();
        assert!(Segment::from_packet(&packet, 4).is_malformed());
    }

    #[test]
    fn short_syn_is_malformed() {
        let seg = Segment {
            flags: SegmentFlags::new().with_handshake_syn(true),
            data: vec![0; INITIATOR_CONFIG_LEN - 1],
            ..Segment::default()
        };
        assert!(Segment::from_packet(&seg.to_packet(), MAX_SEGMENT_DATA_LEN).is_malformed());
    }

    #[test]
    fn syn_with_config_parses() {
        let seg = Segment {
            flags: SegmentFlags::new().with_handshake_syn(true),
            data: InitiatorConfig::default().to_bytes().to_vec(),
            ..Segment::default()
        };
        let back = Segment::from_packet(&seg.to_packet(), MAX_SEGMENT_DATA_LEN);
        assert!(!back.is_malformed());
        assert_eq!(back, seg);
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let seg = sample();
        let mut packet = seg.to_packet();
        packet.extend_from_slice(b"junk");
        assert_eq!(Segment::from_packet(&packet, MAX_SEGMENT_DATA_LEN), seg);
    }

    #[test]
    fn equivalence_ignores_reserved() {
        let a = sample();
        let mut b = sample();
        b.reserved = 0x1111;
        assert!(a.equivalent(&b));
        b.data.push(9);
        assert!(!a.equivalent(&b));
    }
}
