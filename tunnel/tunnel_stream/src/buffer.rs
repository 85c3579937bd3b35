// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The outbound segment buffer.
//!
//! A single-direction FIFO of segments awaiting an expensive transport
//! (one DNS query per segment), with in-place coalescing: superseded
//! control segments are overwritten, adjacent duplicates dropped,
//! contiguous data merged, and a retransmission purges everything it
//! obsoletes. Acks and keep-alives carry no stream data and merging
//! preserves byte order, so the substitutions never lose information.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;
use tunnel_protocol::Segment;

/// Draws the random salt that makes every transmitted segment distinct
/// to DNS caches along the path.
pub(crate) fn fresh_reserved() -> u16 {
    let mut bytes = [0; 2];
    // The system entropy source failing is not a recoverable condition;
    // a fixed salt only weakens cache busting.
    if getrandom::fill(&mut bytes).is_err() {
        return 0x5a17;
    }
    u16::from_be_bytes(bytes)
}

/// A coalescing FIFO of segments awaiting transport.
pub struct SegmentBuffer {
    max_seg_len: usize,
    segments: Mutex<VecDeque<Segment>>,
    ready: Condvar,
}

impl SegmentBuffer {
    /// Creates a buffer that merges contiguous data segments up to
    /// `max_seg_len` bytes of combined data.
    pub fn new(max_seg_len: usize) -> Self {
        Self {
            max_seg_len,
            segments: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// Enqueues `seg`, applying the coalescing rules against the
    /// current tail.
    pub fn absorb(&self, mut seg: Segment) {
        seg.reserved = fresh_reserved();
        let mut segments = self.segments.lock();
        match segments.back_mut() {
            None => segments.push_back(seg),
            Some(latest) if seg.seq_num < latest.seq_num => {
                // A retransmission restarts the stream from an earlier
                // offset; everything queued after it is obsolete.
                segments.clear();
                segments.push_back(seg);
            }
            Some(latest) if latest.flags.ack_only() || latest.flags.keep_alive() => {
                // Newer control supersedes older control.
                *latest = seg;
            }
            Some(latest) if latest.equivalent(&seg) => {}
            Some(latest)
                if seg.flags.into_bits() == 0
                    && seg.seq_num > 0
                    && seg.seq_num == latest.seq_num + latest.data.len() as u32
                    && latest.data.len() + seg.data.len() <= self.max_seg_len =>
            {
                // Contiguous data merges into the tail, which keeps its
                // sequence number and salt but takes the newer ack.
                latest.ack_num = seg.ack_num;
                latest.data.extend_from_slice(&seg.data);
            }
            Some(_) => segments.push_back(seg),
        }
        self.ready.notify_all();
    }

    /// Peeks at the oldest queued segment.
    pub fn first(&self) -> Option<Segment> {
        self.segments.lock().front().cloned()
    }

    /// Dequeues the oldest queued segment.
    pub fn pop(&self) -> Option<Segment> {
        self.segments.lock().pop_front()
    }

    /// Peeks at the newest queued segment.
    pub fn latest(&self) -> Option<Segment> {
        self.segments.lock().back().cloned()
    }

    /// Dequeues the oldest segment, waiting up to `timeout` for one to
    /// arrive.
    pub fn wait_pop(&self, timeout: Duration) -> Option<Segment> {
        let deadline = Instant::now() + timeout;
        let mut segments = self.segments.lock();
        loop {
            if let Some(seg) = segments.pop_front() {
                return Some(seg);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = self.ready.wait_for(&mut segments, deadline - now);
        }
    }

    /// Number of queued segments.
    pub fn len(&self) -> usize {
        self.segments.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.segments.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tunnel_protocol::SegmentFlags;

    fn data_seg(seq_num: u32, ack_num: u32, data: &[u8]) -> Segment {
        Segment {
            id: 1,
            seq_num,
            ack_num,
            data: data.to_vec(),
            ..Segment::default()
        }
    }

    fn keep_alive(seq_num: u32, ack_num: u32) -> Segment {
        Segment {
            id: 1,
            flags: SegmentFlags::new().with_ack_only(true).with_keep_alive(true),
            seq_num,
            ack_num,
            ..Segment::default()
        }
    }

    #[test]
    fn contiguous_data_merges() {
        let buffer = SegmentBuffer::new(10);
        buffer.absorb(data_seg(0, 1, &[0, 1, 2]));
        buffer.absorb(data_seg(3, 2, &[3, 4, 5]));
        assert_eq!(buffer.len(), 1);
        let merged = buffer.first().unwrap();
        assert_eq!(merged.seq_num, 0);
        assert_eq!(merged.ack_num, 2);
        assert_eq!(merged.data, [0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn merge_respects_the_segment_length_limit() {
        let buffer = SegmentBuffer::new(10);
        buffer.absorb(data_seg(0, 0, &[0; 6]));
        buffer.absorb(data_seg(6, 0, &[1; 5]));
        assert_eq!(buffer.len(), 2, "an 11-byte merge must not happen");
    }

    #[test]
    fn merged_tail_keeps_its_salt() {
        let buffer = SegmentBuffer::new(64);
        buffer.absorb(data_seg(0, 0, &[0, 1]));
        let salt = buffer.latest().unwrap().reserved;
        buffer.absorb(data_seg(2, 0, &[2, 3]));
        assert_eq!(buffer.latest().unwrap().reserved, salt);
    }

    #[test]
    fn control_tail_is_substituted() {
        let buffer = SegmentBuffer::new(10);
        buffer.absorb(keep_alive(5, 1));
        buffer.absorb(keep_alive(5, 9));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.first().unwrap().ack_num, 9);
    }

    #[test]
    fn data_tail_is_not_substituted_by_a_keep_alive() {
        let buffer = SegmentBuffer::new(10);
        buffer.absorb(data_seg(5, 0, &[1, 2, 3]));
        buffer.absorb(keep_alive(8, 3));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.first().unwrap().data, [1, 2, 3]);
    }

    #[test]
    fn adjacent_duplicates_are_dropped() {
        let buffer = SegmentBuffer::new(10);
        buffer.absorb(data_seg(5, 0, &[1, 2]));
        buffer.absorb(data_seg(5, 0, &[1, 2]));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn retransmission_purges_the_queue() {
        let buffer = SegmentBuffer::new(4);
        buffer.absorb(data_seg(4, 0, &[4, 5]));
        buffer.absorb(keep_alive(6, 0));
        buffer.absorb(data_seg(0, 0, &[0, 1]));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.first().unwrap().seq_num, 0);
    }

    #[test]
    fn absorb_grows_by_at_most_one() {
        let buffer = SegmentBuffer::new(4);
        for i in 0..100u32 {
            let before = buffer.len();
            buffer.absorb(data_seg(i * 3, 0, &[i as u8; 3]));
            assert!(buffer.len() <= before + 1);
        }
    }

    #[test]
    fn pop_is_fifo() {
        let buffer = SegmentBuffer::new(2);
        buffer.absorb(data_seg(0, 0, &[0]));
        buffer.absorb(data_seg(5, 0, &[5]));
        buffer.absorb(data_seg(9, 0, &[9]));
        assert_eq!(buffer.pop().unwrap().seq_num, 0);
        assert_eq!(buffer.pop().unwrap().seq_num, 5);
        assert_eq!(buffer.pop().unwrap().seq_num, 9);
        assert!(buffer.pop().is_none());
    }

    #[test]
    fn a_data_segment_replaces_a_control_tail() {
        let buffer = SegmentBuffer::new(10);
        buffer.absorb(keep_alive(4, 0));
        buffer.absorb(data_seg(4, 1, &[4, 5]));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.first().unwrap().data, [4, 5]);
    }

    #[test]
    fn wait_pop_times_out_and_wakes_up() {
        let buffer = Arc::new(SegmentBuffer::new(4));
        assert!(buffer.wait_pop(Duration::from_millis(30)).is_none());
        let feeder = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                buffer.absorb(keep_alive(1, 1));
            })
        };
        let seg = buffer.wait_pop(Duration::from_secs(5)).unwrap();
        assert_eq!(seg.seq_num, 1);
        feeder.join().unwrap();
    }
}
