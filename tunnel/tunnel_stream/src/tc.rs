// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The transmission control: a reliable, ordered, duplex byte stream
//! over an arbitrary, lossy, high-latency segment transport.
//!
//! Each instance owns two worker threads. The output drain turns the
//! caller's buffered writes into segments (handshake first, then data
//! under a sliding window, with retransmission, keep-alive and delayed
//! acknowledgement), and the input drain decodes segments from the
//! transport and feeds the read buffer, accepting only strictly
//! consecutive data. There is no reordering buffer; the peer
//! retransmits.
//!
//! The state machine only ever moves forward:
//! `Empty → SynReceived/PeerAck → Established → PeerClosed → Closed`,
//! and `Closed` is terminal.

use crate::buffer::fresh_reserved;
use crate::pipe::InputTransport;
use crate::timing::LiveTiming;
use crate::timing::StreamTiming;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;
use tracing::trace;
use tracing::warn;
use tunnel_protocol::INITIATOR_CONFIG_LEN;
use tunnel_protocol::InitiatorConfig;
use tunnel_protocol::MAX_SEGMENT_DATA_LEN;
use tunnel_protocol::SEGMENT_HEADER_LEN;
use tunnel_protocol::Segment;
use tunnel_protocol::SegmentFlags;

/// Granularity at which blocked operations re-check state and
/// deadlines.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors surfaced by the stream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The operation's deadline expired, or the stream closed while the
    /// operation was blocked.
    #[error("stream operation timed out")]
    Timeout,
    /// The operation was attempted on a stream that no longer accepts
    /// it.
    #[error("stream is closed")]
    Closed,
}

/// Lifecycle states of a transmission control, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamState {
    /// Freshly created; the initiator retransmits its syn from here.
    Empty = 0,
    /// Responder only: a valid syn arrived, acks are being sent.
    SynReceived = 1,
    /// Initiator only: the responder's ack arrived, the closing syn-ack
    /// is due.
    PeerAck = 2,
    /// Handshake complete, data flows.
    Established = 3,
    /// The peer sent reset-terminate; remaining output drains, then the
    /// stream closes.
    PeerClosed = 4,
    /// Terminal. Workers have exited or are exiting; buffered input may
    /// still be read.
    Closed = 100,
}

/// Callback observing every segment the stream emits, invoked after the
/// segment is written to the output transport.
///
/// The callback must not block and must not call back into the stream.
pub type OutputSegmentCallback = Arc<dyn Fn(&Segment) + Send + Sync>;

/// Construction parameters of a [`TransmissionControl`].
///
/// Zero-valued numeric fields and zero durations take the documented
/// defaults when the stream is created.
pub struct TcParams {
    /// Stream identifier, echoed by the peer.
    pub id: u16,
    /// True on the side that opens the stream and speaks first.
    pub initiator: bool,
    /// Verbose per-segment logging.
    pub debug: bool,
    /// Maximum data bytes per emitted segment. Default 256.
    pub max_segment_len_excl_header: usize,
    /// Upper bound accepted for an incoming segment's declared data
    /// length. Default [`MAX_SEGMENT_DATA_LEN`].
    pub max_input_segment_data_len: usize,
    /// Initial timing; zero fields take [`StreamTiming`] defaults.
    pub timing: StreamTiming,
    /// Sliding window bound in bytes. Default 8x the segment length.
    pub max_sliding_window: u32,
    /// Retransmissions of one burst tolerated before closing.
    /// Default 3.
    pub max_retransmissions: u32,
    /// Consecutive transport errors tolerated per direction before
    /// closing. Default 10.
    pub max_transport_errors: u32,
    /// Hard ceiling on the stream's lifetime. Default 30 minutes.
    pub max_lifetime: Duration,
    /// Initiator only: ask the responder to apply our segment length,
    /// timing and debug settings. Default true.
    pub send_config: bool,
    /// Initiator only: opaque payload carried after the configuration
    /// frame in the handshake syn (the proxy's dial request).
    pub initiator_segment_data: Vec<u8>,
}

impl Default for TcParams {
    fn default() -> Self {
        Self {
            id: 0,
            initiator: false,
            debug: false,
            max_segment_len_excl_header: 0,
            max_input_segment_data_len: 0,
            timing: StreamTiming::default(),
            max_sliding_window: 0,
            max_retransmissions: 0,
            max_transport_errors: 0,
            max_lifetime: Duration::ZERO,
            send_config: true,
            initiator_segment_data: Vec::new(),
        }
    }
}

struct TcState {
    state: StreamState,
    debug: bool,
    live: LiveTiming,
    max_segment_len: usize,

    input_buf: VecDeque<u8>,
    /// Total stream bytes accepted from the peer; doubles as the ack
    /// offset advertised to it.
    input_seq: u32,
    /// Highest ack received from the peer for our output.
    input_ack: u32,
    /// Total stream bytes handed to the output transport.
    output_seq: u32,
    /// Written-but-unacknowledged bytes; `output_base` is the absolute
    /// stream offset of `output_buf[0]`.
    output_buf: Vec<u8>,
    output_base: u32,

    ongoing_retransmissions: u32,
    input_transport_errors: u32,
    output_transport_errors: u32,

    last_output_syn: Option<Instant>,
    last_input_ack: Option<Instant>,
    last_output: Option<Instant>,
    last_input_data: Option<Instant>,
    /// Data arrived and has not been acknowledged by any outbound
    /// segment yet.
    pending_ack: bool,

    drain_close_requested: bool,
    /// Responder-side copy of whatever followed the configuration frame
    /// in the initiator's syn.
    peer_segment_data: Vec<u8>,

    close_reason: &'static str,
}

struct TcInner {
    id: u16,
    initiator: bool,
    max_sliding_window: u32,
    max_retransmissions: u32,
    max_transport_errors: u32,
    max_input_segment_data_len: usize,
    max_lifetime: Duration,
    created: Instant,
    /// Serialised configuration frame sent in every syn-flagged
    /// handshake segment.
    syn_config: Vec<u8>,
    initiator_segment_data: Vec<u8>,

    state: Mutex<TcState>,
    changed: Condvar,
    transports: Mutex<Option<Transports>>,
    output_callback: Option<OutputSegmentCallback>,
}

struct Transports {
    input: Box<dyn InputTransport>,
    output: Box<dyn Write + Send>,
}

/// A single reliable duplex byte stream over a segment transport.
///
/// Cloning yields another handle to the same stream; all methods take
/// `&self` and may be called from any thread.
#[derive(Clone)]
pub struct TransmissionControl {
    inner: Arc<TcInner>,
}

impl TransmissionControl {
    /// Creates a stream over the given transports.
    ///
    /// `output_callback`, when supplied, observes every emitted segment
    /// after it is written; responders use it with a discard output
    /// transport to collect segments into a reply backlog instead of a
    /// byte stream.
    pub fn new(
        params: TcParams,
        input: Box<dyn InputTransport>,
        output: Box<dyn Write + Send>,
        output_callback: Option<OutputSegmentCallback>,
    ) -> Self {
        let max_segment_len = if params.max_segment_len_excl_header == 0 {
            256
        } else {
            params.max_segment_len_excl_header
        };
        let max_input_segment_data_len = if params.max_input_segment_data_len == 0 {
            MAX_SEGMENT_DATA_LEN
        } else {
            params.max_input_segment_data_len
        };
        let max_sliding_window = if params.max_sliding_window == 0 {
            (max_segment_len * 8) as u32
        } else {
            params.max_sliding_window
        };
        let max_retransmissions = if params.max_retransmissions == 0 {
            3
        } else {
            params.max_retransmissions
        };
        let max_transport_errors = if params.max_transport_errors == 0 {
            10
        } else {
            params.max_transport_errors
        };
        let max_lifetime = if params.max_lifetime.is_zero() {
            Duration::from_secs(30 * 60)
        } else {
            params.max_lifetime
        };
        let timing = params.timing.or_default();
        let syn_config = InitiatorConfig {
            set_config: params.send_config,
            debug: params.debug,
            max_segment_len_excl_header: max_segment_len as u16,
            sliding_window_wait: timing.sliding_window_wait,
            retransmission_interval: timing.retransmission_interval,
            ack_delay: timing.ack_delay,
            read_timeout: timing.read_timeout,
            write_timeout: timing.write_timeout,
            keep_alive_interval: timing.keep_alive_interval,
        }
        .to_bytes()
        .to_vec();

        Self {
            inner: Arc::new(TcInner {
                id: params.id,
                initiator: params.initiator,
                max_sliding_window,
                max_retransmissions,
                max_transport_errors,
                max_input_segment_data_len,
                max_lifetime,
                created: Instant::now(),
                syn_config,
                initiator_segment_data: params.initiator_segment_data,
                state: Mutex::new(TcState {
                    state: StreamState::Empty,
                    debug: params.debug,
                    live: LiveTiming::new(timing),
                    max_segment_len,
                    input_buf: VecDeque::new(),
                    input_seq: 0,
                    input_ack: 0,
                    output_seq: 0,
                    output_buf: Vec::new(),
                    output_base: 0,
                    ongoing_retransmissions: 0,
                    input_transport_errors: 0,
                    output_transport_errors: 0,
                    last_output_syn: None,
                    last_input_ack: None,
                    last_output: None,
                    last_input_data: None,
                    pending_ack: false,
                    drain_close_requested: false,
                    peer_segment_data: Vec::new(),
                    close_reason: "",
                }),
                changed: Condvar::new(),
                transports: Mutex::new(Some(Transports { input, output })),
                output_callback,
            }),
        }
    }

    /// Spawns the input and output workers. Must be called exactly
    /// once; a second call panics.
    pub fn start(&self) {
        let Transports { input, output } = self
            .inner
            .transports
            .lock()
            .take()
            .expect("transmission control started twice");

        let inner = self.inner.clone();
        thread::Builder::new()
            .name(format!("tc-{}-out", self.inner.id))
            .spawn(move || inner.run_output(output))
            .expect("spawning the output drain worker");
        let inner = self.inner.clone();
        thread::Builder::new()
            .name(format!("tc-{}-in", self.inner.id))
            .spawn(move || inner.run_input(input))
            .expect("spawning the input drain worker");
        debug!(
            id = self.inner.id,
            initiator = self.inner.initiator,
            "stream started"
        );
    }

    /// Appends `buf` to the output buffer, blocking while the stream is
    /// not yet established or the sliding window is saturated.
    ///
    /// All-or-nothing: either every byte is accepted (`Ok(buf.len())`)
    /// or nothing was stored. A stream that closes while the call is
    /// blocked fails with [`StreamError::Timeout`], like any expired
    /// deadline; one that stopped accepting writes after
    /// [`close_after_drained`](Self::close_after_drained) fails with
    /// [`StreamError::Closed`].
    pub fn write(&self, buf: &[u8]) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.inner.state.lock();
        let deadline = Instant::now() + state.live.initial().write_timeout;
        loop {
            if state.state == StreamState::Closed {
                return Err(StreamError::Timeout);
            }
            if state.drain_close_requested || state.state == StreamState::PeerClosed {
                return Err(StreamError::Closed);
            }
            if state.state == StreamState::Established {
                let window = state.output_seq.wrapping_sub(state.input_ack);
                if window < self.inner.max_sliding_window {
                    state.output_buf.extend_from_slice(buf);
                    self.inner.changed.notify_all();
                    return Ok(buf.len());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StreamError::Timeout);
            }
            let _ = self
                .inner
                .changed
                .wait_for(&mut state, POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Moves up to `buf.len()` bytes out of the input buffer, blocking
    /// up to the read timeout while it is empty.
    ///
    /// Residual data remains readable after the stream closes; once it
    /// is exhausted a closed stream fails with [`StreamError::Closed`],
    /// while an open-but-idle one fails with [`StreamError::Timeout`].
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.inner.state.lock();
        let deadline = Instant::now() + state.live.initial().read_timeout;
        loop {
            if !state.input_buf.is_empty() {
                let n = buf.len().min(state.input_buf.len());
                for (dst, src) in buf[..n].iter_mut().zip(state.input_buf.drain(..n)) {
                    *dst = src;
                }
                return Ok(n);
            }
            if state.state == StreamState::Closed {
                return Err(StreamError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StreamError::Timeout);
            }
            let _ = self
                .inner
                .changed
                .wait_for(&mut state, POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Hard close: transitions to [`StreamState::Closed`], wakes every
    /// blocked caller and stops both workers. Idempotent.
    pub fn close(&self) {
        self.inner.close("explicit close");
    }

    /// Soft close: stops accepting writes, and once every buffered byte
    /// is sent and acknowledged the output worker emits a final
    /// reset-terminate segment and closes the stream.
    pub fn close_after_drained(&self) {
        let mut state = self.inner.state.lock();
        if !state.drain_close_requested {
            state.drain_close_requested = true;
            debug!(id = self.inner.id, "close after drained requested");
        }
        self.inner.changed.notify_all();
    }

    /// Blocks until the state reaches at least `target`, the stream
    /// closes, or `timeout` expires. Returns whether the state is now
    /// `>= target` (trivially true once closed).
    pub fn wait_state(&self, target: StreamState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if state.state >= target || state.state == StreamState::Closed {
                return state.state >= target;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = self.inner.changed.wait_for(&mut state, deadline - now);
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.inner.state.lock().state
    }

    /// Total stream bytes handed to the output transport so far.
    pub fn output_seq(&self) -> u32 {
        self.inner.state.lock().output_seq
    }

    /// Snapshot of the live (adaptive) timing.
    pub fn live_timing(&self) -> StreamTiming {
        *self.inner.state.lock().live.live()
    }

    /// Stretches the live timing intervals one step, as if a keep-alive
    /// had arrived. The DNS client uses this to slow its polling when
    /// queries go unanswered.
    pub fn increase_timing_interval(&self) {
        self.inner.state.lock().live.increase();
    }

    /// Tightens the live timing intervals one step, as if data had
    /// arrived.
    pub fn decrease_timing_interval(&self) {
        self.inner.state.lock().live.decrease();
    }

    /// Responder only: the bytes that followed the configuration frame
    /// in the initiator's syn (the dial request).
    pub fn initiator_segment_data(&self) -> Vec<u8> {
        self.inner.state.lock().peer_segment_data.clone()
    }

    /// Stream identifier.
    pub fn id(&self) -> u16 {
        self.inner.id
    }

    /// Enables or disables verbose per-segment logging.
    pub fn set_debug(&self, debug: bool) {
        self.inner.state.lock().debug = debug;
    }
}

/// What the output worker decided to do with the current snapshot.
enum Action {
    Exit,
    Close(&'static str),
    Emit {
        segments: Vec<Segment>,
        then_close: bool,
        sleep_after: Option<Duration>,
    },
    Sleep(Duration),
}

impl TcInner {
    fn close(&self, reason: &'static str) {
        let mut state = self.state.lock();
        if state.state == StreamState::Closed {
            return;
        }
        state.state = StreamState::Closed;
        state.close_reason = reason;
        debug!(id = self.id, reason, "stream closed");
        self.changed.notify_all();
    }

    fn handshake_syn_data(&self) -> Vec<u8> {
        let mut data = self.syn_config.clone();
        data.extend_from_slice(&self.initiator_segment_data);
        data
    }

    // ---- Output drain ----

    fn run_output(self: Arc<Self>, mut output: Box<dyn Write + Send>) {
        loop {
            match self.decide_output() {
                Action::Exit => break,
                Action::Close(reason) => self.close(reason),
                Action::Sleep(duration) => {
                    let mut state = self.state.lock();
                    if state.state != StreamState::Closed {
                        let _ = self
                            .changed
                            .wait_for(&mut state, duration.min(POLL_INTERVAL));
                    }
                }
                Action::Emit {
                    segments,
                    then_close,
                    sleep_after,
                } => {
                    for segment in segments {
                        if !self.emit(&mut *output, segment) {
                            break;
                        }
                    }
                    if then_close {
                        self.close("drained after close");
                    }
                    if let Some(duration) = sleep_after {
                        let mut state = self.state.lock();
                        if state.state != StreamState::Closed {
                            let _ = self
                                .changed
                                .wait_for(&mut state, duration.min(POLL_INTERVAL));
                        }
                    }
                }
            }
        }
        trace!(id = self.id, "output drain worker exiting");
    }

    /// Writes one segment to the transport and hands it to the output
    /// callback. Returns false once the stream should stop emitting.
    fn emit(&self, output: &mut (dyn Write + Send), mut segment: Segment) -> bool {
        segment.reserved = fresh_reserved();
        let packet = segment.to_packet();
        let result = output.write_all(&packet).and_then(|()| output.flush());
        {
            let mut state = self.state.lock();
            match result {
                Ok(()) => {
                    state.output_transport_errors = 0;
                    state.last_output = Some(Instant::now());
                    if state.debug {
                        debug!(
                            id = self.id,
                            flags = segment.flags.into_bits(),
                            seq_num = segment.seq_num,
                            ack_num = segment.ack_num,
                            len = segment.data.len(),
                            "segment emitted"
                        );
                    }
                }
                Err(err) => {
                    state.output_transport_errors += 1;
                    warn!(
                        id = self.id,
                        error = &err as &dyn std::error::Error,
                        consecutive = state.output_transport_errors,
                        "output transport write failed"
                    );
                    if state.output_transport_errors >= self.max_transport_errors {
                        drop(state);
                        self.close("output transport error limit");
                        return false;
                    }
                    return true;
                }
            }
        }
        if let Some(callback) = &self.output_callback {
            callback(&segment);
        }
        true
    }

    fn decide_output(&self) -> Action {
        let mut state = self.state.lock();
        let now = Instant::now();
        if state.state == StreamState::Closed {
            return Action::Exit;
        }
        if now.duration_since(self.created) > self.max_lifetime {
            return Action::Close("max lifetime exceeded");
        }
        let live = *state.live.live();

        if state.state < StreamState::Established {
            return self.decide_handshake(&mut state, now, &live);
        }

        // Final reset once everything written has been sent and
        // acknowledged.
        let all_sent = state.output_base + state.output_buf.len() as u32 == state.output_seq;
        let all_acked = state.input_ack >= state.output_seq;
        if (state.state == StreamState::PeerClosed || state.drain_close_requested)
            && all_sent
            && all_acked
        {
            let segment = Segment {
                id: self.id,
                flags: SegmentFlags::new().with_reset_terminate(true),
                seq_num: state.output_seq,
                ack_num: state.input_seq,
                ..Segment::default()
            };
            state.pending_ack = false;
            return Action::Emit {
                segments: vec![segment],
                then_close: true,
                sleep_after: None,
            };
        }

        // Retransmission of the unacknowledged suffix.
        if state.input_ack < state.output_seq
            && state
                .last_input_ack
                .is_some_and(|at| now.duration_since(at) > live.retransmission_interval)
        {
            state.ongoing_retransmissions += 1;
            if state.ongoing_retransmissions > self.max_retransmissions {
                return Action::Close("retransmission limit exceeded");
            }
            state.last_input_ack = Some(now);
            let retransmissions = state.ongoing_retransmissions;
            let (from, to) = (state.input_ack, state.output_seq);
            let segments = self.data_segments(&mut state, from, to);
            warn!(
                id = self.id,
                from,
                to,
                retransmissions,
                "retransmitting unacknowledged output"
            );
            return Action::Emit {
                segments,
                then_close: false,
                sleep_after: Some(live.sliding_window_wait),
            };
        }

        // Congestion wait while the window is saturated.
        let window = state.output_seq.wrapping_sub(state.input_ack);
        if window >= self.max_sliding_window {
            return Action::Sleep(live.sliding_window_wait);
        }

        // Normal send of not-yet-transmitted bytes.
        let buffered_end = state.output_base + state.output_buf.len() as u32;
        if state.output_seq < buffered_end {
            let room = self.max_sliding_window - window;
            let len = (buffered_end - state.output_seq)
                .min(room)
                .min(state.max_segment_len as u32);
            let from = state.output_seq;
            let end = from + len;
            let segments = self.data_segments(&mut state, from, end);
            state.output_seq = end;
            return Action::Emit {
                segments,
                then_close: false,
                sleep_after: None,
            };
        }

        // Keep-alive on an idle stream.
        if state
            .last_output
            .is_none_or(|at| now.duration_since(at) > live.keep_alive_interval)
        {
            let segment = Segment {
                id: self.id,
                flags: SegmentFlags::new().with_ack_only(true).with_keep_alive(true),
                seq_num: state.output_seq,
                ack_num: state.input_seq,
                ..Segment::default()
            };
            state.pending_ack = false;
            return Action::Emit {
                segments: vec![segment],
                then_close: false,
                sleep_after: None,
            };
        }

        // Delayed acknowledgement of received data.
        if state.pending_ack
            && state
                .last_input_data
                .is_some_and(|at| now.duration_since(at) >= live.ack_delay)
        {
            let segment = Segment {
                id: self.id,
                flags: SegmentFlags::new().with_ack_only(true),
                seq_num: state.output_seq,
                ack_num: state.input_seq,
                ..Segment::default()
            };
            state.pending_ack = false;
            return Action::Emit {
                segments: vec![segment],
                then_close: false,
                sleep_after: None,
            };
        }

        Action::Sleep(POLL_INTERVAL)
    }

    fn decide_handshake(
        &self,
        state: &mut MutexGuard<'_, TcState>,
        now: Instant,
        live: &StreamTiming,
    ) -> Action {
        let due = state
            .last_output_syn
            .is_none_or(|at| now.duration_since(at) >= live.retransmission_interval);
        match (self.initiator, state.state) {
            (true, StreamState::Empty) => {
                if !due {
                    return Action::Sleep(POLL_INTERVAL);
                }
                if state.last_output_syn.is_some() {
                    state.ongoing_retransmissions += 1;
                    if state.ongoing_retransmissions > self.max_retransmissions {
                        return Action::Close("handshake syn retransmission limit");
                    }
                }
                state.last_output_syn = Some(now);
                let segment = Segment {
                    id: self.id,
                    flags: SegmentFlags::new().with_handshake_syn(true),
                    data: self.handshake_syn_data(),
                    ..Segment::default()
                };
                Action::Emit {
                    segments: vec![segment],
                    then_close: false,
                    sleep_after: None,
                }
            }
            (true, StreamState::PeerAck) => {
                state.state = StreamState::Established;
                state.ongoing_retransmissions = 0;
                state.last_input_ack = Some(now);
                self.changed.notify_all();
                debug!(id = self.id, "initiator established");
                let segment = Segment {
                    id: self.id,
                    flags: SegmentFlags::new()
                        .with_handshake_syn(true)
                        .with_handshake_ack(true),
                    data: self.syn_config.clone(),
                    ..Segment::default()
                };
                Action::Emit {
                    segments: vec![segment],
                    then_close: false,
                    sleep_after: None,
                }
            }
            (false, StreamState::SynReceived) => {
                if !due {
                    return Action::Sleep(POLL_INTERVAL);
                }
                if state.last_output_syn.is_some() {
                    state.ongoing_retransmissions += 1;
                    if state.ongoing_retransmissions > self.max_retransmissions {
                        return Action::Close("handshake ack retransmission limit");
                    }
                }
                state.last_output_syn = Some(now);
                let segment = Segment {
                    id: self.id,
                    flags: SegmentFlags::new().with_handshake_ack(true),
                    ..Segment::default()
                };
                Action::Emit {
                    segments: vec![segment],
                    then_close: false,
                    sleep_after: None,
                }
            }
            // Responder waiting for a syn, or a state raced forward.
            _ => Action::Sleep(POLL_INTERVAL),
        }
    }

    /// Slices `output_buf[from..to]` into flag-less data segments of at
    /// most the configured segment length.
    fn data_segments(&self, state: &mut MutexGuard<'_, TcState>, from: u32, to: u32) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut seq_num = from;
        while seq_num < to {
            let start = (seq_num - state.output_base) as usize;
            let len = ((to - seq_num) as usize).min(state.max_segment_len);
            let segment = Segment {
                id: self.id,
                flags: SegmentFlags::new(),
                seq_num,
                ack_num: state.input_seq,
                reserved: 0,
                data: state.output_buf[start..start + len].to_vec(),
            };
            segments.push(segment);
            seq_num += len as u32;
        }
        state.pending_ack = false;
        segments
    }

    // ---- Input drain ----

    fn run_input(self: Arc<Self>, mut input: Box<dyn InputTransport>) {
        let mut header = [0; SEGMENT_HEADER_LEN];
        loop {
            {
                let state = self.state.lock();
                if state.state == StreamState::Closed {
                    break;
                }
            }
            // Bounded header waits keep the worker responsive to close.
            match input.read_exact_timeout(&mut header, POLL_INTERVAL) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(err) => {
                    if self.count_input_error(&err) {
                        break;
                    }
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }
            }

            let declared = u16::from_be_bytes([
                header[SEGMENT_HEADER_LEN - 2],
                header[SEGMENT_HEADER_LEN - 1],
            ]) as usize;
            let mut packet = header.to_vec();
            if declared > 0 && declared <= self.max_input_segment_data_len {
                let data_timeout = self.state.lock().live.live().segment_data_timeout;
                let mut data = vec![0; declared];
                if let Err(err) = input.read_exact_timeout(&mut data, data_timeout) {
                    if self.count_input_error(&err) {
                        break;
                    }
                    continue;
                }
                packet.extend_from_slice(&data);
            }

            let segment = Segment::from_packet(&packet, self.max_input_segment_data_len);
            if segment.is_malformed() {
                warn!(
                    id = self.id,
                    reason = String::from_utf8_lossy(&segment.data).as_ref(),
                    "dropping malformed segment"
                );
                continue;
            }
            self.state.lock().input_transport_errors = 0;
            self.handle_segment(segment);
        }
        trace!(id = self.id, "input drain worker exiting");
    }

    /// Counts one input transport error; returns true once the worker
    /// should give up.
    fn count_input_error(&self, err: &std::io::Error) -> bool {
        let mut state = self.state.lock();
        if state.state == StreamState::Closed {
            return true;
        }
        state.input_transport_errors += 1;
        warn!(
            id = self.id,
            error = err as &dyn std::error::Error,
            consecutive = state.input_transport_errors,
            "input transport read failed"
        );
        if state.input_transport_errors >= self.max_transport_errors {
            drop(state);
            self.close("input transport error limit");
            return true;
        }
        false
    }

    fn handle_segment(&self, segment: Segment) {
        let mut state = self.state.lock();
        let now = Instant::now();
        if state.debug {
            debug!(
                id = self.id,
                state = ?state.state,
                flags = segment.flags.into_bits(),
                seq_num = segment.seq_num,
                ack_num = segment.ack_num,
                len = segment.data.len(),
                "segment received"
            );
        }
        match state.state {
            StreamState::Empty if !self.initiator => {
                if segment.flags.handshake_syn() && !segment.flags.handshake_ack() {
                    self.accept_syn(&mut state, segment);
                }
            }
            StreamState::Empty if self.initiator => {
                if segment.flags.handshake_ack() && !segment.flags.handshake_syn() {
                    state.state = StreamState::PeerAck;
                    debug!(id = self.id, "peer acknowledged handshake");
                    self.changed.notify_all();
                }
            }
            StreamState::SynReceived => {
                if segment.flags.handshake_syn() && segment.flags.handshake_ack() {
                    state.state = StreamState::Established;
                    state.ongoing_retransmissions = 0;
                    state.last_input_ack = Some(now);
                    debug!(id = self.id, "responder established");
                    self.changed.notify_all();
                }
                // A retransmitted bare syn means our ack was lost; the
                // output drain keeps re-sending it on its own schedule.
            }
            StreamState::PeerAck => {
                // Waiting for the output drain to finish the handshake;
                // duplicate acks are of no further interest.
            }
            StreamState::Established | StreamState::PeerClosed => {
                self.handle_established(&mut state, segment, now);
            }
            _ => {}
        }
    }

    fn accept_syn(&self, state: &mut MutexGuard<'_, TcState>, segment: Segment) {
        // The decoder guarantees syn data is long enough for the frame.
        let Some(config) = InitiatorConfig::from_bytes(&segment.data) else {
            return;
        };
        if config.set_config {
            if config.max_segment_len_excl_header > 0 {
                state.max_segment_len = config.max_segment_len_excl_header as usize;
            }
            state.debug |= config.debug;
            let timing = state.live.initial().merge_config(&config);
            state.live = LiveTiming::new(timing);
        }
        state.peer_segment_data = segment.data[INITIATOR_CONFIG_LEN..].to_vec();
        state.state = StreamState::SynReceived;
        debug!(
            id = self.id,
            set_config = config.set_config,
            segment_data = state.peer_segment_data.len(),
            "handshake syn accepted"
        );
        self.changed.notify_all();
    }

    fn handle_established(
        &self,
        state: &mut MutexGuard<'_, TcState>,
        segment: Segment,
        now: Instant,
    ) {
        if segment.flags.is_handshake() {
            // A retransmitted handshake segment; the peer has not seen
            // our progress yet.
            return;
        }

        state.last_input_ack = Some(now);
        if segment.ack_num > state.output_seq {
            warn!(
                id = self.id,
                ack_num = segment.ack_num,
                output_seq = state.output_seq,
                "ignoring acknowledgement beyond transmitted data"
            );
        } else if segment.ack_num > state.input_ack {
            let advance = segment.ack_num - state.output_base;
            state.output_buf.drain(..advance as usize);
            state.output_base = segment.ack_num;
            state.input_ack = segment.ack_num;
            state.ongoing_retransmissions = 0;
            self.changed.notify_all();
        }

        if !segment.data.is_empty() && !segment.flags.ack_only() {
            if segment.seq_num == state.input_seq {
                state.input_seq += segment.data.len() as u32;
                state.input_buf.extend(&segment.data);
                state.pending_ack = true;
                state.last_input_data = Some(now);
                state.live.decrease();
                self.changed.notify_all();
            } else if state.debug {
                debug!(
                    id = self.id,
                    seq_num = segment.seq_num,
                    expected = state.input_seq,
                    "dropping out-of-sequence segment"
                );
            }
        } else if segment.flags.keep_alive() {
            state.live.increase();
        }

        if segment.flags.reset_terminate() && state.state < StreamState::PeerClosed {
            state.state = StreamState::PeerClosed;
            debug!(id = self.id, "peer closed the stream");
            self.changed.notify_all();
        }
    }
}

impl std::fmt::Debug for TransmissionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TransmissionControl")
            .field("id", &self.inner.id)
            .field("initiator", &self.inner.initiator)
            .field("state", &state.state)
            .field("input_seq", &state.input_seq)
            .field("input_ack", &state.input_ack)
            .field("output_seq", &state.output_seq)
            .field("close_reason", &state.close_reason)
            .finish()
    }
}
