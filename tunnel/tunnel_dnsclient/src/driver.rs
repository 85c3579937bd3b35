// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The initiator-side driver: the loop that turns a transmission
//! control's outbound segments into DNS queries and the CNAME answers
//! back into inbound segments.
//!
//! The driver owns the pacing. Data in either direction tightens the
//! polling toward the live ack delay; keep-alives stretch it toward the
//! live keep-alive interval; failed or useless queries back off by the
//! busy-wait interval and stretch the stream's live timing one notch.

use crate::resolver::CnameResolver;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::warn;
use tunnel_protocol::MAX_SEGMENT_DATA_LEN;
use tunnel_protocol::ProxyRequest;
use tunnel_protocol::Segment;
use tunnel_protocol::optimal_seg_len;
use tunnel_protocol::segment_from_dns_name;
use tunnel_protocol::segment_to_dns_name;
use tunnel_stream::PipeWriter;
use tunnel_stream::SegmentBuffer;
use tunnel_stream::StreamState;
use tunnel_stream::TcParams;
use tunnel_stream::TransmissionControl;
use tunnel_stream::pipe::pipe;

/// Capacity of the pipe feeding decoded reply packets into the stream.
const INPUT_PIPE_CAPACITY: usize = 64 * 1024;

/// Granularity of interruptible pauses between queries.
const PAUSE_SLICE: Duration = Duration::from_millis(100);

/// Driver configuration. Zero or empty values take the documented
/// defaults where one exists.
pub struct DriverParams {
    /// Single-letter routing label prefixed to every query name.
    /// Default `t`.
    pub prefix: char,
    /// The apex domain whose authoritative server is the responder.
    pub apex: String,
    /// Number of labels in the apex. Zero derives it from `apex`.
    pub num_apex_labels: usize,
    /// Back-off after a failed or CNAME-less query. Default 500ms.
    pub busy_wait_interval: Duration,
}

impl Default for DriverParams {
    fn default() -> Self {
        Self {
            prefix: 't',
            apex: String::new(),
            num_apex_labels: 0,
            busy_wait_interval: Duration::from_millis(500),
        }
    }
}

/// The initiator glue: one transmission control, its outbound segment
/// buffer and the resolver that carries segments as DNS names.
pub struct TunnelDriver {
    params: DriverParams,
    tc: TransmissionControl,
    outbound: Arc<SegmentBuffer>,
    input: PipeWriter,
    resolver: Box<dyn CnameResolver>,
}

impl TunnelDriver {
    /// Assembles an initiator stream for `request` and the driver that
    /// will carry it over `resolver`.
    ///
    /// A zero `max_segment_len_excl_header` in `tc_params` is replaced
    /// by [`optimal_seg_len`] for the apex, and a zero `id` by a random
    /// one. The stream is created but not started; [`run`](Self::run)
    /// starts it.
    pub fn new(
        params: DriverParams,
        mut tc_params: TcParams,
        request: &ProxyRequest,
        resolver: Box<dyn CnameResolver>,
    ) -> Self {
        let mut params = params;
        assert!(!params.apex.is_empty(), "the apex domain is required");
        assert!(
            params.prefix.is_ascii_lowercase(),
            "the prefix must be a single lower-case letter"
        );
        if params.num_apex_labels == 0 {
            params.num_apex_labels = params.apex.split('.').count();
        }
        if params.busy_wait_interval.is_zero() {
            params.busy_wait_interval = DriverParams::default().busy_wait_interval;
        }

        tc_params.initiator = true;
        if tc_params.max_segment_len_excl_header == 0 {
            tc_params.max_segment_len_excl_header = optimal_seg_len(&params.apex);
        }
        if tc_params.id == 0 {
            let mut id_bytes = [0; 2];
            if getrandom::fill(&mut id_bytes).is_ok() {
                tc_params.id = u16::from_be_bytes(id_bytes);
            }
        }
        tc_params.initiator_segment_data =
            serde_json::to_vec(request).expect("dial requests always serialise");

        let max_seg_len = tc_params.max_segment_len_excl_header;
        let (input_reader, input_writer) = pipe(INPUT_PIPE_CAPACITY);
        let outbound = Arc::new(SegmentBuffer::new(max_seg_len));
        let absorb_into = outbound.clone();
        let tc = TransmissionControl::new(
            tc_params,
            Box::new(input_reader),
            Box::new(std::io::sink()),
            Some(Arc::new(move |seg: &Segment| {
                absorb_into.absorb(seg.clone());
            })),
        );
        Self {
            params,
            tc,
            outbound,
            input: input_writer,
            resolver,
        }
    }

    /// Another handle to the tunnelled stream, for reading and writing
    /// application bytes.
    pub fn stream(&self) -> TransmissionControl {
        self.tc.clone()
    }

    /// Starts the stream and drives it until it closes and the final
    /// control segment has been offered to the resolver.
    pub fn run(mut self) {
        self.tc.start();
        debug!(
            id = self.tc.id(),
            apex = self.params.apex.as_str(),
            "tunnel driver running"
        );
        loop {
            if self.tc.state() == StreamState::Closed {
                break;
            }
            let Some(segment) = self.outbound.wait_pop(self.params.busy_wait_interval) else {
                continue;
            };
            self.exchange(segment);
        }
        self.flush_final_segment();
        debug!(id = self.tc.id(), "tunnel driver finished");
    }

    /// Starts the driver loop on its own thread.
    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name(format!("tunnel-driver-{}", self.tc.id()))
            .spawn(move || self.run())
            .expect("spawning the tunnel driver")
    }

    /// Carries one segment out as a query and feeds whatever comes
    /// back into the stream, then pauses per the pacing rules.
    fn exchange(&mut self, segment: Segment) {
        let name = match segment_to_dns_name(&segment, self.params.prefix, &self.params.apex) {
            Ok(name) => name,
            Err(err) => {
                // Only a misconfigured segment length can cause this.
                error!(
                    id = self.tc.id(),
                    error = &err as &dyn std::error::Error,
                    "segment does not fit a DNS name"
                );
                return;
            }
        };
        match self.resolver.query(&name) {
            Ok(Some(target)) => {
                let reply =
                    segment_from_dns_name(&target, self.params.num_apex_labels, MAX_SEGMENT_DATA_LEN);
                if reply.is_malformed() {
                    warn!(
                        id = self.tc.id(),
                        reason = String::from_utf8_lossy(&reply.data).as_ref(),
                        "CNAME answer does not decode"
                    );
                    self.tc.increase_timing_interval();
                    self.pause(self.params.busy_wait_interval);
                    return;
                }
                let keep_alive = reply.flags.keep_alive();
                if self.input.write_all(&reply.to_packet()).is_err() {
                    // The stream is tearing down; the loop will see
                    // the closed state next time around.
                    return;
                }
                // Keep-alives mean the far side is idle, so stretch the
                // polling; anything else keeps it at the ack delay.
                let live = self.tc.live_timing();
                let wait = if keep_alive {
                    live.keep_alive_interval * 8 / 7
                } else {
                    live.ack_delay * 8 / 7
                };
                self.pause(wait);
            }
            Ok(None) => {
                self.tc.increase_timing_interval();
                self.pause(self.params.busy_wait_interval);
            }
            Err(err) => {
                warn!(
                    id = self.tc.id(),
                    error = &err as &dyn std::error::Error,
                    "query failed"
                );
                self.tc.increase_timing_interval();
                self.pause(self.params.busy_wait_interval);
            }
        }
    }

    /// Sleeps up to `total`, cut short as soon as the stream closes or
    /// new outbound segments queue up.
    fn pause(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            if self.tc.state() == StreamState::Closed || !self.outbound.is_empty() {
                return;
            }
            thread::sleep(PAUSE_SLICE.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    /// After close, sends the newest still-queued control segment (the
    /// terminal reset, typically) in one last query so the responder
    /// learns the stream is gone.
    fn flush_final_segment(&mut self) {
        thread::sleep(Duration::from_millis(200));
        let mut tail = None;
        while let Some(segment) = self.outbound.pop() {
            tail = Some(segment);
        }
        let Some(segment) = tail else { return };
        if segment.flags.reset_terminate()
            || segment.flags.ack_only()
            || segment.flags.keep_alive()
        {
            if let Ok(name) =
                segment_to_dns_name(&segment, self.params.prefix, &self.params.apex)
            {
                let _ = self.resolver.query(&name);
            }
        }
    }
}
