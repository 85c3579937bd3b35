// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The responder-side proxy.
//!
//! The DNS server hands every upstream segment it decodes to
//! [`Proxy::receive`]. The first segment of an unknown stream carries
//! the initiator's configuration frame followed by a JSON dial request;
//! the proxy dials the requested destination, builds a responder
//! transmission control whose emitted segments collect in a per-stream
//! backlog, and bridges bytes between the stream and the TCP
//! connection. Replies to later queries are simply the next backlog
//! segment, so the DNS answer path never blocks on the real
//! destination.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::io::Read;
use std::io::Write;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;
use tracing::warn;
use tunnel_protocol::INITIATOR_CONFIG_LEN;
use tunnel_protocol::ProxyRequest;
use tunnel_protocol::Segment;
use tunnel_stream::PipeWriter;
use tunnel_stream::SegmentBuffer;
use tunnel_stream::StreamState;
use tunnel_stream::TcParams;
use tunnel_stream::TransmissionControl;
use tunnel_stream::pipe::pipe;

/// Capacity of the pipe feeding decoded packets into a stream.
const INPUT_PIPE_CAPACITY: usize = 64 * 1024;

/// How long a bridge half sleeps between polls of a quiet TCP
/// connection before re-checking the stream state.
const BRIDGE_POLL: Duration = Duration::from_millis(500);

/// Proxy configuration. Zero values take the documented defaults.
pub struct ProxyParams {
    /// How long [`Proxy::receive`] waits for a reply segment to appear
    /// in the backlog. Default 2 seconds; must stay well below the
    /// initiator's query timeout.
    pub max_reply_delay: Duration,
    /// How long a closed stream's connection entry survives so the
    /// final reset-terminate segment can still be polled. Must exceed
    /// the initiator's query pacing. Default 60 seconds.
    pub linger: Duration,
    /// TCP connect timeout per destination address. Default 10 seconds.
    pub dial_timeout: Duration,
    /// Maximum data bytes per reply segment. The DNS server derives
    /// this from its apex domain length. Default 256.
    pub max_segment_len_excl_header: usize,
    /// Hard lifetime ceiling applied to every proxied stream.
    /// Default 30 minutes.
    pub max_lifetime: Duration,
    /// Verbose logging on every proxied stream.
    pub debug: bool,
}

impl Default for ProxyParams {
    fn default() -> Self {
        Self {
            max_reply_delay: Duration::from_secs(2),
            linger: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(10),
            max_segment_len_excl_header: 256,
            max_lifetime: Duration::from_secs(30 * 60),
            debug: false,
        }
    }
}

impl ProxyParams {
    fn or_default(mut self) -> Self {
        let defaults = Self::default();
        if self.max_reply_delay.is_zero() {
            self.max_reply_delay = defaults.max_reply_delay;
        }
        if self.linger.is_zero() {
            self.linger = defaults.linger;
        }
        if self.dial_timeout.is_zero() {
            self.dial_timeout = defaults.dial_timeout;
        }
        if self.max_segment_len_excl_header == 0 {
            self.max_segment_len_excl_header = defaults.max_segment_len_excl_header;
        }
        if self.max_lifetime.is_zero() {
            self.max_lifetime = defaults.max_lifetime;
        }
        self
    }
}

/// One proxied stream: a responder transmission control paired with the
/// TCP connection it bridges to and the backlog of reply segments.
#[derive(Clone)]
struct ProxyConnection {
    tc: TransmissionControl,
    backlog: Arc<SegmentBuffer>,
    input: Arc<Mutex<PipeWriter>>,
}

impl ProxyConnection {
    /// Delivers a decoded upstream packet into the stream's input
    /// transport.
    fn feed(&self, segment: &Segment) {
        let packet = segment.to_packet();
        if let Err(err) = self.input.lock().write_all(&packet) {
            warn!(
                id = segment.id,
                error = &err as &dyn std::error::Error,
                "failed to feed segment into stream"
            );
        }
    }
}

struct ProxyInner {
    params: ProxyParams,
    connections: Mutex<HashMap<u16, ProxyConnection>>,
}

/// Fleet of proxied streams keyed by their transmission control ID.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    /// Creates an empty proxy.
    pub fn new(params: ProxyParams) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                params: params.or_default(),
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Handles one upstream segment and returns the reply segment to
    /// encode into the DNS answer, if one arrives in time.
    ///
    /// The first segment of an unknown stream must be a handshake syn
    /// carrying the configuration frame and the JSON dial request; a
    /// segment that is not, or whose request fails to parse, is dropped
    /// without creating a stream and without a reply.
    pub fn receive(&self, segment: Segment) -> Option<Segment> {
        if segment.is_malformed() {
            warn!(
                reason = String::from_utf8_lossy(&segment.data).as_ref(),
                "dropping malformed upstream segment"
            );
            return None;
        }
        let existing = self.inner.connections.lock().get(&segment.id).cloned();
        let conn = match existing {
            Some(conn) => conn,
            None => self.track_new_stream(&segment)?,
        };
        conn.feed(&segment);
        conn.backlog.wait_pop(self.inner.params.max_reply_delay)
    }

    /// Number of live proxied streams.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Builds the stream, dials the destination and spawns the bridge
    /// for a first segment with an unknown ID.
    fn track_new_stream(&self, segment: &Segment) -> Option<ProxyConnection> {
        if !segment.flags.handshake_syn() || segment.flags.handshake_ack() {
            debug!(
                id = segment.id,
                flags = segment.flags.into_bits(),
                "ignoring non-syn segment for unknown stream"
            );
            return None;
        }
        // The decoder guarantees syn data covers the configuration
        // frame; the dial request follows it.
        let request: ProxyRequest =
            match serde_json::from_slice(&segment.data[INITIATOR_CONFIG_LEN..]) {
                Ok(request) => request,
                Err(err) => {
                    warn!(
                        id = segment.id,
                        error = &err as &dyn std::error::Error,
                        "dropping syn with an unparseable dial request"
                    );
                    return None;
                }
            };
        let (network, address) = request.destination();
        if network != "tcp" {
            // Only TCP is bridged; other networks dial the same
            // address over TCP rather than failing the stream.
            warn!(id = segment.id, network, "unsupported network, dialing tcp");
        }
        debug!(id = segment.id, address = address.as_str(), "dialing for new stream");

        let params = &self.inner.params;
        let (input_reader, input_writer) = pipe(INPUT_PIPE_CAPACITY);
        let backlog = Arc::new(SegmentBuffer::new(params.max_segment_len_excl_header));
        let absorb_into = backlog.clone();
        let tc = TransmissionControl::new(
            TcParams {
                id: segment.id,
                initiator: false,
                debug: params.debug,
                max_segment_len_excl_header: params.max_segment_len_excl_header,
                max_lifetime: params.max_lifetime,
                send_config: false,
                ..TcParams::default()
            },
            Box::new(input_reader),
            Box::new(io::sink()),
            Some(Arc::new(move |seg: &Segment| {
                absorb_into.absorb(seg.clone());
            })),
        );
        tc.start();

        let conn = ProxyConnection {
            tc: tc.clone(),
            backlog,
            input: Arc::new(Mutex::new(input_writer)),
        };
        self.inner
            .connections
            .lock()
            .insert(segment.id, conn.clone());

        // A failed dial still keeps the stream: it completes its
        // handshake and then promptly drain-closes, which delivers the
        // reset to the initiator instead of silence.
        let dialed = dial(&address, params.dial_timeout);
        let inner = self.inner.clone();
        let id = segment.id;
        thread::Builder::new()
            .name(format!("proxy-{id}"))
            .spawn(move || bridge(inner, id, tc, dialed))
            .expect("spawning the proxy bridge");

        Some(conn)
    }
}

/// Connects to `address`, trying each resolved socket address under the
/// timeout.
fn dial(address: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "address resolved to nothing")
    }))
}

/// Pipes bytes both ways between the stream and the TCP connection,
/// then lingers so the final reset segment survives one more poll.
fn bridge(
    inner: Arc<ProxyInner>,
    id: u16,
    tc: TransmissionControl,
    dialed: io::Result<TcpStream>,
) {
    match dialed {
        Ok(stream) => {
            let tcp_to_stream = {
                let tc = tc.clone();
                let stream = stream.try_clone();
                thread::Builder::new()
                    .name(format!("proxy-{id}-up"))
                    .spawn(move || {
                        if let Ok(stream) = stream {
                            copy_tcp_to_stream(stream, &tc);
                        }
                    })
                    .expect("spawning the upstream bridge half")
            };
            copy_stream_to_tcp(&tc, stream);
            tc.close_after_drained();
            let _ = tcp_to_stream.join();
        }
        Err(err) => {
            warn!(
                id,
                error = &err as &dyn std::error::Error,
                "dial failed, stream will drain close"
            );
            tc.close_after_drained();
        }
    }

    tc.wait_state(StreamState::Closed, Duration::from_secs(60));
    thread::sleep(inner.params.linger);
    inner.connections.lock().remove(&id);
    debug!(id, "proxied stream removed");
}

/// TCP connection to stream, until either side goes away.
fn copy_tcp_to_stream(mut stream: TcpStream, tc: &TransmissionControl) {
    // A short read timeout keeps the loop responsive to stream
    // closure on an otherwise silent connection.
    if stream.set_read_timeout(Some(BRIDGE_POLL)).is_err() {
        return;
    }
    let mut buf = [0; 4096];
    loop {
        if tc.state() >= StreamState::PeerClosed {
            break;
        }
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tc.write(&buf[..n]).is_err() {
                    break;
                }
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => {
                debug!(
                    id = tc.id(),
                    error = &err as &dyn std::error::Error,
                    "destination read failed"
                );
                break;
            }
        }
    }
    tc.close_after_drained();
}

/// Stream to TCP connection, until either side goes away.
fn copy_stream_to_tcp(tc: &TransmissionControl, mut stream: TcpStream) {
    let mut buf = [0; 4096];
    loop {
        match tc.read(&mut buf) {
            Ok(n) => {
                if stream.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
            Err(tunnel_stream::StreamError::Timeout) => continue,
            Err(tunnel_stream::StreamError::Closed) => break,
        }
    }
    let _ = stream.shutdown(std::net::Shutdown::Write);
}
