// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reliable, ordered, duplex byte streams over lossy segment
//! transports.
//!
//! The centerpiece is [`TransmissionControl`], a stream protocol with a
//! sliding window, retransmission, keep-alive and delayed
//! acknowledgement, designed for carriers where every segment is
//! expensive and slow (one DNS query and response per segment). Around
//! it sit the [`SegmentBuffer`] that coalesces outbound segments while
//! they wait for such a carrier, and the in-memory [`pipe`](pipe::pipe)
//! used to connect a stream to its transport.

pub mod buffer;
pub mod pipe;
pub mod tc;
pub mod timing;

pub use buffer::SegmentBuffer;
pub use pipe::InputTransport;
pub use pipe::PipeReader;
pub use pipe::PipeWriter;
pub use tc::OutputSegmentCallback;
pub use tc::StreamError;
pub use tc::StreamState;
pub use tc::TcParams;
pub use tc::TransmissionControl;
pub use timing::LiveTiming;
pub use timing::StreamTiming;
