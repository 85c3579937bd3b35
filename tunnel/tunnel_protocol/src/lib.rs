// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! On-the-wire building blocks of the DNS byte-stream tunnel.
//!
//! This crate defines the segment frame exchanged between two
//! transmission controls, the fixed-length handshake configuration the
//! initiator sends inside its first segment, the compressed base-62 DNS
//! name encoding that lets a segment travel as a query name or CNAME
//! target, and the JSON request that tells the responder where to dial.
//!
//! Nothing here performs IO; the stream, proxy and DNS client crates
//! layer behavior on top of these types.

pub mod config;
pub mod name;
pub mod request;
pub mod segment;

pub use config::INITIATOR_CONFIG_LEN;
pub use config::InitiatorConfig;
pub use name::MAX_DNS_NAME_LEN;
pub use name::NameError;
pub use name::optimal_seg_len;
pub use name::segment_from_dns_name;
pub use name::segment_to_dns_name;
pub use request::ProxyRequest;
pub use segment::MAX_SEGMENT_DATA_LEN;
pub use segment::SEGMENT_HEADER_LEN;
pub use segment::Segment;
pub use segment::SegmentFlags;
