// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The initiator (DNS client) side of the tunnel.
//!
//! Glue between a local [`TransmissionControl`] and a recursive
//! resolver: outbound segments become CNAME queries against the
//! responder's apex domain, and the CNAME targets in the answers become
//! inbound segments. See [`TunnelDriver`] for the loop and its
//! adaptive pacing.
//!
//! [`TransmissionControl`]: tunnel_stream::TransmissionControl

pub mod driver;
pub mod message;
pub mod resolver;

pub use driver::DriverParams;
pub use driver::TunnelDriver;
pub use resolver::CnameResolver;
pub use resolver::UdpResolver;
