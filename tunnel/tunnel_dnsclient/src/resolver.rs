// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The recursive-resolver seam.
//!
//! The tunnel driver only ever needs one operation: send a name, get
//! back the CNAME target the authoritative (responder) side answered
//! with. [`CnameResolver`] is that seam; [`UdpResolver`] is the real
//! implementation speaking RFC 1035 over UDP to a recursive resolver,
//! and tests substitute an in-process one.

use crate::message::build_cname_query;
use crate::message::parse_cname_answer;
use std::io;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::net::UdpSocket;
use std::time::Duration;
use std::time::Instant;
use tracing::trace;

/// Issues one CNAME lookup and returns the target name, `Ok(None)` on
/// a response that carries no CNAME, or an error when the query could
/// not be exchanged at all.
pub trait CnameResolver: Send {
    /// Resolves `name` to its CNAME target.
    fn query(&mut self, name: &str) -> io::Result<Option<String>>;
}

/// A plain UDP DNS client for a single recursive resolver.
pub struct UdpResolver {
    server: SocketAddr,
    timeout: Duration,
}

impl UdpResolver {
    /// Creates a resolver client for `server`. A zero `timeout`
    /// defaults to 3 seconds.
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            Duration::from_secs(3)
        } else {
            timeout
        };
        Self { server, timeout }
    }

    /// Creates a client for the first nameserver in
    /// `/etc/resolv.conf`.
    #[cfg(unix)]
    pub fn system(timeout: Duration) -> io::Result<Self> {
        let contents = std::fs::read("/etc/resolv.conf")?;
        let config = resolv_conf::Config::parse(&contents).map_err(io::Error::other)?;
        let nameserver = config
            .nameservers
            .first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "resolv.conf lists no nameserver"))?;
        let ip = match nameserver {
            resolv_conf::ScopedIp::V4(ip) => std::net::IpAddr::V4(*ip),
            resolv_conf::ScopedIp::V6(ip, _) => std::net::IpAddr::V6(*ip),
        };
        Ok(Self::new(SocketAddr::new(ip, 53), timeout))
    }
}

impl CnameResolver for UdpResolver {
    fn query(&mut self, name: &str) -> io::Result<Option<String>> {
        let bind_addr: SocketAddr = match self.server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr)?;

        let mut id_bytes = [0; 2];
        if getrandom::fill(&mut id_bytes).is_err() {
            return Err(io::Error::other("no entropy for a transaction id"));
        }
        let transaction_id = u16::from_be_bytes(id_bytes);

        let query = build_cname_query(transaction_id, name);
        socket.send_to(&query, self.server)?;
        trace!(name, server = %self.server, "query sent");

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0; 4096];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(io::ErrorKind::TimedOut.into());
            }
            socket.set_read_timeout(Some(deadline - now))?;
            let (n, _) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(err) => return Err(err),
            };
            let packet = &buf[..n];
            // Any datagram with our transaction ID is the response;
            // whether it contains a usable CNAME is the caller's
            // problem. Anything else is a stray and we keep waiting.
            if n >= 2 && u16::from_be_bytes([packet[0], packet[1]]) == transaction_id {
                return Ok(parse_cname_answer(packet, transaction_id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// A one-shot fake DNS server that answers every query with a
    /// CNAME pointing at `target`.
    fn fake_dns_server(target: &'static str) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        thread::spawn(move || {
            let mut buf = [0; 4096];
            let Ok((n, from)) = socket.recv_from(&mut buf) else {
                return;
            };
            let query = &buf[..n];
            // Echo header and question, flip the response bit, attach
            // one CNAME answer pointing at the question name.
            let mut response = Vec::new();
            response.extend_from_slice(&query[..2]);
            response.extend_from_slice(&0x8180u16.to_be_bytes());
            response.extend_from_slice(&1u16.to_be_bytes());
            response.extend_from_slice(&1u16.to_be_bytes());
            response.extend_from_slice(&0u32.to_be_bytes());
            // Question section ends 11 bytes before the EDNS OPT tail.
            response.extend_from_slice(&query[12..n - 11]);
            response.extend_from_slice(&0xc00cu16.to_be_bytes());
            response.extend_from_slice(&5u16.to_be_bytes());
            response.extend_from_slice(&1u16.to_be_bytes());
            response.extend_from_slice(&30u32.to_be_bytes());
            let mut rdata = Vec::new();
            for label in target.split('.') {
                rdata.push(label.len() as u8);
                rdata.extend_from_slice(label.as_bytes());
            }
            rdata.push(0);
            response.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            response.extend_from_slice(&rdata);
            socket.send_to(&response, from).unwrap();
        });
        addr
    }

    #[test]
    fn udp_resolver_round_trip() {
        let server = fake_dns_server("reply.label.example.com");
        let mut resolver = UdpResolver::new(server, Duration::from_secs(5));
        let answer = resolver.query("query.example.com").unwrap();
        assert_eq!(answer.as_deref(), Some("reply.label.example.com"));
    }

    #[test]
    fn unanswered_query_times_out() {
        // A bound socket nobody serves.
        let dead = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut resolver = UdpResolver::new(dead.local_addr().unwrap(), Duration::from_millis(100));
        let err = resolver.query("query.example.com").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
