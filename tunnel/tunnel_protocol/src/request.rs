// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The dial request an initiator appends (as JSON) after the
//! configuration frame in its first handshake segment.

use serde::Deserialize;
use serde::Serialize;

/// Destination the responder proxy should connect to on behalf of the
/// initiator.
///
/// Keys are kept to one character because the request travels inside a
/// DNS name with a tight byte budget.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProxyRequest {
    /// Network to dial on. Empty means TCP to `address:port`; anything
    /// else is used verbatim together with `address`.
    #[serde(rename = "n", default, skip_serializing_if = "String::is_empty")]
    pub network: String,
    /// Destination port, used only when `network` is empty.
    #[serde(rename = "p", default, skip_serializing_if = "is_zero")]
    pub port: u16,
    /// Destination host, or a full `host:port` when `network` is set.
    #[serde(rename = "a")]
    pub address: String,
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

impl ProxyRequest {
    /// The `(network, address)` pair to dial.
    pub fn destination(&self) -> (&str, String) {
        if self.network.is_empty() {
            ("tcp", format!("{}:{}", self.address, self.port))
        } else {
            (self.network.as_str(), self.address.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_network_dials_tcp() {
        let req: ProxyRequest = serde_json::from_str(r#"{"p": 443, "a": "example.com"}"#).unwrap();
        assert_eq!(req.destination(), ("tcp", "example.com:443".to_string()));
    }

    #[test]
    fn explicit_network_uses_address_verbatim() {
        let req: ProxyRequest =
            serde_json::from_str(r#"{"n": "tcp4", "a": "example.com:80"}"#).unwrap();
        assert_eq!(req.destination(), ("tcp4", "example.com:80".to_string()));
    }

    #[test]
    fn json_round_trip_is_compact() {
        let req = ProxyRequest {
            network: String::new(),
            port: 22,
            address: "10.0.0.1".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"p":22,"a":"10.0.0.1"}"#);
        assert_eq!(serde_json::from_str::<ProxyRequest>(&json).unwrap(), req);
    }
}
