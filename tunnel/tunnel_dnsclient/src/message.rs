// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Just enough of the DNS wire format (RFC 1035) for the tunnel
//! client: building a CNAME question with an EDNS(0) OPT record, and
//! pulling the first CNAME target out of a response, following
//! compression pointers.

/// Fixed DNS header size.
pub const DNS_HEADER_LEN: usize = 12;

/// UDP payload size advertised in the EDNS(0) OPT record, per current
/// resolver operator guidance.
pub const EDNS_UDP_PAYLOAD: u16 = 1232;

const QTYPE_CNAME: u16 = 5;
const CLASS_IN: u16 = 1;
const TYPE_OPT: u16 = 41;
const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;

/// Compression pointer hops tolerated before a name is declared
/// cyclic.
const MAX_POINTER_HOPS: usize = 16;

fn read_u16(packet: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([
        *packet.get(offset)?,
        *packet.get(offset + 1)?,
    ]))
}

/// Builds a recursion-desired CNAME query for `name` with an EDNS(0)
/// OPT record.
///
/// Every label of `name` must fit the DNS label limit; the tunnel's
/// name encoder stays well under it.
pub fn build_cname_query(transaction_id: u16, name: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(DNS_HEADER_LEN + name.len() + 2 + 4 + 11);
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(&FLAG_RECURSION_DESIRED.to_be_bytes());
    // One question, no answer or authority records, one additional
    // record (the OPT pseudo-RR).
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes());

    for label in name.trim_end_matches('.').split('.') {
        let bytes = label.as_bytes();
        assert!(!bytes.is_empty() && bytes.len() <= 63, "invalid DNS label");
        packet.push(bytes.len() as u8);
        packet.extend_from_slice(bytes);
    }
    packet.push(0);
    packet.extend_from_slice(&QTYPE_CNAME.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());

    // EDNS(0): root name, OPT type, payload size in the class field,
    // zeroed extended flags, empty RDATA.
    packet.push(0);
    packet.extend_from_slice(&TYPE_OPT.to_be_bytes());
    packet.extend_from_slice(&EDNS_UDP_PAYLOAD.to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet
}

/// Extracts the first CNAME target from a response to
/// `transaction_id`, or `None` when the packet is not such a response.
pub fn parse_cname_answer(packet: &[u8], transaction_id: u16) -> Option<String> {
    if read_u16(packet, 0)? != transaction_id {
        return None;
    }
    if read_u16(packet, 2)? & FLAG_RESPONSE == 0 {
        return None;
    }
    let questions = read_u16(packet, 4)?;
    let answers = read_u16(packet, 6)?;

    let mut offset = DNS_HEADER_LEN;
    for _ in 0..questions {
        offset = skip_name(packet, offset)?;
        offset += 4;
    }
    for _ in 0..answers {
        offset = skip_name(packet, offset)?;
        let rr_type = read_u16(packet, offset)?;
        let rdlen = read_u16(packet, offset + 8)? as usize;
        offset += 10;
        packet.get(offset..offset + rdlen)?;
        if rr_type == QTYPE_CNAME {
            return decode_name(packet, offset);
        }
        offset += rdlen;
    }
    None
}

/// Steps over an encoded name, returning the offset just past it.
fn skip_name(packet: &[u8], mut offset: usize) -> Option<usize> {
    loop {
        let len = *packet.get(offset)?;
        match len >> 6 {
            0b00 => {
                if len == 0 {
                    return Some(offset + 1);
                }
                offset += 1 + len as usize;
            }
            // A pointer ends the name.
            0b11 => return Some(offset + 2),
            _ => return None,
        }
    }
}

/// Decodes a possibly-compressed name starting at `offset` into dotted
/// text.
fn decode_name(packet: &[u8], mut offset: usize) -> Option<String> {
    let mut labels: Vec<&str> = Vec::new();
    let mut hops = 0;
    loop {
        let len = *packet.get(offset)? as usize;
        match len >> 6 {
            0b00 => {
                if len == 0 {
                    break;
                }
                let label = packet.get(offset + 1..offset + 1 + len)?;
                labels.push(std::str::from_utf8(label).ok()?);
                offset += 1 + len;
                if labels.len() > 128 {
                    return None;
                }
            }
            0b11 => {
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return None;
                }
                offset = ((len & 0x3f) << 8) | *packet.get(offset + 1)? as usize;
            }
            _ => return None,
        }
    }
    Some(labels.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Uncompressed wire encoding of a dotted name.
    fn encode_name(name: &str) -> Vec<u8> {
        let mut bytes = Vec::new();
        for label in name.split('.') {
            bytes.push(label.len() as u8);
            bytes.extend_from_slice(label.as_bytes());
        }
        bytes.push(0);
        bytes
    }

    /// A minimal response echoing the query's question with one CNAME
    /// answer whose owner name is a pointer to the question.
    fn build_response(query: &[u8], target: &str) -> Vec<u8> {
        let question_len = query.len() - DNS_HEADER_LEN - 11;
        let mut packet = Vec::new();
        packet.extend_from_slice(&query[..2]);
        packet.extend_from_slice(&0x8180u16.to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&0u16.to_be_bytes());
        packet.extend_from_slice(&0u16.to_be_bytes());
        packet.extend_from_slice(&query[DNS_HEADER_LEN..DNS_HEADER_LEN + question_len]);
        // Answer: pointer to the question name at offset 12.
        packet.extend_from_slice(&0xc00cu16.to_be_bytes());
        packet.extend_from_slice(&QTYPE_CNAME.to_be_bytes());
        packet.extend_from_slice(&CLASS_IN.to_be_bytes());
        packet.extend_from_slice(&30u32.to_be_bytes());
        let rdata = encode_name(target);
        packet.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        packet.extend_from_slice(&rdata);
        packet
    }

    #[test]
    fn query_layout() {
        let query = build_cname_query(0x1234, "a.bc.example.com");
        assert_eq!(&query[..2], &[0x12, 0x34]);
        assert_eq!(read_u16(&query, 2), Some(FLAG_RECURSION_DESIRED));
        assert_eq!(read_u16(&query, 4), Some(1));
        assert_eq!(read_u16(&query, 10), Some(1));
        // Question name starts with the first label.
        assert_eq!(query[DNS_HEADER_LEN], 1);
        assert_eq!(query[DNS_HEADER_LEN + 1], b'a');
        // The OPT record sits at the tail with the payload size in its
        // class field.
        let opt = &query[query.len() - 11..];
        assert_eq!(opt[0], 0);
        assert_eq!(read_u16(opt, 1), Some(TYPE_OPT));
        assert_eq!(read_u16(opt, 3), Some(EDNS_UDP_PAYLOAD));
    }

    #[test]
    fn response_round_trip() {
        let query = build_cname_query(7, "q.2T7abc.example.com");
        let response = build_response(&query, "r.9xyz.example.com");
        assert_eq!(
            parse_cname_answer(&response, 7).as_deref(),
            Some("r.9xyz.example.com")
        );
    }

    #[test]
    fn wrong_transaction_id_is_rejected() {
        let query = build_cname_query(7, "q.example.com");
        let response = build_response(&query, "r.example.com");
        assert_eq!(parse_cname_answer(&response, 8), None);
    }

    #[test]
    fn a_query_is_not_an_answer() {
        let query = build_cname_query(7, "q.example.com");
        assert_eq!(parse_cname_answer(&query, 7), None);
    }

    #[test]
    fn compressed_rdata_is_followed() {
        let query = build_cname_query(9, "host.example.com");
        let mut response = build_response(&query, "alias");
        // Splice a pointer to the question's "example.com" suffix onto
        // the target name: rewrite RDATA as "alias" + pointer.
        response.truncate(response.len() - 9);
        let rdata_offset = DNS_HEADER_LEN + 5; // skip "host" label of the question
        let mut rdata = vec![5u8];
        rdata.extend_from_slice(b"alias");
        rdata.extend_from_slice(&(0xc000u16 | rdata_offset as u16).to_be_bytes());
        response.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        response.extend_from_slice(&rdata);
        assert_eq!(
            parse_cname_answer(&response, 9).as_deref(),
            Some("alias.example.com")
        );
    }

    #[test]
    fn pointer_loops_are_bounded() {
        let query = build_cname_query(3, "q.example.com");
        let mut response = build_response(&query, "x");
        // Overwrite the RDATA with a pointer to itself.
        let rdata_at = response.len() - 3;
        response.truncate(rdata_at - 2);
        response.extend_from_slice(&2u16.to_be_bytes());
        response.extend_from_slice(&(0xc000u16 | rdata_at as u16).to_be_bytes());
        assert_eq!(parse_cname_answer(&response, 3), None);
    }

    #[test]
    fn truncated_packets_are_rejected() {
        let query = build_cname_query(5, "q.example.com");
        let response = build_response(&query, "target.example.com");
        for len in [0, 4, DNS_HEADER_LEN, response.len() - 1] {
            assert_eq!(parse_cname_answer(&response[..len], 5), None);
        }
    }
}
