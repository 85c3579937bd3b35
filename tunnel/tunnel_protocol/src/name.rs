// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Packing segments into DNS names and back.
//!
//! A serialised segment is deflate-compressed, prefixed with a sentinel
//! byte, rendered as the base-62 text of the resulting big-endian
//! integer, and split into labels short enough for a DNS name:
//! `<prefix>.<label>...<apex>`. The reverse path tolerates any garbage
//! by returning the decoder's malformed sentinel segment.

use crate::segment::Segment;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use std::io::Read;
use std::io::Write;
use thiserror::Error;

/// Maximum length of the text representation of a DNS name
/// (RFC 1035 Section 2.3.4).
pub const MAX_DNS_NAME_LEN: usize = 253;

/// Conservative per-label budget, below the DNS limit of 63 bytes.
pub const MAX_LABEL_LEN: usize = 60;

/// First byte of every encoded integer. A fixed non-zero sentinel keeps
/// leading zero bytes of the compressed packet from being lost in the
/// integer round trip.
const LEADING_SENTINEL: u8 = 0x01;

/// Base-62 digits in the order used by Go's `big.Int.Text(62)`, which
/// the wire format inherited.
const BASE62_ALPHABET: &[u8; 62] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Failure to fit a segment into a DNS name.
#[derive(Debug, Error)]
pub enum NameError {
    /// The assembled name does not fit the DNS name budget; the caller
    /// chose a segment length too large for its apex domain.
    #[error("DNS name would be {len} characters, limit {MAX_DNS_NAME_LEN}")]
    NameTooLong {
        /// Length the assembled name would have had.
        len: usize,
    },
}

/// Recommended maximum segment data length for streams tunnelled under
/// `apex`, leaving headroom for compression expansion, the base-62
/// blow-up and the per-label dots.
pub fn optimal_seg_len(apex: &str) -> usize {
    MAX_DNS_NAME_LEN.saturating_sub(3 + apex.len()) * 62 / 100
}

fn compress(packet: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    // Writing to a Vec cannot fail.
    encoder.write_all(packet).unwrap();
    encoder.finish().unwrap()
}

fn decompress(compressed: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut packet = Vec::new();
    DeflateDecoder::new(compressed).read_to_end(&mut packet)?;
    Ok(packet)
}

/// Renders `bytes` as the base-62 text of the big-endian integer they
/// spell. The empty input and the zero integer both render as `"0"`.
fn base62_encode(bytes: &[u8]) -> String {
    let mut digits = Vec::new();
    let mut num: Vec<u8> = bytes.iter().copied().skip_while(|&b| b == 0).collect();
    while !num.is_empty() {
        // Long division of the big-endian byte string by 62.
        let mut rem = 0u32;
        let mut quotient = Vec::with_capacity(num.len());
        for &b in &num {
            let acc = rem * 256 + u32::from(b);
            quotient.push((acc / 62) as u8);
            rem = acc % 62;
        }
        digits.push(BASE62_ALPHABET[rem as usize]);
        let used = quotient.iter().position(|&b| b != 0).unwrap_or(quotient.len());
        quotient.drain(..used);
        num = quotient;
    }
    if digits.is_empty() {
        digits.push(b'0');
    }
    digits.reverse();
    String::from_utf8(digits).unwrap()
}

/// Decodes base-62 text back into big-endian bytes, or `None` on a
/// character outside the alphabet.
fn base62_decode(text: &str) -> Option<Vec<u8>> {
    let mut num: Vec<u8> = Vec::with_capacity(text.len());
    for ch in text.bytes() {
        let digit = match ch {
            b'0'..=b'9' => ch - b'0',
            b'a'..=b'z' => ch - b'a' + 10,
            b'A'..=b'Z' => ch - b'A' + 36,
            _ => return None,
        };
        let mut carry = u32::from(digit);
        for b in num.iter_mut().rev() {
            let acc = u32::from(*b) * 62 + carry;
            *b = (acc & 0xff) as u8;
            carry = acc >> 8;
        }
        while carry > 0 {
            num.insert(0, (carry & 0xff) as u8);
            carry >>= 8;
        }
    }
    Some(num)
}

/// Encodes `seg` into a DNS name `<prefix>.<labels>.<apex>`.
///
/// `prefix` is the responder's single-character routing label; `apex`
/// is the zone whose authoritative server is the responder.
pub fn segment_to_dns_name(seg: &Segment, prefix: char, apex: &str) -> Result<String, NameError> {
    let mut bytes = Vec::with_capacity(seg.packet_len() + 1);
    bytes.push(LEADING_SENTINEL);
    bytes.extend_from_slice(&compress(&seg.to_packet()));
    let encoded = base62_encode(&bytes);

    let mut name = String::with_capacity(encoded.len() + encoded.len() / MAX_LABEL_LEN + apex.len() + 3);
    name.push(prefix);
    for chunk in encoded.as_bytes().chunks(MAX_LABEL_LEN) {
        name.push('.');
        name.push_str(std::str::from_utf8(chunk).unwrap());
    }
    name.push('.');
    name.push_str(apex);
    if name.len() > MAX_DNS_NAME_LEN {
        return Err(NameError::NameTooLong { len: name.len() });
    }
    Ok(name)
}

/// Decodes the segment carried by a DNS `name` whose apex spans the
/// trailing `num_apex_labels` labels.
///
/// Any failure along the way (too few labels, a stray character, a
/// broken integer or deflate stream, a truncated packet) yields the
/// malformed sentinel; `max_data_len` bounds the decoded segment the
/// same way [`Segment::from_packet`] does.
pub fn segment_from_dns_name(name: &str, num_apex_labels: usize, max_data_len: usize) -> Segment {
    let name = name.strip_suffix('.').unwrap_or(name);
    let labels: Vec<&str> = name.split('.').collect();
    // One prefix label, at least one payload label, then the apex.
    if labels.len() < 2 + num_apex_labels {
        return Segment::malformed(format!(
            "name has {} labels, need at least {}",
            labels.len(),
            2 + num_apex_labels
        ));
    }
    let encoded: String = labels[1..labels.len() - num_apex_labels].concat();
    let Some(bytes) = base62_decode(&encoded) else {
        return Segment::malformed("name carries a character outside the base-62 alphabet");
    };
    match bytes.split_first() {
        Some((&LEADING_SENTINEL, compressed)) => match decompress(compressed) {
            Ok(packet) => Segment::from_packet(&packet, max_data_len),
            Err(err) => Segment::malformed(format!("inflate failed: {err}")),
        },
        _ => Segment::malformed("encoded integer lacks the leading sentinel byte"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::MAX_SEGMENT_DATA_LEN;
    use crate::segment::SegmentFlags;

    #[test]
    fn base62_vectors() {
        assert_eq!(base62_encode(&[]), "0");
        assert_eq!(base62_encode(&[0]), "0");
        assert_eq!(base62_encode(&[61]), "Z");
        assert_eq!(base62_encode(&[62]), "10");
        assert_eq!(base62_encode(&[1, 0]), "48");
        assert_eq!(base62_decode("10"), Some(vec![62]));
        assert_eq!(base62_decode("48"), Some(vec![1, 0]));
        assert_eq!(base62_decode("4!8"), None);
    }

    #[test]
    fn base62_round_trip_preserves_sentinel_prefixed_bytes() {
        let mut bytes = vec![LEADING_SENTINEL, 0, 0, 7];
        bytes.extend_from_slice(&[0xff; 40]);
        let decoded = base62_decode(&base62_encode(&bytes)).unwrap();
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn deflate_round_trip() {
        let data: Vec<u8> = (0..200u16).map(|v| (v % 251) as u8).collect();
        assert_eq!(decompress(&compress(&data)).unwrap(), data);
    }

    #[test]
    fn dns_name_round_trip() {
        let mut data = vec![0; 100];
        getrandom::fill(&mut data).unwrap();
        let seg = Segment {
            id: 12345,
            flags: SegmentFlags::new()
                .with_handshake_syn(true)
                .with_handshake_ack(true),
            seq_num: 23456,
            ack_num: 34567,
            reserved: 0,
            data,
        };
        let name = segment_to_dns_name(&seg, 'p', "example.com").unwrap();
        assert!(name.len() <= MAX_DNS_NAME_LEN);
        assert!(name.starts_with("p."));
        assert!(name.ends_with(".example.com"));
        for label in name.split('.') {
            assert!(label.len() <= MAX_LABEL_LEN);
        }
        let back = segment_from_dns_name(&name, 2, MAX_SEGMENT_DATA_LEN);
        assert_eq!(back, seg);
    }

    #[test]
    fn trailing_dot_is_accepted() {
        let seg = Segment {
            id: 7,
            data: b"hello".to_vec(),
            ..Segment::default()
        };
        let name = segment_to_dns_name(&seg, 't', "example.com").unwrap();
        let back = segment_from_dns_name(&format!("{name}."), 2, MAX_SEGMENT_DATA_LEN);
        assert_eq!(back, seg);
    }

    #[test]
    fn oversized_segment_does_not_fit() {
        // Random data does not compress, so 4 KiB can never fit the
        // name budget.
        let mut data = vec![0; 4096];
        getrandom::fill(&mut data).unwrap();
        let seg = Segment {
            data,
            ..Segment::default()
        };
        assert!(matches!(
            segment_to_dns_name(&seg, 't', "a-rather-long-tunnel-apex.example.com"),
            Err(NameError::NameTooLong { .. })
        ));
    }

    #[test]
    fn garbage_names_decode_to_malformed() {
        for name in [
            "",
            "t.example.com",
            "t.!!!.example.com",
            "t.0.example.com",
            "t.2T7.example.com",
        ] {
            assert!(
                segment_from_dns_name(name, 2, MAX_SEGMENT_DATA_LEN).is_malformed(),
                "{name:?} should be malformed"
            );
        }
    }

    #[test]
    fn optimal_seg_len_fits_the_budget() {
        for apex in ["a.io", "example.com", "tunnel.example.com", &"x".repeat(250)] {
            let len = optimal_seg_len(apex);
            // A worst-case packet of that size still leaves the name
            // within budget: header + data, sentinel byte, base-62
            // expansion of ~1.35x, label dots.
            assert!(len + apex.len() <= MAX_DNS_NAME_LEN, "apex {apex:?}");
        }
        assert_eq!(optimal_seg_len(&"x".repeat(250)), 0);
    }

    #[test]
    fn optimal_payload_round_trips_under_budget() {
        let apex = "tunnel.example.com";
        let mut data = vec![0; optimal_seg_len(apex)];
        getrandom::fill(&mut data).unwrap();
        let seg = Segment {
            id: 1,
            seq_num: 9000,
            ack_num: 8000,
            data,
            ..Segment::default()
        };
        let name = segment_to_dns_name(&seg, 't', apex).unwrap();
        assert!(name.len() <= MAX_DNS_NAME_LEN);
        assert_eq!(segment_from_dns_name(&name, 3, MAX_SEGMENT_DATA_LEN), seg);
    }
}
