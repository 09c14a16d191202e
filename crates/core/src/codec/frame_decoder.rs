use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::ensure;
use crate::protocol::{HeaderSet, ParseError};

/// Upper bound on the ASCII length prefix. A ten-digit length already allows
/// blocks far beyond any sane header limit.
const MAX_LENGTH_DIGITS: usize = 10;

const DEFAULT_MAX_SIZE: usize = 128 * 1024;

/// Decoder for the netstring-framed request header block:
/// `<length>:<key\0value\0...>,` with an ASCII decimal length covering only
/// the payload between `:` and `,`.
///
/// Yields a [`HeaderSet`] once the full block is buffered. The size limit is
/// checked as soon as the length prefix is readable, so an oversized block
/// is rejected without buffering it.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_size: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { max_size: DEFAULT_MAX_SIZE }
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameDecoder {
    type Item = HeaderSet;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let colon = match src.iter().position(|&b| b == b':') {
            Some(position) => position,
            None => {
                ensure!(
                    src.iter().all(u8::is_ascii_digit),
                    ParseError::malformed("length prefix contains a non-digit")
                );
                ensure!(
                    src.len() <= MAX_LENGTH_DIGITS,
                    ParseError::malformed("length prefix is too long")
                );
                return Ok(None);
            }
        };

        ensure!(colon > 0, ParseError::malformed("empty length prefix"));
        ensure!(colon <= MAX_LENGTH_DIGITS, ParseError::malformed("length prefix is too long"));
        let digits = &src[..colon];
        ensure!(
            digits.iter().all(u8::is_ascii_digit),
            ParseError::malformed("length prefix contains a non-digit")
        );

        // The digits are ASCII by construction.
        let length: usize = std::str::from_utf8(digits)
            .map_err(|_| ParseError::malformed("length prefix is not valid UTF-8"))?
            .parse()
            .map_err(|_| ParseError::malformed("length prefix out of range"))?;
        ensure!(length <= self.max_size, ParseError::limit_reached(self.max_size));

        let total = colon + 1 + length + 1;
        if src.len() < total {
            return Ok(None);
        }

        let block = src.split_to(total).freeze();
        ensure!(
            block[total - 1] == b',',
            ParseError::malformed("missing netstring terminator")
        );

        let payload = block.slice(colon + 1..total - 1);
        let map = parse_pairs(&payload)?;
        Ok(Some(HeaderSet::new(map, payload)))
    }
}

fn parse_pairs(payload: &Bytes) -> Result<BTreeMap<String, Bytes>, ParseError> {
    let mut map = BTreeMap::new();
    let mut offset = 0;

    while offset < payload.len() {
        let key_len = payload[offset..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ParseError::malformed("unterminated header name"))?;
        ensure!(key_len > 0, ParseError::malformed("empty header name"));
        let key = std::str::from_utf8(&payload[offset..offset + key_len])
            .map_err(|_| ParseError::malformed("header name is not valid UTF-8"))?
            .to_string();
        offset += key_len + 1;

        let value_len = payload[offset..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ParseError::malformed("unterminated header value"))?;
        let value = payload.slice(offset..offset + value_len);
        offset += value_len + 1;

        map.insert(key, value);
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pairs: &[(&str, &str)]) -> BytesMut {
        let mut payload = Vec::new();
        for (key, value) in pairs {
            payload.extend_from_slice(key.as_bytes());
            payload.push(0);
            payload.extend_from_slice(value.as_bytes());
            payload.push(0);
        }
        let mut out = BytesMut::new();
        out.extend_from_slice(format!("{}:", payload.len()).as_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(b",");
        out
    }

    #[test]
    fn decodes_a_complete_block() {
        let mut src = frame(&[("REQUEST_METHOD", "GET"), ("PATH_INFO", "/")]);
        src.extend_from_slice(b"body bytes");

        let headers = FrameDecoder::new().decode(&mut src).unwrap().unwrap();
        assert_eq!(headers.get("REQUEST_METHOD"), Some(&b"GET"[..]));
        assert_eq!(headers.get("PATH_INFO"), Some(&b"/"[..]));
        assert_eq!(headers.len(), 2);
        assert_eq!(&src[..], b"body bytes");
    }

    #[test]
    fn needs_more_data_until_the_terminator() {
        let full = frame(&[("REQUEST_METHOD", "GET")]);
        let mut decoder = FrameDecoder::new();

        let mut src = BytesMut::new();
        for &byte in full[..full.len() - 1].iter() {
            src.extend_from_slice(&[byte]);
            assert!(decoder.decode(&mut src).unwrap().is_none());
        }

        src.extend_from_slice(&full[full.len() - 1..]);
        let headers = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(headers.get("REQUEST_METHOD"), Some(&b"GET"[..]));
    }

    #[test]
    fn empty_block_yields_empty_set() {
        let mut src = BytesMut::from(&b"0:,"[..]);
        let headers = FrameDecoder::new().decode(&mut src).unwrap().unwrap();
        assert!(headers.is_empty());
    }

    #[test]
    fn rejects_non_numeric_length() {
        let mut src = BytesMut::from(&b"abc:xyz,"[..]);
        let result = FrameDecoder::new().decode(&mut src);
        assert!(matches!(result, Err(ParseError::Malformed { .. })));
    }

    #[test]
    fn rejects_missing_terminator() {
        let mut src = BytesMut::from(&b"4:a\0b\0;"[..]);
        let result = FrameDecoder::new().decode(&mut src);
        assert!(matches!(result, Err(ParseError::Malformed { .. })));
    }

    #[test]
    fn rejects_unterminated_value() {
        let mut src = BytesMut::from(&b"4:a\0bc,"[..]);
        let result = FrameDecoder::new().decode(&mut src);
        assert!(matches!(result, Err(ParseError::Malformed { .. })));
    }

    #[test]
    fn enforces_the_size_limit_from_the_prefix_alone() {
        let mut src = BytesMut::from(&b"99999:"[..]);
        let result = FrameDecoder::with_max_size(1024).decode(&mut src);
        assert!(matches!(result, Err(ParseError::LimitReached { max: 1024 })));
    }

    #[test]
    fn raw_payload_is_preserved_for_forwarding() {
        let mut src = frame(&[("A", "1"), ("B", "2")]);
        let headers = FrameDecoder::new().decode(&mut src).unwrap().unwrap();
        assert_eq!(headers.header_data().as_ref(), b"A\x001\x00B\x002\x00");
    }
}
