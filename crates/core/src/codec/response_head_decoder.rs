use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::ensure;
use crate::protocol::ParseError;

const DEFAULT_MAX_SIZE: usize = 128 * 1024;

/// Buffers the application's response until the end of the CGI-style header
/// block (`\r\n\r\n`). Yields the complete block, terminator included; the
/// first body bytes remain in the source buffer.
#[derive(Debug, Clone)]
pub struct ResponseHeadDecoder {
    max_size: usize,
    // Bytes already scanned for the terminator, so each feed only rescans
    // the 3-byte overlap at the chunk boundary.
    scanned: usize,
}

impl ResponseHeadDecoder {
    pub fn new() -> Self {
        Self { max_size: DEFAULT_MAX_SIZE, scanned: 0 }
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size, scanned: 0 }
    }
}

impl Default for ResponseHeadDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ResponseHeadDecoder {
    type Item = Bytes;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let start = self.scanned.saturating_sub(3);
        if let Some(position) = src[start..].windows(4).position(|window| window == b"\r\n\r\n") {
            let end = start + position + 4;
            self.scanned = 0;
            return Ok(Some(src.split_to(end).freeze()));
        }

        self.scanned = src.len();
        ensure!(
            src.len() <= self.max_size,
            ParseError::response_head_too_large(src.len(), self.max_size)
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_header_from_body() {
        let mut src = BytesMut::from(&b"Status: 200 OK\r\nContent-Type: text/plain\r\n\r\nhi"[..]);
        let head = ResponseHeadDecoder::new().decode(&mut src).unwrap().unwrap();

        assert_eq!(head.as_ref(), b"Status: 200 OK\r\nContent-Type: text/plain\r\n\r\n");
        assert_eq!(&src[..], b"hi");
    }

    #[test]
    fn terminator_split_across_feeds() {
        let mut decoder = ResponseHeadDecoder::new();
        let mut src = BytesMut::from(&b"Status: 200 OK\r\n\r"[..]);

        assert!(decoder.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(b"\nrest");
        let head = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(head.as_ref(), b"Status: 200 OK\r\n\r\n");
        assert_eq!(&src[..], b"rest");
    }

    #[test]
    fn oversized_header_is_an_error() {
        let mut decoder = ResponseHeadDecoder::with_max_size(16);
        let mut src = BytesMut::from(&b"Status: 200 OK but it never ends"[..]);

        let result = decoder.decode(&mut src);
        assert!(matches!(result, Err(ParseError::ResponseHeadTooLarge { .. })));
    }
}
