//! Rewriting of the application's CGI-style response header.
//!
//! The application answers with a `Status:` header instead of an HTTP status
//! line. Before the response is forwarded to the client the core makes sure
//! the `Status:` value carries a reason phrase, optionally prepends a real
//! `HTTP/1.1` status line and always prepends an `X-Powered-By` header.

use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::{status_with_reason, ClientError};

/// Location of one `Key: value\r\n` line inside a response-header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRef {
    pub key_start: usize,
    pub value: Range<usize>,
}

impl HeaderRef {
    /// Span of the whole line, terminating `\r\n` included.
    pub fn line(&self) -> Range<usize> {
        self.key_start..self.value.end + 2
    }
}

/// Finds a header by name, case-sensitively, anchored at the start of a line.
pub fn lookup_header(head: &[u8], name: &[u8]) -> Option<HeaderRef> {
    let mut search = 0;
    while search + name.len() < head.len() {
        let pos = head[search..].windows(name.len()).position(|window| window == name)? + search;
        if (pos == 0 || head[pos - 1] == b'\n')
            && head.len() > pos + name.len()
            && head[pos + name.len()] == b':'
        {
            let value = extract_header_value(head, pos + name.len() + 1);
            return Some(HeaderRef { key_start: pos, value });
        }
        search = pos + name.len() + 1;
    }
    None
}

/// Given the offset just past a header's `:`, returns the span of the value
/// with leading spaces skipped, up to (not including) the terminating `\r`.
fn extract_header_value(head: &[u8], after_colon: usize) -> Range<usize> {
    let mut start = after_colon;
    while start < head.len() && head[start] == b' ' {
        start += 1;
    }
    match head[start..].iter().position(|&b| b == b'\r') {
        Some(offset) => start..start + offset,
        None => start..start,
    }
}

/// The outcome of rewriting a response header block.
#[derive(Debug, Clone)]
pub struct RewrittenHead {
    /// Bytes to send before the header block. Never empty: it carries at
    /// least the `X-Powered-By` header.
    pub prefix: Bytes,
    /// The modified header block, or `None` when the original block can be
    /// forwarded unchanged.
    pub header: Option<Bytes>,
}

/// Rewrites a complete response-header block (terminator included).
///
/// The `Status` header is mandatory; a bare numeric status value gets a
/// reason phrase from the status table (`"<code> Unknown Reason-Phrase"` for
/// codes outside it). `print_status_line` controls the `HTTP/1.1` prefix
/// line; `identity` becomes the `X-Powered-By` value.
pub fn rewrite_response_head(
    head: &[u8],
    print_status_line: bool,
    identity: &str,
) -> Result<RewrittenHead, ClientError> {
    let status = lookup_header(head, b"Status").ok_or(ClientError::MissingStatusHeader)?;
    let value = &head[status.value.clone()];

    let mut new_header = None;
    let mut status_value = Bytes::copy_from_slice(value);

    if !value.contains(&b' ') {
        // No reason phrase; synthesize one and replace the line in place.
        let code = std::str::from_utf8(value)
            .ok()
            .and_then(|text| text.parse::<u16>().ok())
            .unwrap_or(0);
        let full = match status_with_reason(code) {
            Some(known) => known.to_string(),
            None => format!("{code} Unknown Reason-Phrase"),
        };

        let line = status.line();
        let mut rebuilt = BytesMut::with_capacity(head.len() + full.len());
        rebuilt.put_slice(&head[..status.key_start]);
        rebuilt.put_slice(b"Status: ");
        rebuilt.put_slice(full.as_bytes());
        rebuilt.put_slice(b"\r\n");
        rebuilt.put_slice(&head[line.end.min(head.len())..]);
        new_header = Some(rebuilt.freeze());
        status_value = Bytes::from(full.into_bytes());
    }

    let mut prefix = BytesMut::with_capacity(64 + identity.len());
    if print_status_line {
        prefix.put_slice(b"HTTP/1.1 ");
        prefix.put_slice(&status_value);
        prefix.put_slice(b"\r\n");
    }
    prefix.put_slice(b"X-Powered-By: ");
    prefix.put_slice(identity.as_bytes());
    prefix.put_slice(b"\r\n");

    Ok(RewrittenHead { prefix: prefix.freeze(), header: new_header })
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITY: &str = "Vestibule/0.1.0";

    #[test]
    fn lookup_is_anchored_at_line_starts() {
        let head = b"X-Status: nope\r\nStatus: 200 OK\r\n\r\n";
        let found = lookup_header(head, b"Status").unwrap();
        assert_eq!(&head[found.value.clone()], b"200 OK");
        assert_eq!(found.key_start, 16);
    }

    #[test]
    fn lookup_skips_value_spaces() {
        let head = b"Status:   204 No Content\r\n\r\n";
        let found = lookup_header(head, b"Status").unwrap();
        assert_eq!(&head[found.value.clone()], b"204 No Content");
    }

    #[test]
    fn lookup_misses_absent_header() {
        assert!(lookup_header(b"Content-Type: text/html\r\n\r\n", b"Status").is_none());
    }

    #[test]
    fn synthesizes_reason_phrase() {
        let head = b"Status: 200\r\nContent-Type: text/plain\r\n\r\n";
        let rewritten = rewrite_response_head(head, true, IDENTITY).unwrap();

        assert_eq!(
            rewritten.header.as_deref(),
            Some(&b"Status: 200 OK\r\nContent-Type: text/plain\r\n\r\n"[..])
        );
        assert_eq!(
            rewritten.prefix.as_ref(),
            b"HTTP/1.1 200 OK\r\nX-Powered-By: Vestibule/0.1.0\r\n"
        );
    }

    #[test]
    fn existing_reason_phrase_is_left_alone() {
        let head = b"Status: 200 OK\r\nContent-Type: text/plain\r\n\r\n";
        let rewritten = rewrite_response_head(head, true, IDENTITY).unwrap();

        assert!(rewritten.header.is_none());
        assert_eq!(
            rewritten.prefix.as_ref(),
            b"HTTP/1.1 200 OK\r\nX-Powered-By: Vestibule/0.1.0\r\n"
        );
    }

    #[test]
    fn unknown_code_gets_placeholder_phrase() {
        let head = b"Status: 299\r\n\r\n";
        let rewritten = rewrite_response_head(head, false, IDENTITY).unwrap();

        assert_eq!(rewritten.header.as_deref(), Some(&b"Status: 299 Unknown Reason-Phrase\r\n\r\n"[..]));
        assert_eq!(rewritten.prefix.as_ref(), b"X-Powered-By: Vestibule/0.1.0\r\n");
    }

    #[test]
    fn missing_status_is_an_error() {
        let result = rewrite_response_head(b"Content-Type: text/html\r\n\r\n", true, IDENTITY);
        assert!(matches!(result, Err(ClientError::MissingStatusHeader)));
    }

    #[test]
    fn rewrite_is_idempotent_on_its_own_output() {
        let head = b"Status: 404\r\n\r\n";
        let first = rewrite_response_head(head, false, IDENTITY).unwrap();
        let once = first.header.unwrap();

        let second = rewrite_response_head(&once, false, IDENTITY).unwrap();
        assert!(second.header.is_none());
    }
}
