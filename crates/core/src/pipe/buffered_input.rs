use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8 * 1024;

/// Chunked reader over one half of a non-blocking socket.
///
/// An empty chunk means EOF; `ECONNRESET` is reported as EOF because the
/// peer vanishing mid-stream is handled the same way as it closing cleanly.
/// A consumer that only needs a prefix of a chunk pushes the tail back with
/// [`BufferedInput::unconsume`]; the tail is delivered again before any new
/// read. Backpressure is expressed by simply not asking for the next chunk.
pub struct BufferedInput<R> {
    reader: R,
    carry: Option<Bytes>,
    eof: bool,
}

impl<R> BufferedInput<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self { reader, carry: None, eof: false }
    }

    /// Reads the next chunk. Returns an empty chunk on EOF (and keeps
    /// returning it afterwards).
    pub async fn next_chunk(&mut self) -> io::Result<Bytes> {
        if let Some(carry) = self.carry.take() {
            return Ok(carry);
        }
        if self.eof {
            return Ok(Bytes::new());
        }

        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        match self.reader.read_buf(&mut buf).await {
            Ok(0) => {
                self.eof = true;
                Ok(Bytes::new())
            }
            Ok(_) => Ok(buf.freeze()),
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                self.eof = true;
                Ok(Bytes::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Pushes an unconsumed tail back; it precedes anything read later.
    pub fn unconsume(&mut self, tail: Bytes) {
        if tail.is_empty() {
            return;
        }
        self.carry = Some(match self.carry.take() {
            None => tail,
            Some(existing) => {
                let mut merged = BytesMut::with_capacity(tail.len() + existing.len());
                merged.extend_from_slice(&tail);
                merged.extend_from_slice(&existing);
                merged.freeze()
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncWriteExt, ReadBuf};

    #[tokio::test]
    async fn delivers_chunks_then_eof() {
        let (mut tx, rx) = duplex(64);
        let mut input = BufferedInput::new(rx);

        tx.write_all(b"hello").await.unwrap();
        assert_eq!(input.next_chunk().await.unwrap().as_ref(), b"hello");

        drop(tx);
        assert!(input.next_chunk().await.unwrap().is_empty());
        assert!(input.next_chunk().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unconsumed_tail_comes_back_first() {
        let (mut tx, rx) = duplex(64);
        let mut input = BufferedInput::new(rx);

        tx.write_all(b"headerbody").await.unwrap();
        let chunk = input.next_chunk().await.unwrap();
        input.unconsume(chunk.slice(6..));

        assert_eq!(input.next_chunk().await.unwrap().as_ref(), b"body");
    }

    struct ResetReader;

    impl AsyncRead for ResetReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }
    }

    #[tokio::test]
    async fn connection_reset_reads_as_eof() {
        let mut input = BufferedInput::new(ResetReader);
        assert!(input.next_chunk().await.unwrap().is_empty());
    }
}
