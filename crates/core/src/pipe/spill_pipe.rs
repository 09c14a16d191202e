use std::collections::VecDeque;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tracing::trace;

/// Default in-memory window before writes overflow to disk.
pub const DEFAULT_MEMORY_THRESHOLD: usize = 128 * 1024;

const FILE_READ_CHUNK: usize = 16 * 1024;

static SPILL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Creates a spill pipe: a FIFO byte pipe that keeps up to `threshold` bytes
/// in memory and overflows the rest into an anonymous temp file under
/// `spool_dir`.
///
/// The writer half reports whether a write was absorbed in memory (`true`)
/// or had to spill (`false`); the disk append is awaited before `write`
/// returns, so a `false` result means the bytes are already committed. The
/// drain half delivers bytes strictly in write order across the memory/disk
/// boundary and yields `None` once the pipe is ended and empty. Pausing the
/// drain is simply not polling it.
pub fn spill_pipe(threshold: usize, spool_dir: impl Into<PathBuf>) -> (SpillWriter, SpillDrain) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            mem: VecDeque::new(),
            mem_bytes: 0,
            threshold,
            spool_dir: spool_dir.into(),
            file: None,
            ended: false,
        }),
        readable: Notify::new(),
        writer_gone: AtomicBool::new(false),
    });
    (SpillWriter { shared: shared.clone() }, SpillDrain { shared })
}

struct Shared {
    inner: Mutex<Inner>,
    readable: Notify,
    writer_gone: AtomicBool,
}

struct Inner {
    mem: VecDeque<Bytes>,
    mem_bytes: usize,
    threshold: usize,
    spool_dir: PathBuf,
    file: Option<SpillFile>,
    ended: bool,
}

struct SpillFile {
    file: File,
    read_pos: u64,
    write_pos: u64,
}

impl SpillFile {
    fn unread(&self) -> u64 {
        self.write_pos - self.read_pos
    }

    async fn create(spool_dir: &Path) -> io::Result<Self> {
        let name = format!("spill.{}.{}", process::id(), SPILL_SEQ.fetch_add(1, Ordering::Relaxed));
        let path = spool_dir.join(name);
        let file =
            OpenOptions::new().create_new(true).read(true).write(true).open(&path).await?;
        // Unlink right away; the data only needs to outlive this handle.
        fs::remove_file(&path).await?;
        trace!(path = %path.display(), "opened spill file");
        Ok(Self { file, read_pos: 0, write_pos: 0 })
    }
}

impl Inner {
    // Every file operation seeks to an explicitly tracked position first, so
    // a drain future dropped mid-read cannot corrupt the cursor.
    async fn append_to_file(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.file.is_none() {
            self.file = Some(SpillFile::create(&self.spool_dir).await?);
        }
        // Safe: ensured right above.
        let spill = self.file.as_mut().unwrap();
        spill.file.seek(SeekFrom::Start(spill.write_pos)).await?;
        spill.file.write_all(chunk).await?;
        spill.write_pos += chunk.len() as u64;
        Ok(())
    }

    async fn pop_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if let Some(chunk) = self.mem.pop_front() {
            self.mem_bytes -= chunk.len();
            return Ok(Some(chunk));
        }

        if let Some(spill) = self.file.as_mut() {
            let unread = spill.unread();
            if unread == 0 {
                self.file = None;
                return Ok(None);
            }
            let len = unread.min(FILE_READ_CHUNK as u64) as usize;
            let mut buf = BytesMut::zeroed(len);
            spill.file.seek(SeekFrom::Start(spill.read_pos)).await?;
            spill.file.read_exact(&mut buf).await?;
            spill.read_pos += len as u64;
            if spill.unread() == 0 {
                // Disk tail fully drained; back to the in-memory window.
                self.file = None;
            }
            return Ok(Some(buf.freeze()));
        }

        Ok(None)
    }
}

/// Write half of a spill pipe.
pub struct SpillWriter {
    shared: Arc<Shared>,
}

impl SpillWriter {
    /// Appends a chunk. Returns `true` when it was absorbed in memory,
    /// `false` when it went to disk (the append has completed either way).
    pub async fn write(&self, chunk: Bytes) -> io::Result<bool> {
        if chunk.is_empty() {
            return Ok(true);
        }
        let mut inner = self.shared.inner.lock().await;
        debug_assert!(!inner.ended, "write after end");

        // Once a disk tail exists, everything must go behind it to keep FIFO
        // order; otherwise memory takes the chunk if it fits the window.
        let in_memory =
            inner.file.is_none() && inner.mem_bytes + chunk.len() <= inner.threshold;
        if in_memory {
            inner.mem_bytes += chunk.len();
            inner.mem.push_back(chunk);
        } else {
            inner.append_to_file(&chunk).await?;
        }
        drop(inner);

        self.shared.readable.notify_one();
        Ok(in_memory)
    }

    /// Records EOF; the drain yields `None` once all buffered bytes are out.
    pub async fn end(&self) {
        let mut inner = self.shared.inner.lock().await;
        inner.ended = true;
        drop(inner);
        self.shared.readable.notify_one();
    }
}

impl Drop for SpillWriter {
    fn drop(&mut self) {
        // A writer dropped without end() must not leave the drain waiting.
        self.shared.writer_gone.store(true, Ordering::Release);
        self.shared.readable.notify_one();
    }
}

/// Drain half of a spill pipe.
pub struct SpillDrain {
    shared: Arc<Shared>,
}

impl SpillDrain {
    /// Next chunk in write order, waiting while the pipe is empty.
    /// `None` marks the end of the stream.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            {
                let mut inner = self.shared.inner.lock().await;
                if let Some(chunk) = inner.pop_chunk().await? {
                    return Ok(Some(chunk));
                }
                if inner.ended {
                    return Ok(None);
                }
            }
            if self.shared.writer_gone.load(Ordering::Acquire) {
                return Ok(None);
            }
            self.shared.readable.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spool_dir() -> PathBuf {
        std::env::temp_dir()
    }

    #[tokio::test]
    async fn in_memory_round_trip() {
        let (writer, mut drain) = spill_pipe(1024, spool_dir());

        assert!(writer.write(Bytes::from_static(b"one")).await.unwrap());
        assert!(writer.write(Bytes::from_static(b"two")).await.unwrap());
        writer.end().await;

        assert_eq!(drain.next_chunk().await.unwrap().unwrap().as_ref(), b"one");
        assert_eq!(drain.next_chunk().await.unwrap().unwrap().as_ref(), b"two");
        assert!(drain.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overflow_goes_to_disk_and_back_in_order() {
        let (writer, mut drain) = spill_pipe(8, spool_dir());

        assert!(writer.write(Bytes::from_static(b"aaaa")).await.unwrap());
        // Window is 8 bytes; this one must spill.
        assert!(!writer.write(Bytes::from_static(b"bbbbbbbb")).await.unwrap());
        // And so must anything written while the disk tail is unread.
        assert!(!writer.write(Bytes::from_static(b"cc")).await.unwrap());
        writer.end().await;

        let mut collected = Vec::new();
        while let Some(chunk) = drain.next_chunk().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"aaaabbbbbbbbcc");
    }

    #[tokio::test]
    async fn memory_window_reopens_after_disk_is_drained() {
        let (writer, mut drain) = spill_pipe(4, spool_dir());

        assert!(!writer.write(Bytes::from_static(b"spilled")).await.unwrap());
        assert_eq!(drain.next_chunk().await.unwrap().unwrap().as_ref(), b"spilled");

        assert!(writer.write(Bytes::from_static(b"mem")).await.unwrap());
        writer.end().await;
        assert_eq!(drain.next_chunk().await.unwrap().unwrap().as_ref(), b"mem");
        assert!(drain.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writer_dropped_without_end_unblocks_the_drain() {
        let (writer, mut drain) = spill_pipe(64, spool_dir());

        writer.write(Bytes::from_static(b"tail")).await.unwrap();
        drop(writer);

        assert_eq!(drain.next_chunk().await.unwrap().unwrap().as_ref(), b"tail");
        assert!(drain.next_chunk().await.unwrap().is_none());
    }

    /// Write order must survive arbitrary interleavings of spills and
    /// drains. Chunk sizes and thresholds come from a fixed multiplicative
    /// congruential sequence so the test is deterministic.
    #[tokio::test]
    async fn write_order_survives_the_disk_boundary() {
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as usize
        };

        for round in 0..4 {
            let threshold = 1 + next() % 96;
            let (writer, mut drain) = spill_pipe(threshold, spool_dir());

            let mut expected = Vec::new();
            let mut value: u8 = round as u8;
            for _ in 0..64 {
                let len = 1 + next() % 48;
                let chunk: Vec<u8> = (0..len)
                    .map(|_| {
                        value = value.wrapping_add(1);
                        value
                    })
                    .collect();
                expected.extend_from_slice(&chunk);
                writer.write(Bytes::from(chunk)).await.unwrap();
            }
            writer.end().await;

            let mut collected = Vec::new();
            while let Some(chunk) = drain.next_chunk().await.unwrap() {
                collected.extend_from_slice(&chunk);
            }
            assert_eq!(collected, expected, "threshold {threshold}");
        }
    }

    #[tokio::test]
    async fn concurrent_writer_and_drain_preserve_order() {
        let (writer, mut drain) = spill_pipe(32, spool_dir());

        let producer = tokio::spawn(async move {
            for i in 0u32..200 {
                let chunk = format!("chunk-{i:04};");
                writer.write(Bytes::from(chunk.into_bytes())).await.unwrap();
                if i % 7 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            writer.end().await;
        });

        let mut collected = Vec::new();
        while let Some(chunk) = drain.next_chunk().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        producer.await.unwrap();

        let expected: Vec<u8> =
            (0u32..200).flat_map(|i| format!("chunk-{i:04};").into_bytes()).collect();
        assert_eq!(collected, expected);
    }
}
