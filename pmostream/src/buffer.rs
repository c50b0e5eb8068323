//! Single-producer / single-consumer in-memory byte queue.
//!
//! The writer appends and never waits; the reader waits for data through the
//! task waker. Once the reader has consumed more than the cutoff, the unread
//! tail is moved to a fresh allocation so memory stays close to the cutoff
//! however long the stream is.
//!
//! ```text
//!   BufferWriter ──write──► [ consumed | unread ... ] ──read──► BufferReader
//!                            0       read_pos      write_pos
//! ```

use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, Waker},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Consumed bytes kept before compaction when no cutoff is configured.
pub const DEFAULT_CUTOFF: usize = 256 * 1024;

/// Point-in-time view of a buffer, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStats {
    /// Bytes written and not read yet.
    pub buffered: usize,
    /// Size of the current backing allocation.
    pub capacity: usize,
    pub total_written: u64,
    pub total_read: u64,
}

struct Shared {
    data: Vec<u8>,
    read_pos: usize,
    cutoff: usize,
    ended: bool,
    closed: bool,
    read_waker: Option<Waker>,
    total_written: u64,
    total_read: u64,
}

impl Shared {
    fn write_pos(&self) -> usize {
        self.data.len()
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn compact(&mut self) {
        let unread = self.data[self.read_pos..].to_vec();
        tracing::trace!(
            consumed = self.read_pos,
            kept = unread.len(),
            "compacting backpressure buffer"
        );
        self.data = unread;
        self.read_pos = 0;
    }

    fn stats(&self) -> BufferStats {
        BufferStats {
            buffered: self.write_pos() - self.read_pos,
            capacity: self.data.capacity(),
            total_written: self.total_written,
            total_read: self.total_read,
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "backpressure buffer closed")
}

/// Constructor for a connected writer / reader pair.
pub struct BackpressureBuffer;

impl BackpressureBuffer {
    /// Creates a buffer that compacts after `cutoff` consumed bytes.
    ///
    /// A cutoff of 0 compacts after every read.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(cutoff: usize) -> (BufferWriter, BufferReader) {
        let shared = Arc::new(Mutex::new(Shared {
            data: Vec::new(),
            read_pos: 0,
            cutoff,
            ended: false,
            closed: false,
            read_waker: None,
            total_written: 0,
            total_read: 0,
        }));
        (
            BufferWriter {
                shared: shared.clone(),
            },
            BufferReader { shared },
        )
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Producer half. Writes always complete immediately.
///
/// Dropping the writer ends the stream.
pub struct BufferWriter {
    shared: Arc<Mutex<Shared>>,
}

impl BufferWriter {
    /// Marks the end of the stream; the reader gets EOF once drained.
    pub fn end_write(&self) {
        let mut shared = lock(&self.shared);
        if !shared.ended {
            shared.ended = true;
            shared.wake_reader();
        }
    }

    /// True once the reader side has been closed or dropped.
    pub fn is_closed(&self) -> bool {
        lock(&self.shared).closed
    }

    pub fn stats(&self) -> BufferStats {
        lock(&self.shared).stats()
    }
}

impl AsyncWrite for BufferWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut shared = lock(&self.shared);
        if shared.closed {
            return Poll::Ready(Err(closed_error()));
        }
        if shared.ended {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write after end of stream",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        shared.data.extend_from_slice(buf);
        shared.total_written += buf.len() as u64;
        shared.wake_reader();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if lock(&self.shared).closed {
            Poll::Ready(Err(closed_error()))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.end_write();
        Poll::Ready(Ok(()))
    }
}

impl Drop for BufferWriter {
    fn drop(&mut self) {
        self.end_write();
    }
}

/// Consumer half.
///
/// Dropping the reader closes the buffer: later writes fail with
/// [`io::ErrorKind::BrokenPipe`].
pub struct BufferReader {
    shared: Arc<Mutex<Shared>>,
}

impl BufferReader {
    /// Releases the buffered data and fails every later operation.
    pub fn close(&self) {
        let mut shared = lock(&self.shared);
        if shared.closed {
            return;
        }
        shared.closed = true;
        shared.data = Vec::new();
        shared.read_pos = 0;
        shared.read_waker = None;
        tracing::debug!(
            written = shared.total_written,
            read = shared.total_read,
            "backpressure buffer closed"
        );
    }

    pub fn stats(&self) -> BufferStats {
        lock(&self.shared).stats()
    }
}

impl AsyncRead for BufferReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut shared = lock(&self.shared);
        if shared.closed {
            return Poll::Ready(Err(closed_error()));
        }

        let unread = shared.write_pos() - shared.read_pos;
        if unread == 0 {
            if shared.ended {
                return Poll::Ready(Ok(()));
            }
            shared.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let to_copy = unread.min(buf.remaining());
        let start = shared.read_pos;
        buf.put_slice(&shared.data[start..start + to_copy]);
        shared.read_pos += to_copy;
        shared.total_read += to_copy as u64;

        if shared.read_pos > shared.cutoff {
            shared.compact();
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for BufferReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_compaction_keeps_unread_tail() {
        let (mut writer, mut reader) = BackpressureBuffer::new(10);
        writer.write_all(&[1u8; 8]).await.unwrap();
        writer.write_all(&[2u8; 8]).await.unwrap();

        let mut out = [0u8; 12];
        reader.read_exact(&mut out).await.unwrap();

        let shared = lock(&reader.shared);
        assert_eq!(shared.read_pos, 0);
        assert_eq!(shared.data, vec![2u8; 4]);
    }

    #[tokio::test]
    async fn test_no_compaction_below_cutoff() {
        let (mut writer, mut reader) = BackpressureBuffer::new(100);
        writer.write_all(&[7u8; 50]).await.unwrap();

        let mut out = [0u8; 20];
        reader.read_exact(&mut out).await.unwrap();

        let shared = lock(&reader.shared);
        assert_eq!(shared.read_pos, 20);
        assert_eq!(shared.data.len(), 50);
    }

    #[tokio::test]
    async fn test_write_after_end_is_rejected() {
        let (mut writer, _reader) = BackpressureBuffer::new(DEFAULT_CUTOFF);
        writer.end_write();
        let err = writer.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
