//! Frame-by-frame walk over a raw MP3 byte stream.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::frame::{FrameHeader, HEADER_LEN};

/// Size of the read buffer wrapped around the source.
///
/// Resynchronization reads one byte at a time, so the source must be buffered.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// One complete frame borrowed from the reader.
#[derive(Debug)]
pub struct Frame<'f> {
    pub header: FrameHeader,
    /// Raw header bytes as found in the stream.
    pub header_bytes: [u8; HEADER_LEN],
    pub payload: &'f [u8],
}

/// Walks a byte stream frame by frame, skipping anything that is not audio.
///
/// Garbage, ID3 tags and corrupted frames are skipped by shifting a 4-byte
/// window one byte at a time until it starts with `0xFF` again. Skipped bytes
/// can be copied to an optional discard sink. End of stream in the middle of a
/// header, a resynchronization or a payload ends the walk without error; the
/// incomplete tail is dropped.
pub struct FrameReader<'d, R> {
    reader: BufReader<R>,
    window: [u8; HEADER_LEN],
    payload: Vec<u8>,
    discard: Option<&'d mut (dyn AsyncWrite + Send + Unpin)>,
    pending_discard: Vec<u8>,
    bytes_discarded: u64,
}

impl<'d, R: AsyncRead + Unpin> FrameReader<'d, R> {
    pub fn new(source: R) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, source),
            window: [0; HEADER_LEN],
            payload: Vec::new(),
            discard: None,
            pending_discard: Vec::new(),
            bytes_discarded: 0,
        }
    }

    /// Copies every skipped byte to `sink`.
    pub fn with_discard(source: R, sink: &'d mut (dyn AsyncWrite + Send + Unpin)) -> Self {
        let mut reader = Self::new(source);
        reader.discard = Some(sink);
        reader
    }

    /// Total bytes skipped by resynchronization so far.
    pub fn bytes_discarded(&self) -> u64 {
        self.bytes_discarded
    }

    /// Reads the next complete frame, or `None` once the stream is exhausted.
    pub async fn next_frame(&mut self) -> io::Result<Option<Frame<'_>>> {
        let got = read_full(&mut self.reader, &mut self.window).await?;
        if got < HEADER_LEN {
            self.skip(got);
            self.flush_discarded().await;
            return Ok(None);
        }

        let header = loop {
            if let Ok(header) = FrameHeader::parse(&self.window) {
                break header;
            }
            if !self.resync().await? {
                self.skip(HEADER_LEN);
                self.flush_discarded().await;
                return Ok(None);
            }
        };
        self.flush_discarded().await;

        self.payload.resize(header.payload_bytes, 0);
        let got = read_full(&mut self.reader, &mut self.payload).await?;
        if got < header.payload_bytes {
            tracing::debug!(
                wanted = header.payload_bytes,
                got,
                "stream ended inside a frame, dropping the partial frame"
            );
            return Ok(None);
        }

        Ok(Some(Frame {
            header,
            header_bytes: self.window,
            payload: &self.payload,
        }))
    }

    /// Shifts the window until it starts with a sync byte.
    ///
    /// Returns `false` when the stream ends first.
    async fn resync(&mut self) -> io::Result<bool> {
        let mut byte = [0u8; 1];
        loop {
            if self.reader.read(&mut byte).await? == 0 {
                return Ok(false);
            }
            self.pending_discard.push(self.window[0]);
            self.window.rotate_left(1);
            self.window[HEADER_LEN - 1] = byte[0];
            if self.window[0] == 0xFF {
                return Ok(true);
            }
        }
    }

    fn skip(&mut self, count: usize) {
        self.pending_discard.extend_from_slice(&self.window[..count]);
    }

    async fn flush_discarded(&mut self) {
        if self.pending_discard.is_empty() {
            return;
        }
        let skipped = self.pending_discard.len();
        self.bytes_discarded += skipped as u64;
        tracing::debug!(skipped, "skipped non-audio bytes");

        if let Some(sink) = self.discard.as_mut() {
            if let Err(err) = sink.write_all(&self.pending_discard).await {
                tracing::warn!("discard sink failed, no longer copying skipped bytes: {}", err);
                self.discard = None;
            }
        }
        self.pending_discard.clear();
    }
}

/// Reads until `buf` is full or the stream ends; returns the bytes read.
pub(crate) async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
