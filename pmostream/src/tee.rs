//! Fault-isolating write multiplexer.
//!
//! A [`Tee`] forwards each write to all of its ready destinations. A
//! destination whose write fails is switched to [`TeeState::NotReady`] and a
//! [`StreamGone`] notification is published; the write itself still succeeds
//! for the caller, so one broken client never stops the others.

use std::{
    future::poll_fn,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{io::AsyncWrite, sync::mpsc};

/// Capacity of each subscriber channel.
///
/// Notifications are published with `try_send`; when a subscriber lags this
/// far behind, further notifications for it are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeeState {
    Ready,
    NotReady,
}

/// Published when a destination stops accepting data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGone {
    /// Position of the destination in the tee.
    pub index: usize,
    pub kind: io::ErrorKind,
}

struct Output<W> {
    writer: W,
    state: TeeState,
}

/// Duplicates writes to several destinations.
///
/// An owning tee shuts its destinations down on [`Tee::close`]; a borrowing
/// tee only flushes them, leaving them usable by the caller. Pass `&mut W`
/// destinations to a borrowing tee to keep ownership outside.
pub struct Tee<W> {
    outputs: Vec<Output<W>>,
    owns_destinations: bool,
    closed: bool,
    subscribers: Vec<mpsc::Sender<StreamGone>>,
    // Progress of an interrupted poll_write: current destination and the
    // bytes of the buffer it already accepted.
    cursor: usize,
    accepted: usize,
}

impl<W: AsyncWrite + Unpin> Tee<W> {
    /// Tee that shuts its destinations down when closed.
    pub fn owning(destinations: Vec<W>) -> Self {
        Self::build(destinations, true)
    }

    /// Tee that leaves its destinations open when closed.
    pub fn borrowing(destinations: Vec<W>) -> Self {
        Self::build(destinations, false)
    }

    fn build(destinations: Vec<W>, owns_destinations: bool) -> Self {
        Self {
            outputs: destinations
                .into_iter()
                .map(|writer| Output {
                    writer,
                    state: TeeState::Ready,
                })
                .collect(),
            owns_destinations,
            closed: false,
            subscribers: Vec::new(),
            cursor: 0,
            accepted: 0,
        }
    }

    /// Adds a destination and returns its index.
    pub fn push(&mut self, destination: W) -> usize {
        self.outputs.push(Output {
            writer: destination,
            state: TeeState::Ready,
        });
        self.outputs.len() - 1
    }

    /// Returns a receiver of [`StreamGone`] notifications.
    ///
    /// Each call creates an independent subscription.
    pub fn subscribe(&mut self) -> mpsc::Receiver<StreamGone> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.subscribers.push(tx);
        rx
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn state(&self, index: usize) -> Option<TeeState> {
        self.outputs.get(index).map(|output| output.state)
    }

    pub fn ready_count(&self) -> usize {
        self.outputs
            .iter()
            .filter(|output| output.state == TeeState::Ready)
            .count()
    }

    /// Puts a failed destination back in service.
    ///
    /// Returns `false` when `index` is out of range.
    pub fn reset_stream(&mut self, index: usize) -> bool {
        match self.outputs.get_mut(index) {
            Some(output) => {
                output.state = TeeState::Ready;
                true
            }
            None => false,
        }
    }

    /// Writes `buf` to every ready destination.
    ///
    /// Always reports the whole buffer as written unless the tee is closed.
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        poll_fn(|cx| Pin::new(&mut *self).poll_write(cx, buf)).await
    }

    /// Flushes, then shuts down the destinations of an owning tee.
    ///
    /// Further writes fail with [`io::ErrorKind::BrokenPipe`].
    pub async fn close(&mut self) -> io::Result<()> {
        poll_fn(|cx| Pin::new(&mut *self).poll_shutdown(cx)).await
    }

    /// Gives the destinations back.
    pub fn into_inner(self) -> Vec<W> {
        self.outputs.into_iter().map(|output| output.writer).collect()
    }

    fn mark_gone(&mut self, index: usize, error: io::Error) {
        let output = &mut self.outputs[index];
        if output.state == TeeState::NotReady {
            return;
        }
        output.state = TeeState::NotReady;
        tracing::debug!(index, "tee destination failed: {}", error);

        let event = StreamGone {
            index,
            kind: error.kind(),
        };
        self.subscribers.retain(|tx| !tx.is_closed());
        for tx in &self.subscribers {
            if tx.try_send(event).is_err() {
                tracing::warn!(index, "stream gone notification dropped, subscriber lagging");
            }
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "tee closed")
}

impl<W: AsyncWrite + Unpin> AsyncWrite for Tee<W> {
    /// Destinations are driven in order. On `Pending` the progress is kept,
    /// so the next call must pass the same buffer.
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.closed {
            return Poll::Ready(Err(closed_error()));
        }

        while this.cursor < this.outputs.len() {
            let index = this.cursor;
            if this.outputs[index].state == TeeState::NotReady || this.accepted >= buf.len() {
                this.cursor += 1;
                this.accepted = 0;
                continue;
            }

            let output = &mut this.outputs[index];
            match Pin::new(&mut output.writer).poll_write(cx, &buf[this.accepted..]) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(0)) => {
                    this.mark_gone(index, io::ErrorKind::WriteZero.into());
                }
                Poll::Ready(Ok(n)) => {
                    this.accepted += n;
                }
                Poll::Ready(Err(error)) => {
                    this.mark_gone(index, error);
                }
            }
        }

        this.cursor = 0;
        this.accepted = 0;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let mut pending = false;
        for index in 0..this.outputs.len() {
            if this.outputs[index].state == TeeState::NotReady {
                continue;
            }
            match Pin::new(&mut this.outputs[index].writer).poll_flush(cx) {
                Poll::Pending => pending = true,
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(error)) => this.mark_gone(index, error),
            }
        }
        if pending {
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        if !self.owns_destinations {
            let flushed = self.as_mut().poll_flush(cx);
            if flushed.is_ready() {
                self.closed = true;
            }
            return flushed;
        }

        let this = &mut *self;
        let mut pending = false;
        for index in 0..this.outputs.len() {
            if this.outputs[index].state == TeeState::NotReady {
                continue;
            }
            match Pin::new(&mut this.outputs[index].writer).poll_shutdown(cx) {
                Poll::Pending => pending = true,
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(error)) => this.mark_gone(index, error),
            }
        }
        if pending {
            return Poll::Pending;
        }
        this.closed = true;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reset_out_of_range() {
        let mut tee: Tee<Vec<u8>> = Tee::borrowing(vec![Vec::new()]);
        assert!(!tee.reset_stream(3));
        assert!(tee.reset_stream(0));
        assert_eq!(tee.state(0), Some(TeeState::Ready));
        assert_eq!(tee.state(1), None);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let mut tee = Tee::owning(vec![Vec::new(), Vec::new()]);
        assert_eq!(tee.write(b"abc").await.unwrap(), 3);
        tee.close().await.unwrap();
        let err = tee.write(b"def").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(tee.into_inner(), vec![b"abc".to_vec(), b"abc".to_vec()]);
    }
}
