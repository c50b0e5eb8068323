use std::{
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use pmostream::{BackpressureBuffer, StreamGone, Tee, TeeState};

/// Test writer whose failure can be switched from outside.
#[derive(Default)]
struct Flaky {
    data: Vec<u8>,
    failing: Arc<AtomicBool>,
    shut_down: bool,
}

impl Flaky {
    fn broken() -> Self {
        Self {
            failing: Arc::new(AtomicBool::new(true)),
            ..Self::default()
        }
    }
}

impl AsyncWrite for Flaky {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.failing.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
        }
        self.data.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shut_down = true;
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn failing_destination_is_isolated() -> io::Result<()> {
    let mut good = Flaky::default();
    let mut bad = Flaky::broken();

    let mut tee = Tee::borrowing(vec![&mut good, &mut bad]);
    let mut events = tee.subscribe();

    assert_eq!(tee.write(b"frame-1").await?, 7);
    assert_eq!(tee.write(b"frame-2").await?, 7);

    assert_eq!(tee.state(0), Some(TeeState::Ready));
    assert_eq!(tee.state(1), Some(TeeState::NotReady));
    assert_eq!(tee.ready_count(), 1);

    assert_eq!(
        events.try_recv().ok(),
        Some(StreamGone {
            index: 1,
            kind: io::ErrorKind::ConnectionReset,
        })
    );
    // reported once, not on every write
    assert!(events.try_recv().is_err());

    tee.close().await?;
    drop(tee);
    assert_eq!(good.data, b"frame-1frame-2");
    assert!(!good.shut_down);
    Ok(())
}

#[tokio::test]
async fn reset_stream_resumes_delivery() -> io::Result<()> {
    let flaky = Flaky::broken();
    let switch = flaky.failing.clone();
    let mut tee = Tee::owning(vec![Flaky::default(), flaky]);

    tee.write(b"a").await?;
    assert_eq!(tee.state(1), Some(TeeState::NotReady));

    // still not ready after the fault clears, until reset
    switch.store(false, Ordering::SeqCst);
    tee.write(b"b").await?;
    assert_eq!(tee.state(1), Some(TeeState::NotReady));

    assert!(tee.reset_stream(1));
    tee.write(b"c").await?;
    tee.close().await?;

    let outputs = tee.into_inner();
    assert_eq!(outputs[0].data, b"abc");
    assert_eq!(outputs[1].data, b"c");
    assert!(outputs.iter().all(|output| output.shut_down));
    Ok(())
}

#[tokio::test]
async fn notifications_never_block_the_writer() -> io::Result<()> {
    let destinations: Vec<Flaky> = (0..100).map(|_| Flaky::broken()).collect();
    let mut tee = Tee::owning(destinations);
    // subscribed but never drained
    let _events = tee.subscribe();

    assert_eq!(tee.write(b"data").await?, 4);
    assert_eq!(tee.ready_count(), 0);
    Ok(())
}

#[tokio::test]
async fn tee_feeds_buffered_clients() -> io::Result<()> {
    let (first_writer, mut first_reader) = BackpressureBuffer::new(1024);
    let (second_writer, second_reader) = BackpressureBuffer::new(1024);

    let mut tee = Tee::owning(vec![first_writer, second_writer]);
    let mut events = tee.subscribe();

    tee.write_all(b"shared ").await?;
    // second client disconnects
    drop(second_reader);
    tee.write_all(b"stream").await?;
    tee.close().await?;

    let mut received = String::new();
    first_reader.read_to_string(&mut received).await?;
    assert_eq!(received, "shared stream");

    let gone = events.recv().await.expect("notification");
    assert_eq!(gone.index, 1);
    assert_eq!(gone.kind, io::ErrorKind::BrokenPipe);
    Ok(())
}
