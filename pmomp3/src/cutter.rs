//! Range cutting and fan-out to several destinations.
//!
//! ```text
//! source ──► FrameReader ──► in range? ──► Destination 0 (live client)
//!                               │     ├──► Destination 1 (cache file)
//!                               │     └──► Destination N ...
//!                               └─ pacing (live destinations only)
//! ```
//!
//! Every destination has its own policy. A destination that fails is marked
//! [`DestinationState::Faulted`] and receives nothing more; the others keep
//! going. Only destinations that are not allowed to fail turn their fault into
//! an error returned to the caller.

use std::{io, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{CutError, SinkFault},
    frame::set_private_bit,
    range::{sort_ranges, TimeRange},
    reader::FrameReader,
};

/// Default stream position at which the one-shot pacing check runs.
pub const DEFAULT_PACING_CHECK_MS: f64 = 1000.0;

/// Default amount of audio a live destination may receive ahead of real time.
pub const DEFAULT_LIVE_LOOKAHEAD_MS: f64 = 3000.0;

/// Default sleep step while a live destination is too far ahead.
pub const DEFAULT_PACING_SLEEP: Duration = Duration::from_millis(50);

/// Why a destination stopped receiving data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    /// A write or flush on the sink failed.
    WriteFailed(io::ErrorKind),
    /// The source was slower than real time and the destination asked to be
    /// dropped in that case.
    PacingTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationState {
    Active,
    Faulted(FaultReason),
}

/// One output of a cut, with its delivery policy.
///
/// The sink stays owned by the caller; the destination only borrows it for
/// the duration of the cut.
pub struct Destination<'a> {
    sink: &'a mut (dyn AsyncWrite + Send + Unpin),
    receives_uncut_audio: bool,
    fault_is_allowed: bool,
    drop_on_pacing_timeout: bool,
    is_live_stream: bool,
    state: DestinationState,
    frames_written: u64,
    bytes_written: u64,
}

impl<'a> Destination<'a> {
    /// A destination receiving cut audio, whose failure is an error.
    pub fn new(sink: &'a mut (dyn AsyncWrite + Send + Unpin)) -> Self {
        Self {
            sink,
            receives_uncut_audio: false,
            fault_is_allowed: false,
            drop_on_pacing_timeout: false,
            is_live_stream: false,
            state: DestinationState::Active,
            frames_written: 0,
            bytes_written: 0,
        }
    }

    /// Live client: paced, allowed to fail, dropped when the source is too slow.
    pub fn live(sink: &'a mut (dyn AsyncWrite + Send + Unpin)) -> Self {
        Self::new(sink)
            .with_fault_allowed(true)
            .with_drop_on_pacing_timeout(true)
            .with_live_stream(true)
    }

    pub fn with_uncut_audio(mut self, uncut: bool) -> Self {
        self.receives_uncut_audio = uncut;
        self
    }

    pub fn with_fault_allowed(mut self, allowed: bool) -> Self {
        self.fault_is_allowed = allowed;
        self
    }

    pub fn with_drop_on_pacing_timeout(mut self, drop: bool) -> Self {
        self.drop_on_pacing_timeout = drop;
        self
    }

    pub fn with_live_stream(mut self, live: bool) -> Self {
        self.is_live_stream = live;
        self
    }

    pub fn state(&self) -> DestinationState {
        self.state
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self.state, DestinationState::Faulted(_))
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn wants(&self, in_range: bool) -> bool {
        !self.is_faulted() && (self.receives_uncut_audio || !in_range)
    }

    // Active -> Faulted only; a second fault keeps the first reason.
    fn fault(&mut self, reason: FaultReason) {
        if !self.is_faulted() {
            self.state = DestinationState::Faulted(reason);
        }
    }
}

/// Tuning of the cutting engine.
#[derive(Debug, Clone)]
pub struct CutterOptions {
    pub pacing_check_ms: f64,
    pub live_lookahead_ms: f64,
    pub pacing_sleep: Duration,
}

impl Default for CutterOptions {
    fn default() -> Self {
        Self {
            pacing_check_ms: DEFAULT_PACING_CHECK_MS,
            live_lookahead_ms: DEFAULT_LIVE_LOOKAHEAD_MS,
            pacing_sleep: DEFAULT_PACING_SLEEP,
        }
    }
}

/// Summary of a finished cut.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CutReport {
    /// Complete frames read from the source.
    pub frames_read: u64,
    /// Frames that started inside one of the ranges.
    pub frames_in_range: u64,
    /// Bytes skipped while resynchronizing.
    pub bytes_discarded: u64,
    /// Duration of the source audio walked, in milliseconds.
    pub source_ms: f64,
    /// The cut stopped because the cancellation token fired.
    pub cancelled: bool,
}

/// Streams MP3 frames to destinations, dropping the configured time ranges.
///
/// A `Cutter` holds no per-stream state and can be shared between tasks;
/// each call to [`Cutter::cut`] owns its own clock and counters.
#[derive(Debug, Clone, Default)]
pub struct Cutter {
    options: CutterOptions,
    cancel: Option<CancellationToken>,
}

impl Cutter {
    pub fn new(options: CutterOptions) -> Self {
        Self {
            options,
            cancel: None,
        }
    }

    /// Stops every call made through this cutter once `token` is cancelled.
    ///
    /// The token is checked at each frame boundary and while pacing.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn options(&self) -> &CutterOptions {
        &self.options
    }

    /// Copies `source` to every destination, dropping the frames that start
    /// inside `ranges` for the destinations that receive cut audio.
    ///
    /// Returns [`CutError::Sinks`] when at least one destination that is not
    /// allowed to fail had a write error; the other destinations were still
    /// served until the end of the stream.
    pub async fn cut<R>(
        &self,
        source: R,
        ranges: &[TimeRange],
        destinations: &mut [Destination<'_>],
    ) -> Result<CutReport, CutError>
    where
        R: AsyncRead + Unpin,
    {
        self.run(FrameReader::new(source), ranges, destinations).await
    }

    /// Same as [`Cutter::cut`], copying every byte skipped by
    /// resynchronization to `discard`.
    pub async fn cut_with_discard<R>(
        &self,
        source: R,
        ranges: &[TimeRange],
        destinations: &mut [Destination<'_>],
        discard: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<CutReport, CutError>
    where
        R: AsyncRead + Unpin,
    {
        self.run(FrameReader::with_discard(source, discard), ranges, destinations)
            .await
    }

    /// Copies every frame of `source` to `sink`, setting the private bit when
    /// `mark_as_ad` is true and clearing it otherwise.
    ///
    /// Returns the number of frames written.
    pub async fn send_marked<R>(
        &self,
        source: R,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        mark_as_ad: bool,
    ) -> Result<u64, CutError>
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FrameReader::new(source);
        let mut written = 0u64;

        loop {
            if self.is_cancelled() {
                tracing::debug!(written, "marked copy cancelled");
                break;
            }
            let Some(frame) = frames.next_frame().await? else {
                break;
            };

            let mut header = frame.header_bytes;
            set_private_bit(&mut header, mark_as_ad);
            if let Err(error) = write_frame(&mut *sink, &header, frame.payload).await {
                return Err(CutError::Sinks(vec![SinkFault { index: 0, error }]));
            }
            written += 1;
        }

        if let Err(error) = sink.flush().await {
            return Err(CutError::Sinks(vec![SinkFault { index: 0, error }]));
        }

        Ok(written)
    }

    async fn run<R>(
        &self,
        mut frames: FrameReader<'_, R>,
        ranges: &[TimeRange],
        destinations: &mut [Destination<'_>],
    ) -> Result<CutReport, CutError>
    where
        R: AsyncRead + Unpin,
    {
        let mut ranges = ranges.to_vec();
        sort_ranges(&mut ranges);

        let started = Instant::now();
        let mut report = CutReport::default();
        let mut required_faults = Vec::new();
        let mut elapsed_ms = 0.0f64;
        let mut emitted_ms = 0.0f64;
        let mut pacing_checked = false;

        loop {
            if self.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if destinations.iter().all(Destination::is_faulted) {
                tracing::debug!("no destination left, stopping cut");
                break;
            }

            let Some(frame) = frames.next_frame().await? else {
                break;
            };
            report.frames_read += 1;

            let position = elapsed_ms / 1000.0;
            let in_range = ranges.iter().any(|range| range.contains(position));
            if in_range {
                report.frames_in_range += 1;
            }

            let mut header = frame.header_bytes;
            set_private_bit(&mut header, false);

            // a live destination got this frame, so its audio time advanced
            let mut live_wrote = false;
            for (index, destination) in destinations.iter_mut().enumerate() {
                if !destination.wants(in_range) {
                    continue;
                }
                match write_frame(&mut *destination.sink, &header, frame.payload).await {
                    Ok(()) => {
                        destination.frames_written += 1;
                        destination.bytes_written += (header.len() + frame.payload.len()) as u64;
                        live_wrote |= destination.is_live_stream;
                    }
                    Err(error) => {
                        tracing::debug!(index, "destination write failed: {}", error);
                        destination.fault(FaultReason::WriteFailed(error.kind()));
                        if !destination.fault_is_allowed {
                            required_faults.push(SinkFault { index, error });
                        }
                    }
                }
            }

            if !pacing_checked && elapsed_ms > self.options.pacing_check_ms {
                pacing_checked = true;
                let wall_ms = started.elapsed().as_secs_f64() * 1000.0;
                if wall_ms > elapsed_ms {
                    tracing::debug!(
                        wall_ms,
                        elapsed_ms,
                        "source slower than real time, dropping pacing-sensitive destinations"
                    );
                    for destination in destinations.iter_mut() {
                        if destination.drop_on_pacing_timeout {
                            destination.fault(FaultReason::PacingTimeout);
                        }
                    }
                }
            }

            let pacing = destinations
                .iter()
                .any(|destination| destination.is_live_stream && !destination.is_faulted());
            if pacing && live_wrote {
                emitted_ms += frame.header.duration_ms();
                if !self.pace(started, emitted_ms).await {
                    report.cancelled = true;
                    elapsed_ms += frame.header.duration_ms();
                    break;
                }
            }

            elapsed_ms += frame.header.duration_ms();
        }

        for (index, destination) in destinations.iter_mut().enumerate() {
            if destination.is_faulted() {
                continue;
            }
            if let Err(error) = destination.sink.flush().await {
                tracing::debug!(index, "destination flush failed: {}", error);
                destination.fault(FaultReason::WriteFailed(error.kind()));
                if !destination.fault_is_allowed {
                    required_faults.push(SinkFault { index, error });
                }
            }
        }

        report.bytes_discarded = frames.bytes_discarded();
        report.source_ms = elapsed_ms;

        tracing::debug!(
            frames = report.frames_read,
            cut = report.frames_in_range,
            discarded = report.bytes_discarded,
            cancelled = report.cancelled,
            "cut finished"
        );

        if required_faults.is_empty() {
            Ok(report)
        } else {
            Err(CutError::Sinks(required_faults))
        }
    }

    /// Sleeps while more than the look-ahead has been emitted.
    ///
    /// Returns `false` if cancelled while waiting.
    async fn pace(&self, started: Instant, emitted_ms: f64) -> bool {
        loop {
            let wall_ms = started.elapsed().as_secs_f64() * 1000.0;
            if emitted_ms <= wall_ms + self.options.live_lookahead_ms {
                return true;
            }
            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return false,
                        _ = tokio::time::sleep(self.options.pacing_sleep) => {}
                    }
                }
                None => tokio::time::sleep(self.options.pacing_sleep).await,
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

async fn write_frame<W>(sink: &mut W, header: &[u8], payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    sink.write_all(header).await?;
    sink.write_all(payload).await
}
