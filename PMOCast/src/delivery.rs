//! Delivery of an episode to one client.
//!
//! A delivery is admitted by the [`AdmissionThrottle`] for the identity of the
//! request, then either replays a fresh cache entry or cuts the source while
//! writing the cut audio both to the client and to the cache:
//!
//! ```text
//!                       fresh entry ──send_marked──► client
//! permit ─► cache? ─┤
//!                       otherwise ──cut──┬─► client (live, may fail)
//!                                        └─► cache entry (must not fail)
//! ```
//!
//! The cut audio goes to a provisional `<name>.part` entry, renamed into place
//! only when the cut went through to the end of the source; a failed or
//! cancelled cut removes it. While one delivery writes an entry, concurrent
//! misses on the same name are cut to their client without caching.

use std::{sync::Arc, time::Duration};

use pmocache::{CacheConfig, CacheConfigExt, CacheError, FileCache, spawn_cleanup_task};
use pmoconfig::Config;
use pmomp3::{
    CutReport, Cutter, CutterOptions, Destination, DestinationState, TimeRange, normalize_ranges,
};
use pmostream::{BackpressureBuffer, BufferReader, DEFAULT_CUTOFF};
use pmothrottle::{AdmissionThrottle, ThrottleSettings};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DeliveryError;

const DEFAULT_AUDIO_MAX_AGE_SECS: u64 = 7 * 24 * 3600;
const DEFAULT_RANGES_MAX_AGE_SECS: u64 = 24 * 3600;

/// Cut episodes, ready to be replayed.
pub struct AudioCache;

impl CacheConfig for AudioCache {
    fn file_extension() -> &'static str {
        "mp3"
    }

    fn cache_type() -> &'static str {
        "audio"
    }

    fn cache_name() -> &'static str {
        "audio"
    }
}

/// Segment lists, one `start-end` range per line.
pub struct RangesCache;

impl CacheConfig for RangesCache {
    fn file_extension() -> &'static str {
        "ranges"
    }

    fn cache_type() -> &'static str {
        "ranges"
    }

    fn cache_name() -> &'static str {
        "ranges"
    }
}

/// What a client asked for.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Identity charged by the admission throttle.
    pub identity: String,
    /// Cache entry holding the cut episode, if it should be cached.
    pub cache_name: Option<String>,
    /// Segments to remove.
    pub ranges: Vec<TimeRange>,
    /// Pace the client to real time and drop it when the source is too slow.
    pub live: bool,
}

impl DeliveryRequest {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            cache_name: None,
            ranges: Vec::new(),
            live: true,
        }
    }

    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = Some(name.into());
        self
    }

    pub fn with_ranges(mut self, ranges: Vec<TimeRange>) -> Self {
        self.ranges = ranges;
        self
    }

    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }
}

/// How a delivery ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// A fresh cache entry was replayed.
    Cached { frames: u64 },
    /// The source was cut.
    Cut {
        report: CutReport,
        /// Final state of the client destination.
        client: DestinationState,
        /// The cut audio was stored in the cache.
        cached: bool,
    },
}

/// Tuning of a [`Delivery`].
#[derive(Debug, Clone)]
pub struct DeliveryOptions {
    pub cutter: CutterOptions,
    /// Cutoff of the buffers created by [`Delivery::live_stream`].
    pub buffer_cutoff: usize,
    /// Longest wait for an admission.
    pub max_wait: Duration,
    pub audio_max_age: Duration,
    pub ranges_max_age: Duration,
    /// Period of the cache cleanup tasks; zero disables them.
    pub cleanup_interval: Duration,
    /// Period of the throttle sweeper; zero disables it.
    pub sweep_interval: Duration,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            cutter: CutterOptions::default(),
            buffer_cutoff: DEFAULT_CUTOFF,
            max_wait: Duration::from_secs(30),
            audio_max_age: Duration::from_secs(DEFAULT_AUDIO_MAX_AGE_SECS),
            ranges_max_age: Duration::from_secs(DEFAULT_RANGES_MAX_AGE_SECS),
            cleanup_interval: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Admission, cache and cutting engine wired together.
pub struct Delivery {
    audio: Arc<FileCache<AudioCache>>,
    ranges: Arc<FileCache<RangesCache>>,
    throttle: Arc<AdmissionThrottle>,
    cutter: Cutter,
    options: DeliveryOptions,
}

impl Delivery {
    pub fn new(
        audio: Arc<FileCache<AudioCache>>,
        ranges: Arc<FileCache<RangesCache>>,
        throttle: Arc<AdmissionThrottle>,
        options: DeliveryOptions,
    ) -> Self {
        Self {
            audio,
            ranges,
            throttle,
            cutter: Cutter::new(options.cutter.clone()),
            options,
        }
    }

    /// Builds caches, throttle and options from the configuration.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let audio = config.create_file_cache::<AudioCache>()?;
        let ranges = config.create_file_cache::<RangesCache>()?;

        let settings = ThrottleSettings::new(config.get_throttle_default_capacity()?)
            .with_identities(config.get_throttle_identities()?);

        let options = DeliveryOptions {
            cutter: CutterOptions {
                pacing_check_ms: config.get_pacing_check_ms()? as f64,
                live_lookahead_ms: config.get_live_lookahead_ms()? as f64,
                pacing_sleep: Duration::from_millis(config.get_pacing_sleep_ms()? as u64),
            },
            buffer_cutoff: config.get_buffer_cutoff()?,
            max_wait: Duration::from_millis(config.get_throttle_max_wait_ms()? as u64),
            audio_max_age: config.get_cache_max_age("audio", DEFAULT_AUDIO_MAX_AGE_SECS)?,
            ranges_max_age: config.get_cache_max_age("ranges", DEFAULT_RANGES_MAX_AGE_SECS)?,
            cleanup_interval: config.get_cache_cleanup_interval()?,
            sweep_interval: Duration::from_secs(config.get_throttle_sweep_interval_secs()? as u64),
        };

        debug!(?options, "delivery configured");
        Ok(Self::new(
            audio,
            ranges,
            Arc::new(AdmissionThrottle::new(settings)),
            options,
        ))
    }

    /// Stops running and future cuts once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cutter = self.cutter.with_cancellation(token);
        self
    }

    pub fn audio_cache(&self) -> &Arc<FileCache<AudioCache>> {
        &self.audio
    }

    pub fn ranges_cache(&self) -> &Arc<FileCache<RangesCache>> {
        &self.ranges
    }

    pub fn throttle(&self) -> &Arc<AdmissionThrottle> {
        &self.throttle
    }

    pub fn options(&self) -> &DeliveryOptions {
        &self.options
    }

    /// Delivers `source` to `client` with the segments of `request` removed.
    ///
    /// The admission permit is held for the whole delivery and released on
    /// every path, errors included.
    pub async fn deliver<R>(
        &self,
        request: &DeliveryRequest,
        source: R,
        client: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<DeliveryOutcome, DeliveryError>
    where
        R: AsyncRead + Unpin,
    {
        let permit = self
            .throttle
            .acquire(&request.identity, self.options.max_wait)
            .await?;
        info!(
            identity = %request.identity,
            cache = ?request.cache_name,
            ranges = request.ranges.len(),
            "delivery started"
        );

        let outcome = match &request.cache_name {
            Some(name) => self.deliver_through_cache(request, name, source, client).await,
            None => self.cut_to_client(request, source, client).await,
        };

        permit.release();
        match &outcome {
            Ok(outcome) => info!(identity = %request.identity, ?outcome, "delivery finished"),
            Err(err) => warn!(identity = %request.identity, "delivery failed: {}", err),
        }
        outcome
    }

    async fn deliver_through_cache<R>(
        &self,
        request: &DeliveryRequest,
        name: &str,
        source: R,
        client: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<DeliveryOutcome, DeliveryError>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(entry) = self.audio.open_if_fresh(name, self.options.audio_max_age).await? {
            debug!(name = %name, "replaying fresh cache entry");
            let frames = self.cutter.send_marked(entry, client, false).await?;
            return Ok(DeliveryOutcome::Cached { frames });
        }

        let Some(mut entry) = self.audio.write_partial(name).await? else {
            debug!(name = %name, "cache entry being written elsewhere, cutting without caching");
            return self.cut_to_client(request, source, client).await;
        };
        let result = {
            let mut destinations = [
                client_destination(client, request.live),
                Destination::new(&mut entry),
            ];
            self.cutter
                .cut(source, &request.ranges, &mut destinations)
                .await
                .map(|report| (report, destinations[0].state()))
        };
        drop(entry);

        match result {
            Ok((report, client)) if !report.cancelled => {
                if let Err(err) = self.audio.commit(name).await {
                    self.discard_entry(name).await;
                    return Err(err.into());
                }
                Ok(DeliveryOutcome::Cut {
                    report,
                    client,
                    cached: true,
                })
            }
            Ok((report, client)) => {
                self.discard_entry(name).await;
                Ok(DeliveryOutcome::Cut {
                    report,
                    client,
                    cached: false,
                })
            }
            Err(err) => {
                self.discard_entry(name).await;
                Err(err.into())
            }
        }
    }

    async fn cut_to_client<R>(
        &self,
        request: &DeliveryRequest,
        source: R,
        client: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<DeliveryOutcome, DeliveryError>
    where
        R: AsyncRead + Unpin,
    {
        let mut destinations = [client_destination(client, request.live)];
        let report = self
            .cutter
            .cut(source, &request.ranges, &mut destinations)
            .await?;
        Ok(DeliveryOutcome::Cut {
            report,
            client: destinations[0].state(),
            cached: false,
        })
    }

    async fn discard_entry(&self, name: &str) {
        match self.audio.abort(name).await {
            Ok(_) => debug!(name = %name, "partial cache entry removed"),
            Err(err) => warn!(name = %name, "partial cache entry not removed: {}", err),
        }
    }

    /// Runs [`Delivery::deliver`] on a task writing into a
    /// [`BackpressureBuffer`] and returns the reading half.
    ///
    /// The reader sees end of stream once the delivery is over. Dropping it
    /// faults the client destination; a cache entry being written still
    /// completes.
    pub fn live_stream<R>(
        self: &Arc<Self>,
        request: DeliveryRequest,
        source: R,
    ) -> (
        BufferReader,
        JoinHandle<Result<DeliveryOutcome, DeliveryError>>,
    )
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (mut writer, reader) = BackpressureBuffer::new(self.options.buffer_cutoff);
        let delivery = self.clone();
        let task = tokio::spawn(async move {
            let outcome = delivery.deliver(&request, source, &mut writer).await;
            writer.end_write();
            outcome
        });
        (reader, task)
    }

    /// Sends ad audio to `client`, every frame carrying the ad marker.
    ///
    /// Returns the number of frames written.
    pub async fn insert_ad<R>(
        &self,
        ad_source: R,
        client: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, DeliveryError>
    where
        R: AsyncRead + Unpin,
    {
        let frames = self.cutter.send_marked(ad_source, client, true).await?;
        debug!(frames, "ad inserted");
        Ok(frames)
    }

    /// Segment list stored under `key`, if present and fresh.
    ///
    /// Lines that do not parse as a range are skipped.
    pub async fn load_ranges(&self, key: &str) -> Result<Option<Vec<TimeRange>>, DeliveryError> {
        let name = self.ranges.entry_name(key);
        let Some(mut entry) = self
            .ranges
            .open_if_fresh(&name, self.options.ranges_max_age)
            .await?
        else {
            return Ok(None);
        };

        let mut text = String::new();
        entry
            .read_to_string(&mut text)
            .await
            .map_err(CacheError::from)?;

        let mut ranges = Vec::new();
        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            match line.parse::<TimeRange>() {
                Ok(range) => ranges.push((range.start(), range.end())),
                Err(err) => debug!(key = %key, "skipping stored range: {}", err),
            }
        }
        Ok(Some(normalize_ranges(ranges)))
    }

    /// Stores the segment list of `key`, replacing any previous one.
    pub async fn store_ranges(&self, key: &str, ranges: &[TimeRange]) -> Result<(), DeliveryError> {
        let name = self.ranges.entry_name(key);
        let text: String = ranges.iter().map(|range| format!("{range}\n")).collect();

        let mut entry = self.ranges.write(&name).await?;
        entry
            .write_all(text.as_bytes())
            .await
            .map_err(CacheError::from)?;
        entry.flush().await.map_err(CacheError::from)?;
        Ok(())
    }

    /// Starts the periodic cache cleanups and the throttle sweeper.
    pub fn spawn_maintenance(&self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let interval = self.options.cleanup_interval;
        let mut tasks = vec![
            spawn_cleanup_task(
                self.audio.clone(),
                interval,
                self.options.audio_max_age,
                token.clone(),
            ),
            spawn_cleanup_task(
                self.ranges.clone(),
                interval,
                self.options.ranges_max_age,
                token.clone(),
            ),
        ];
        if !self.options.sweep_interval.is_zero() {
            tasks.push(
                self.throttle
                    .clone()
                    .spawn_sweeper(self.options.sweep_interval, token),
            );
        }
        tasks
    }
}

fn client_destination(
    client: &mut (dyn AsyncWrite + Send + Unpin),
    live: bool,
) -> Destination<'_> {
    if live {
        Destination::live(client)
    } else {
        Destination::new(client).with_fault_allowed(true)
    }
}
