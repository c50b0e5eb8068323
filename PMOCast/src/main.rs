use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pmocast::{Delivery, DeliveryOutcome, DeliveryRequest, logs::init_logging};
use pmomp3::{TimeRange, normalize_ranges};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command-line arguments for pmocast
#[derive(Parser, Debug)]
#[command(name = "pmocast")]
#[command(about = "Removes sponsor segments from MP3 episodes")]
#[command(version)]
struct Args {
    /// Configuration directory
    #[arg(short, long, env = "PMOCAST_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Cut segments out of an MP3 file
    Cut {
        /// Source MP3 file
        input: PathBuf,

        /// Segment to remove, as <start>-<end> in seconds (repeatable)
        #[arg(short, long = "range")]
        ranges: Vec<TimeRange>,

        /// Output file, standard output when absent
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Store the cut audio in the cache under this name
        #[arg(long)]
        cache_name: Option<String>,

        /// Segment list stored in the ranges cache, used when no --range is given
        #[arg(long)]
        ranges_key: Option<String>,

        /// Identity charged by the admission throttle
        #[arg(long, default_value = "cli")]
        identity: String,

        /// Pace the output to real time
        #[arg(long)]
        live: bool,
    },
    /// Remove stale cache entries
    Sweep,
    /// Remove every cache entry
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_dir = args
        .config
        .as_ref()
        .map(|dir| dir.to_string_lossy().to_string())
        .unwrap_or_default();
    let config = pmoconfig::init_config(&config_dir)?;
    init_logging(&config)?;

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping");
            ctrl_c.cancel();
        }
    });

    let delivery = Delivery::from_config(&config)?.with_cancellation(token);

    match args.command {
        Command::Cut {
            input,
            ranges,
            output,
            cache_name,
            ranges_key,
            identity,
            live,
        } => {
            let ranges = match (&ranges_key, ranges.is_empty()) {
                (Some(key), true) => delivery.load_ranges(key).await?.unwrap_or_default(),
                (Some(key), false) => {
                    let ranges = normalize_ranges(ranges.iter().map(|r| (r.start(), r.end())));
                    delivery.store_ranges(key, &ranges).await?;
                    ranges
                }
                (None, _) => ranges,
            };

            let source = tokio::fs::File::open(&input)
                .await
                .with_context(|| format!("cannot open {}", input.display()))?;
            let mut sink: Box<dyn AsyncWrite + Send + Unpin> = match &output {
                Some(path) => Box::new(
                    tokio::fs::File::create(path)
                        .await
                        .with_context(|| format!("cannot create {}", path.display()))?,
                ),
                None => Box::new(tokio::io::stdout()),
            };

            let mut request = DeliveryRequest::new(identity)
                .with_ranges(ranges)
                .with_live(live);
            if let Some(name) = cache_name {
                request = request.with_cache_name(name);
            }

            match delivery.deliver(&request, source, &mut *sink).await? {
                DeliveryOutcome::Cached { frames } => {
                    info!(frames, "served from cache");
                }
                DeliveryOutcome::Cut {
                    report,
                    client,
                    cached,
                } => {
                    info!(
                        frames_read = report.frames_read,
                        frames_removed = report.frames_in_range,
                        bytes_discarded = report.bytes_discarded,
                        cached,
                        ?client,
                        "cut finished"
                    );
                }
            }
        }
        Command::Sweep => {
            let options = delivery.options();
            let audio = delivery
                .audio_cache()
                .clear_stale(options.audio_max_age)
                .await?;
            let ranges = delivery
                .ranges_cache()
                .clear_stale(options.ranges_max_age)
                .await?;
            info!(audio, ranges, "stale entries removed");
        }
        Command::Purge => {
            let audio = delivery.audio_cache().purge().await?;
            let ranges = delivery.ranges_cache().purge().await?;
            info!(audio, ranges, "cache purged");
        }
    }

    Ok(())
}
