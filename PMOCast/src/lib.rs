//! # PMOCast
//!
//! Delivers MP3 podcast episodes with sponsor segments removed.
//!
//! [`Delivery`] ties the workspace crates together: an admission permit from
//! `pmothrottle`, cache entries from `pmocache`, the cutting engine of
//! `pmomp3` and, for live clients, a `pmostream` buffer between the engine
//! and the connection.
//!
//! ```no_run
//! use pmocast::{Delivery, DeliveryRequest};
//! use pmomp3::normalize_ranges;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = pmoconfig::get_config()?;
//! let delivery = Delivery::from_config(&config)?;
//!
//! let source = tokio::fs::File::open("episode.mp3").await?;
//! let mut client = tokio::io::stdout();
//! let request = DeliveryRequest::new("alice")
//!     .with_cache_name("episode.mp3")
//!     .with_ranges(normalize_ranges(vec![(30.0, 95.5)]));
//! delivery.deliver(&request, source, &mut client).await?;
//! # Ok(())
//! # }
//! ```

pub mod delivery;
pub mod error;
pub mod logs;

pub use delivery::{
    AudioCache, Delivery, DeliveryOptions, DeliveryOutcome, DeliveryRequest, RangesCache,
};
pub use error::DeliveryError;
