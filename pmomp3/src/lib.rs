//! # pmomp3
//!
//! Frame-level MP3 (MPEG-1 Layer III) streaming utilities: header parsing,
//! resynchronization on corrupt data, time-range cutting and fan-out to
//! several destinations with per-destination policies.
//!
//! Nothing is decoded to PCM: frames are walked and copied as-is, so a track
//! never needs to be held in memory.
//!
//! ## Example: remove a sponsor segment
//!
//! ```no_run
//! use pmomp3::{normalize_ranges, Cutter, CutterOptions, Destination};
//! use tokio::fs::File;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = File::open("episode.mp3").await?;
//!     let mut output = File::create("episode.cut.mp3").await?;
//!
//!     let ranges = normalize_ranges(vec![(62.0, 124.5)]);
//!     let mut destinations = [Destination::new(&mut output)];
//!
//!     let report = Cutter::new(CutterOptions::default())
//!         .cut(source, &ranges, &mut destinations)
//!         .await?;
//!     println!("{} frames read, {} removed", report.frames_read, report.frames_in_range);
//!     Ok(())
//! }
//! ```

pub mod cutter;
pub mod error;
pub mod frame;
pub mod range;
pub mod reader;

pub use cutter::{
    CutReport, Cutter, CutterOptions, Destination, DestinationState, FaultReason,
};
pub use error::{CutError, Mp3Error, SinkFault};
pub use frame::{is_header, set_private_bit, FrameHeader, HEADER_LEN, SAMPLES_PER_FRAME};
pub use range::{normalize_ranges, RangeParseError, TimeRange};
pub use reader::{Frame, FrameReader};
