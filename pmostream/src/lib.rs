//! # pmostream
//!
//! Byte-stream plumbing between the MP3 cutting engine and its consumers.
//!
//! - [`buffer`]: a single-producer / single-consumer in-memory queue that
//!   lets a fast producer run ahead of a slow client without blocking, while
//!   keeping memory bounded by compacting consumed data.
//! - [`tee`]: duplicates every write to several destinations; a destination
//!   that fails is isolated and reported instead of failing the write.

pub mod buffer;
pub mod tee;

pub use buffer::{BackpressureBuffer, BufferReader, BufferStats, BufferWriter, DEFAULT_CUTOFF};
pub use tee::{StreamGone, Tee, TeeState};
