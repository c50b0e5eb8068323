//! Time ranges to remove from a stream.

use std::{fmt, str::FromStr};

/// A segment of the original stream, in seconds.
///
/// Both bounds are finite, non-negative and `start < end`. Values that do not
/// satisfy this cannot be constructed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    start: f64,
    end: f64,
}

impl TimeRange {
    /// Returns `None` for an invalid range.
    pub fn new(start: f64, end: f64) -> Option<Self> {
        Self::is_valid(start, end).then_some(Self { start, end })
    }

    pub fn is_valid(start: f64, end: f64) -> bool {
        start.is_finite() && end.is_finite() && start >= 0.0 && start < end
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    /// Inclusive on both bounds.
    pub fn contains(&self, seconds: f64) -> bool {
        self.start <= seconds && seconds <= self.end
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}-{:.3}", self.start, self.end)
    }
}

/// Error returned when parsing a `start-end` range.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid time range '{0}', expected <start>-<end> in seconds")]
pub struct RangeParseError(pub String);

impl FromStr for TimeRange {
    type Err = RangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || RangeParseError(s.to_string());
        let (start, end) = s.trim().split_once('-').ok_or_else(err)?;
        let start: f64 = start.trim().parse().map_err(|_| err())?;
        let end: f64 = end.trim().parse().map_err(|_| err())?;
        TimeRange::new(start, end).ok_or_else(err)
    }
}

/// Keeps the valid `(start, end)` pairs and sorts them by start.
///
/// Invalid pairs are dropped silently.
pub fn normalize_ranges<I>(raw: I) -> Vec<TimeRange>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let mut ranges: Vec<TimeRange> = raw
        .into_iter()
        .filter_map(|(start, end)| TimeRange::new(start, end))
        .collect();
    sort_ranges(&mut ranges);
    ranges
}

pub(crate) fn sort_ranges(ranges: &mut [TimeRange]) {
    ranges.sort_by(|a, b| a.start.total_cmp(&b.start));
}
