use std::io;

/// Errors raised while decoding the MP3 bitstream itself.
///
/// Neither variant reaches the caller of [`crate::Cutter::cut`]: format errors
/// trigger a resynchronization and short reads end the walk silently.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Mp3Error {
    #[error("invalid MP3 frame header: {0}")]
    Format(String),
    #[error("stream ended after {got} of {wanted} bytes")]
    ShortRead { wanted: usize, got: usize },
}

/// A destination that failed to accept a frame.
#[derive(Debug)]
pub struct SinkFault {
    /// Position of the destination in the list given to `cut`.
    pub index: usize,
    pub error: io::Error,
}

impl std::fmt::Display for SinkFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "destination #{}: {}", self.index, self.error)
    }
}

/// Errors surfaced by the cutting engine.
#[derive(thiserror::Error, Debug)]
pub enum CutError {
    #[error("source read failed: {0}")]
    Source(#[from] io::Error),
    #[error("{} required destination(s) failed: {}", .0.len(), join_faults(.0))]
    Sinks(Vec<SinkFault>),
}

impl CutError {
    /// Faults of the destinations that were not allowed to fail.
    pub fn sink_faults(&self) -> &[SinkFault] {
        match self {
            CutError::Sinks(faults) => faults,
            CutError::Source(_) => &[],
        }
    }
}

fn join_faults(faults: &[SinkFault]) -> String {
    faults
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
