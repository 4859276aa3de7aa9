//! Error types for flimfit-core.

use thiserror::Error;

/// Result type alias for flimfit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Setup and configuration errors.
///
/// Every variant is raised synchronously while building or configuring a
/// dataset, never from inside a running fit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Grid axes are zero or do not match the data they describe.
    #[error("invalid dimension: {0}")]
    InvalidDimension(String),

    /// Component count outside the supported range.
    #[error("invalid component count: {0} (expected 1 or 2)")]
    InvalidComponentCount(usize),

    /// Fixed-parameter mask does not match the parameter vector.
    #[error("invalid fixed mask: expected {expected} flags, got {actual}")]
    InvalidFixedMask { expected: usize, actual: usize },

    /// Time-bin window is empty or exceeds the histogram.
    #[error("invalid bin window [{first}, {last}) for {bins} bins")]
    InvalidWindow {
        first: usize,
        last: usize,
        bins: usize,
    },

    /// Channel index out of range.
    #[error("invalid channel {channel} (have {channels})")]
    InvalidChannel { channel: usize, channels: usize },
}
