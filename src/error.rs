//! Error types for the sampling pipeline
//!
//! Persistence errors live in [`crate::storage::error`].

use std::fmt;

use crate::MetricKind;

/// Result type alias for sampler, buffer and settings operations
pub type SamplerResult<T> = Result<T, SamplerError>;

#[derive(Debug, Clone, PartialEq)]
pub enum SamplerError {
    /// A metric source failed or timed out during a tick.
    ///
    /// Non-fatal: the kind is omitted from that tick.
    SourceUnavailable { kind: MetricKind, reason: String },

    /// Ring buffer constructed or resized with a zero capacity
    InvalidCapacity(usize),

    /// Settings outside their permitted bounds; the previous settings remain
    InvalidSettings(String),

    /// The sampler actor has shut down and can no longer take commands
    ActorUnavailable,
}

impl fmt::Display for SamplerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplerError::SourceUnavailable { kind, reason } => {
                write!(f, "{kind} source unavailable: {reason}")
            }
            SamplerError::InvalidCapacity(capacity) => {
                write!(f, "invalid ring buffer capacity: {capacity} (must be > 0)")
            }
            SamplerError::InvalidSettings(msg) => write!(f, "invalid sampler settings: {msg}"),
            SamplerError::ActorUnavailable => write!(f, "sampler actor is not running"),
        }
    }
}

impl std::error::Error for SamplerError {}
