//! Error types for the reconstruction and alignment engine.

use thiserror::Error;

/// Errors that can occur while reading, processing, or aligning events.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying file access failed
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An event record violates the binary format
    #[error("format error: {0}")]
    Format(String),

    /// Invalid device, geometry, or analyzer configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Event content is inconsistent with the device setup
    #[error("event error: {0}")]
    Event(String),

    /// An alignment solve could not be completed
    #[error("alignment failed for sensor {sensor}: {reason}")]
    AlignmentFailed { sensor: usize, reason: String },
}

impl Error {
    /// Creates a format error.
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Creates a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an event consistency error.
    pub fn event(msg: impl Into<String>) -> Self {
        Self::Event(msg.into())
    }
}
