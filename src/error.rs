//! Error types shared across the detection core.
//!
//! The core reports failures as explicit values. Transient acquisition errors
//! are counted by the capture controller, configuration errors stop the
//! pipeline before its first cycle, and an unseeded background is reported as
//! `NotReady` rather than as a failure.

use thiserror::Error;

/// Failure to obtain a frame from a `FrameSource`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Transient hardware or driver error. The next cycle may succeed.
    #[error("frame source unavailable: {0}")]
    Unavailable(String),

    /// The source has no more frames (end of a recorded sequence).
    #[error("frame source closed")]
    Closed,
}

impl FrameError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        FrameError::Unavailable(reason.into())
    }
}

/// A configuration value that makes detection meaningless.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// The background model has not observed any frame since construction or reset.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("background model not ready")]
pub struct NotReady;
