//! Frame ingestion sources.
//!
//! This module provides the sources the pipeline pulls frames from:
//! - Synthetic scenes (`stub://name`), for demos and tests
//! - Recorded image sequences (a directory of png/jpg files)
//! - USB/V4L2 devices (feature: ingest-v4l2)
//!
//! The source is chosen once at startup from `source.uri`. All sources report
//! transient failures as `FrameError::Unavailable` so the capture controller
//! can count them, and `FrameError::Closed` when a finite source runs out.

pub mod sequence;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use std::path::Path;

use crate::config::SourceSettings;
use crate::error::FrameError;
use crate::frame::Frame;

pub use sequence::SequenceSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Something that produces frames on demand.
pub trait FrameSource: Send {
    /// Block until the next frame is available or acquisition fails.
    fn next_frame(&mut self) -> Result<Frame, FrameError>;

    /// Human-readable identifier for logs.
    fn name(&self) -> &str;

    fn stats(&self) -> SourceStats;

    /// Whether the source is currently delivering frames.
    fn is_healthy(&self) -> bool {
        self.stats().last_error.is_none()
    }
}

/// Counters shared by every source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub failures: u64,
    /// Reason of the most recent failure, cleared by the next good frame.
    pub last_error: Option<String>,
}

impl SourceStats {
    pub fn record_frame(&mut self) {
        self.frames_captured += 1;
        self.last_error = None;
    }

    pub fn record_failure(&mut self, reason: &str) {
        self.failures += 1;
        self.last_error = Some(reason.to_string());
    }
}

/// Open the source named by `settings.uri`.
pub fn open_source(settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    settings.validate()?;
    let uri = settings.uri.trim();

    if uri.starts_with("stub://") {
        let source = SyntheticSource::from_uri(uri, settings)?.paced();
        log::info!("frame source: {} (synthetic)", source.name());
        return Ok(Box::new(source));
    }

    if uri.starts_with("/dev/video") {
        return open_device(uri, settings);
    }

    if uri.contains("://") {
        return Err(anyhow!("unsupported frame source uri: {}", uri));
    }

    let path = Path::new(uri);
    if path.is_dir() {
        let source = SequenceSource::open(path, settings.loop_playback)?;
        log::info!(
            "frame source: {} ({} images, loop={})",
            source.name(),
            source.len(),
            settings.loop_playback
        );
        return Ok(Box::new(source));
    }

    Err(anyhow!(
        "frame source {} is neither a stub:// uri, a device node nor an image directory",
        uri
    ))
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(uri: &str, settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    let mut source = V4l2Source::new(v4l2::V4l2Config {
        device: uri.to_string(),
        target_fps: settings.target_fps,
        width: settings.width,
        height: settings.height,
    });
    source.connect()?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(uri: &str, _settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "{} requires the ingest-v4l2 feature (rebuild with --features ingest-v4l2)",
        uri
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(uri: &str) -> SourceSettings {
        SourceSettings {
            uri: uri.to_string(),
            width: 64,
            height: 48,
            ..SourceSettings::default()
        }
    }

    #[test]
    fn stub_uri_opens_synthetic_source() -> Result<()> {
        let mut source = open_source(&settings("stub://porch"))?;
        assert_eq!(source.name(), "stub://porch");
        let frame = source.next_frame()?;
        assert_eq!(frame.dimensions(), (64, 48));
        Ok(())
    }

    #[test]
    fn remote_schemes_are_rejected() {
        assert!(open_source(&settings("rtsp://camera.local/stream")).is_err());
    }

    #[test]
    fn missing_path_is_rejected() {
        assert!(open_source(&settings("/nonexistent/motion/frames")).is_err());
    }
}
