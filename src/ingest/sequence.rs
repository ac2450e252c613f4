//! Recorded image sequence source.
//!
//! Plays back the png/jpg files of a directory in file-name order. Files that
//! fail to decode are reported as transient failures so a corrupt frame in a
//! recording behaves like a camera hiccup.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::{FrameSource, SourceStats};
use crate::error::FrameError;
use crate::frame::Frame;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

pub struct SequenceSource {
    name: String,
    files: Vec<PathBuf>,
    position: usize,
    loop_playback: bool,
    sequence: u64,
    stats: SourceStats,
}

impl SequenceSource {
    pub fn open(dir: &Path, loop_playback: bool) -> Result<Self> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("read image directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && is_image(&path) {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(anyhow!("no png/jpg images found in {}", dir.display()));
        }
        files.sort();

        Ok(Self {
            name: dir.display().to_string(),
            files,
            position: 0,
            loop_playback,
            sequence: 0,
            stats: SourceStats::default(),
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for SequenceSource {
    fn next_frame(&mut self) -> Result<Frame, FrameError> {
        if self.position >= self.files.len() {
            if !self.loop_playback {
                return Err(FrameError::Closed);
            }
            log::debug!("{}: restarting playback", self.name);
            self.position = 0;
        }

        let path = &self.files[self.position];
        self.position += 1;
        let sequence = self.sequence;
        self.sequence += 1;

        match image::open(path) {
            Ok(decoded) => {
                self.stats.record_frame();
                Ok(Frame::from_rgb(decoded.to_rgb8(), sequence))
            }
            Err(err) => {
                let reason = format!("decode {}: {}", path.display(), err);
                self.stats.record_failure(&reason);
                Err(FrameError::unavailable(reason))
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)))
}
