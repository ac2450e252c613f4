//! Frames flowing through the detection pipeline.
//!
//! - `Frame`: immutable timestamped grayscale grid, optionally carrying the
//!   color image it was derived from for output.
//!
//! Sources construct frames; the pipeline borrows them for one cycle and wraps
//! them in `Arc` when a capture request or preview snapshot must outlive it.

use image::{DynamicImage, GrayImage, Luma, RgbImage};
use std::fmt;
use std::time::{Instant, SystemTime};

/// Immutable video frame. There are no mutating accessors.
#[derive(Clone)]
pub struct Frame {
    gray: GrayImage,
    color: Option<RgbImage>,
    captured_at: Instant,
    captured_wall: SystemTime,
    sequence: u64,
}

impl Frame {
    /// Frame from an analysis-ready grayscale image, captured now.
    pub fn from_gray(gray: GrayImage, sequence: u64) -> Self {
        Self {
            gray,
            color: None,
            captured_at: Instant::now(),
            captured_wall: SystemTime::now(),
            sequence,
        }
    }

    /// Frame from a color image. The grayscale plane is derived once here.
    pub fn from_rgb(color: RgbImage, sequence: u64) -> Self {
        let gray = image::imageops::grayscale(&color);
        Self {
            gray,
            color: Some(color),
            captured_at: Instant::now(),
            captured_wall: SystemTime::now(),
            sequence,
        }
    }

    /// Uniform grayscale frame.
    pub fn solid(width: u32, height: u32, intensity: u8, sequence: u64) -> Self {
        Self::from_gray(
            GrayImage::from_pixel(width, height, Luma([intensity])),
            sequence,
        )
    }

    /// Override the monotonic capture instant (replayed or scripted sources).
    pub fn with_captured_at(mut self, captured_at: Instant) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn width(&self) -> u32 {
        self.gray.width()
    }

    pub fn height(&self) -> u32 {
        self.gray.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.gray.dimensions()
    }

    pub fn pixel_count(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// Grayscale plane used for analysis.
    pub fn gray(&self) -> &GrayImage {
        &self.gray
    }

    pub fn color(&self) -> Option<&RgbImage> {
        self.color.as_ref()
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn captured_wall(&self) -> SystemTime {
        self.captured_wall
    }

    /// Source-assigned sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Color image for output; grayscale frames are expanded to RGB.
    pub fn to_rgb(&self) -> RgbImage {
        match &self.color {
            Some(color) => color.clone(),
            None => DynamicImage::ImageLuma8(self.gray.clone()).to_rgb8(),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("color", &self.color.is_some())
            .finish()
    }
}
