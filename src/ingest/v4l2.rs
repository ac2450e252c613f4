//! V4L2 frame source.
//!
//! This module provides `V4l2Source` for capturing frames from local V4L2
//! devices (e.g. /dev/video0) in RGB3. Capture errors drop the stream and are
//! reported as `FrameError::Unavailable`; the next call reconnects, so a
//! briefly unplugged camera recovers without restarting the daemon.

use anyhow::{Context, Result};
use image::RgbImage;
use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::{FrameSource, SourceStats};
use crate::error::FrameError;
use crate::frame::Frame;

/// Configuration for a V4L2 source.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    pub target_fps: u32,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

pub struct V4l2Source {
    config: V4l2Config,
    state: Option<DeviceState>,
    sequence: u64,
    last_frame_at: Option<Instant>,
    active_width: u32,
    active_height: u32,
    stats: SourceStats,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            sequence: 0,
            last_frame_at: None,
            stats: SourceStats::default(),
        }
    }

    /// Open the device and start streaming.
    pub fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    self.config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        if format.fourcc != v4l::FourCC::new(b"RGB3") {
            log::warn!(
                "V4l2Source: {} negotiated {} instead of RGB3; frames will be rejected",
                self.config.device,
                format.fourcc
            );
        }

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.config.device,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: connected to {} ({}x{})",
            self.config.device,
            self.active_width,
            self.active_height
        );
        Ok(())
    }

    /// How long the device may go without a frame before it counts as stalled.
    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            2_000
        } else {
            (1000 / self.config.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }

    fn fail(&mut self, reason: String) -> FrameError {
        self.stats.record_failure(&reason);
        FrameError::unavailable(reason)
    }

    fn capture(&mut self) -> Result<RgbImage, String> {
        use v4l::io::traits::CaptureStream;

        let (width, height) = (self.active_width, self.active_height);
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| "device not connected".to_string())?;
        let pixels = state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|err| format!("capture v4l2 frame: {}", err))?;

        let expected = width as usize * height as usize * 3;
        if pixels.len() < expected {
            return Err(format!(
                "short v4l2 buffer: {} bytes, expected {}",
                pixels.len(),
                expected
            ));
        }
        RgbImage::from_raw(width, height, pixels[..expected].to_vec())
            .ok_or_else(|| "v4l2 buffer does not match frame size".to_string())
    }
}

impl FrameSource for V4l2Source {
    fn next_frame(&mut self) -> Result<Frame, FrameError> {
        if self.state.is_none() {
            if let Err(err) = self.connect() {
                return Err(self.fail(format!("reconnect {}: {:#}", self.config.device, err)));
            }
        }

        match self.capture() {
            Ok(color) => {
                self.stats.record_frame();
                self.last_frame_at = Some(Instant::now());
                let frame = Frame::from_rgb(color, self.sequence);
                self.sequence += 1;
                Ok(frame)
            }
            Err(reason) => {
                // Drop the stream so the next call reopens the device.
                self.state = None;
                Err(self.fail(reason))
            }
        }
    }

    fn name(&self) -> &str {
        &self.config.device
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }

    fn is_healthy(&self) -> bool {
        if self.stats.last_error.is_some() {
            return false;
        }
        self.last_frame_at
            .map_or(true, |at| at.elapsed() <= self.health_grace())
    }
}
