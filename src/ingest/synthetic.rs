//! Synthetic frame source (`stub://`).
//!
//! Renders a static, slightly noisy scene in which a bright block sweeps
//! across the frame at regular intervals. Noise stays well below the default
//! delta threshold so only the block registers as motion.
//!
//! Query parameters:
//! - `dropout=N`: fail N consecutive frames every 300 frames
//! - `seed=S`: noise seed (defaults to a hash of the name)

use anyhow::{anyhow, Result};
use image::{GrayImage, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

use super::{FrameSource, SourceStats};
use crate::config::SourceSettings;
use crate::error::FrameError;
use crate::frame::Frame;

/// Frames between two motion events.
const EVENT_PERIOD: u64 = 150;
/// Frames a motion event lasts.
const EVENT_LENGTH: u64 = 45;
const DROPOUT_PERIOD: u64 = 300;
const NOISE_AMPLITUDE: i16 = 3;
const BLOCK_INTENSITY: u8 = 235;

pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    frame_interval: Duration,
    paced: bool,
    next_due: Option<Instant>,
    dropout: u64,
    rng: StdRng,
    scene: GrayImage,
    tick: u64,
    stats: SourceStats,
}

impl SyntheticSource {
    pub fn new(name: impl Into<String>, settings: &SourceSettings) -> Self {
        let name = name.into();
        let seed = name
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100_0000_01b3));
        Self::with_seed(name, settings, seed)
    }

    pub fn with_seed(name: impl Into<String>, settings: &SourceSettings, seed: u64) -> Self {
        let (width, height) = (settings.width, settings.height);
        Self {
            name: name.into(),
            width,
            height,
            frame_interval: Duration::from_secs_f64(1.0 / settings.target_fps.max(1) as f64),
            paced: false,
            next_due: None,
            dropout: 0,
            rng: StdRng::seed_from_u64(seed),
            scene: render_scene(width, height),
            tick: 0,
            stats: SourceStats::default(),
        }
    }

    /// Parse `stub://name?dropout=N&seed=S`.
    pub fn from_uri(uri: &str, settings: &SourceSettings) -> Result<Self> {
        let rest = uri
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("not a stub:// uri: {}", uri))?;
        let (name, query) = match rest.split_once('?') {
            Some((name, query)) => (name, Some(query)),
            None => (rest, None),
        };
        let name = format!("stub://{}", name);

        let mut dropout = 0;
        let mut seed = None;
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed stub parameter '{}'", pair))?;
            match key {
                "dropout" => {
                    dropout = value
                        .parse()
                        .map_err(|_| anyhow!("stub dropout must be an integer, got '{}'", value))?
                }
                "seed" => {
                    seed = Some(
                        value
                            .parse()
                            .map_err(|_| anyhow!("stub seed must be an integer, got '{}'", value))?,
                    )
                }
                other => return Err(anyhow!("unknown stub parameter '{}'", other)),
            }
        }
        if dropout >= DROPOUT_PERIOD {
            return Err(anyhow!("stub dropout must be below {}", DROPOUT_PERIOD));
        }

        let source = match seed {
            Some(seed) => Self::with_seed(name, settings, seed),
            None => Self::new(name, settings),
        };
        Ok(source.with_dropout(dropout))
    }

    pub fn with_dropout(mut self, frames: u64) -> Self {
        self.dropout = frames;
        self
    }

    /// Deliver frames no faster than the configured frame rate.
    pub fn paced(mut self) -> Self {
        self.paced = true;
        self
    }

    fn wait_for_slot(&mut self) {
        if !self.paced {
            return;
        }
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(self.next_due.unwrap_or(now).max(now) + self.frame_interval);
    }

    fn in_dropout(&self) -> bool {
        // Skip the very first window so the background can seed.
        self.dropout > 0
            && self.tick >= DROPOUT_PERIOD
            && self.tick % DROPOUT_PERIOD < self.dropout
    }

    /// Bounding box of the moving block at the current tick, if any.
    fn block(&self) -> Option<(u32, u32, u32, u32)> {
        let phase = self.tick % EVENT_PERIOD;
        if self.tick < EVENT_PERIOD || phase >= EVENT_LENGTH {
            return None;
        }
        let bw = (self.width / 6).max(1);
        let bh = (self.height / 5).max(1);
        let travel = self.width.saturating_sub(bw) as u64;
        let x = (travel * phase / (EVENT_LENGTH - 1)) as u32;
        let y = (self.height - bh) / 2;
        Some((x, y, bw, bh))
    }

    fn render(&mut self) -> GrayImage {
        let block = self.block();
        let mut image = self.scene.clone();
        for (x, y, px) in image.enumerate_pixels_mut() {
            let inside = block
                .map(|(bx, by, bw, bh)| x >= bx && x < bx + bw && y >= by && y < by + bh)
                .unwrap_or(false);
            if inside {
                px[0] = BLOCK_INTENSITY;
            } else {
                let noise = self.rng.gen_range(-NOISE_AMPLITUDE..=NOISE_AMPLITUDE);
                px[0] = (px[0] as i16 + noise).clamp(0, 255) as u8;
            }
        }
        image
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Frame, FrameError> {
        self.wait_for_slot();
        let tick = self.tick;

        if self.in_dropout() {
            self.tick += 1;
            let reason = format!("{}: simulated dropout at frame {}", self.name, tick);
            self.stats.record_failure(&reason);
            return Err(FrameError::unavailable(reason));
        }

        let gray = self.render();
        self.tick += 1;
        self.stats.record_frame();
        Ok(Frame::from_gray(gray, tick))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> SourceStats {
        self.stats.clone()
    }
}

/// Horizontal gradient with a darker floor band.
fn render_scene(width: u32, height: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        let base = 60 + (x * 80 / width.max(1)) as u8;
        if y > height * 4 / 5 {
            Luma([base / 2])
        } else {
            Luma([base])
        }
    })
}
