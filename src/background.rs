//! Rolling background reference.
//!
//! The model keeps a floating-point running average of the scene at rest.
//! New frames are blended in with `learning_rate`; frames flagged as strong
//! motion are blended at `strong_motion_learning_rate` (or skipped) so a moving
//! object does not become part of the reference.

use image::{GrayImage, Luma};

use crate::config::DetectionSettings;
use crate::detect::MotionResult;
use crate::error::{ConfigError, NotReady};
use crate::frame::Frame;

/// How a frame was folded into the reference.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BlendRate {
    /// The frame replaced the reference wholesale.
    Seeded,
    Normal(f32),
    /// Strong motion: reduced rate.
    Slow(f32),
    /// Strong motion with a zero slow rate; the reference is unchanged.
    Skipped,
}

struct Accumulator {
    width: u32,
    height: u32,
    values: Vec<f32>,
}

impl Accumulator {
    fn seed(frame: &Frame) -> Self {
        Self {
            width: frame.width(),
            height: frame.height(),
            values: frame.gray().as_raw().iter().map(|&p| p as f32).collect(),
        }
    }

    fn matches(&self, frame: &Frame) -> bool {
        (self.width, self.height) == frame.dimensions()
    }

    fn blend(&mut self, frame: &Frame, rate: f32) {
        for (acc, &px) in self.values.iter_mut().zip(frame.gray().as_raw()) {
            *acc += rate * (px as f32 - *acc);
        }
    }
}

pub struct BackgroundModel {
    accumulator: Option<Accumulator>,
    observed: u32,
    warmup_frames: u32,
    learning_rate: f32,
    strong_motion_fraction: f32,
    strong_motion_learning_rate: f32,
}

impl BackgroundModel {
    pub fn new(settings: &DetectionSettings, warmup_frames: u32) -> Result<Self, ConfigError> {
        settings.validate()?;
        if warmup_frames == 0 {
            return Err(ConfigError::invalid("capture.warmup_frames", "must be at least 1"));
        }
        Ok(Self {
            accumulator: None,
            observed: 0,
            warmup_frames,
            learning_rate: settings.learning_rate,
            strong_motion_fraction: settings.strong_motion_fraction,
            strong_motion_learning_rate: settings.strong_motion_learning_rate,
        })
    }

    /// Blend a frame at the normal rate. The first frame after a reset seeds
    /// the reference.
    pub fn observe(&mut self, frame: &Frame) -> BlendRate {
        self.blend(frame, self.learning_rate)
    }

    /// Blend a frame that has been analyzed against the current reference.
    pub fn observe_analyzed(&mut self, frame: &Frame, result: &MotionResult) -> BlendRate {
        if result.changed_fraction >= self.strong_motion_fraction {
            log::debug!(
                "strong motion ({:.1}% of frame changed), slowing background update",
                result.changed_fraction * 100.0
            );
            self.blend(frame, self.strong_motion_learning_rate)
        } else {
            self.blend(frame, self.learning_rate)
        }
    }

    fn blend(&mut self, frame: &Frame, rate: f32) -> BlendRate {
        self.observed = self.observed.saturating_add(1);

        match self.accumulator.as_mut() {
            Some(acc) if acc.matches(frame) => {
                if rate <= 0.0 {
                    BlendRate::Skipped
                } else {
                    acc.blend(frame, rate);
                    if rate < self.learning_rate {
                        BlendRate::Slow(rate)
                    } else {
                        BlendRate::Normal(rate)
                    }
                }
            }
            Some(acc) => {
                log::warn!(
                    "frame size changed from {}x{} to {}x{}, reseeding background",
                    acc.width,
                    acc.height,
                    frame.width(),
                    frame.height()
                );
                self.observed = 1;
                self.accumulator = Some(Accumulator::seed(frame));
                BlendRate::Seeded
            }
            None => {
                self.accumulator = Some(Accumulator::seed(frame));
                log::info!(
                    "background initialized from frame #{} ({}x{})",
                    frame.sequence(),
                    frame.width(),
                    frame.height()
                );
                BlendRate::Seeded
            }
        }
    }

    /// Discard the reference; the next observed frame seeds it.
    pub fn reset(&mut self) {
        self.accumulator = None;
        self.observed = 0;
        log::info!("background reset requested");
    }

    /// Current reference rounded to 8-bit intensities.
    pub fn reference(&self) -> Result<GrayImage, NotReady> {
        let acc = self.accumulator.as_ref().ok_or(NotReady)?;
        Ok(GrayImage::from_fn(acc.width, acc.height, |x, y| {
            let v = acc.values[(y * acc.width + x) as usize];
            Luma([v.round().clamp(0.0, 255.0) as u8])
        }))
    }

    pub fn is_ready(&self) -> bool {
        self.accumulator.is_some()
    }

    /// True once `warmup_frames` frames were observed since the last reset.
    pub fn is_warmed_up(&self) -> bool {
        self.is_ready() && self.observed >= self.warmup_frames
    }

    pub fn warmup_remaining(&self) -> u32 {
        self.warmup_frames.saturating_sub(self.observed)
    }

    pub fn observed_frames(&self) -> u32 {
        self.observed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(warmup: u32) -> BackgroundModel {
        BackgroundModel::new(&DetectionSettings::default(), warmup).unwrap()
    }

    #[test]
    fn reference_requires_a_frame() {
        let mut bg = model(3);
        assert_eq!(bg.reference().unwrap_err(), NotReady);

        bg.observe(&Frame::solid(8, 8, 40, 0));
        assert!(bg.is_ready());
        assert!(!bg.is_warmed_up());
        assert_eq!(bg.warmup_remaining(), 2);
        assert_eq!(bg.reference().unwrap().get_pixel(3, 3)[0], 40);
    }

    #[test]
    fn warm_up_completes_after_configured_frames() {
        let mut bg = model(3);
        for i in 0..3 {
            assert!(!bg.is_warmed_up());
            bg.observe(&Frame::solid(8, 8, 40, i));
        }
        assert!(bg.is_warmed_up());
        assert_eq!(bg.warmup_remaining(), 0);
        assert_eq!(bg.observed_frames(), 3);
    }

    #[test]
    fn reset_then_identical_frames_converges_immediately() {
        let mut bg = model(1);
        for i in 0..20 {
            bg.observe(&Frame::solid(8, 8, 10, i));
        }
        bg.reset();
        assert!(!bg.is_ready());
        assert_eq!(bg.observed_frames(), 0);

        let target = Frame::solid(8, 8, 180, 100);
        assert_eq!(bg.observe(&target), BlendRate::Seeded);
        for i in 0..5 {
            bg.observe(&Frame::solid(8, 8, 180, 101 + i));
            assert_eq!(&bg.reference().unwrap(), target.gray());
        }
    }

    #[test]
    fn drift_is_absorbed_within_blend_bound() {
        // At a 0.05 rate a full-scale step needs 122 blends to round to the target.
        let mut bg = model(1);
        bg.observe(&Frame::solid(4, 4, 0, 0));

        for i in 0..10 {
            bg.observe(&Frame::solid(4, 4, 255, 1 + i));
        }
        assert!(bg.reference().unwrap().get_pixel(0, 0)[0] < 255);

        for i in 0..140 {
            bg.observe(&Frame::solid(4, 4, 255, 20 + i));
        }
        assert!(bg.reference().unwrap().pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn strong_motion_slows_the_update() {
        let mut bg = model(1);
        bg.observe(&Frame::solid(4, 4, 0, 0));

        let strong = MotionResult {
            changed_fraction: 0.9,
            ..MotionResult::default()
        };
        let rate = bg.observe_analyzed(&Frame::solid(4, 4, 200, 1), &strong);
        assert_eq!(rate, BlendRate::Slow(0.005));
        assert_eq!(bg.reference().unwrap().get_pixel(0, 0)[0], 1);

        let calm = MotionResult::default();
        let rate = bg.observe_analyzed(&Frame::solid(4, 4, 200, 2), &calm);
        assert_eq!(rate, BlendRate::Normal(0.05));
    }

    #[test]
    fn zero_slow_rate_skips_strong_motion_frames() {
        let settings = DetectionSettings {
            strong_motion_learning_rate: 0.0,
            ..DetectionSettings::default()
        };
        let mut bg = BackgroundModel::new(&settings, 1).unwrap();
        bg.observe(&Frame::solid(4, 4, 30, 0));

        let strong = MotionResult {
            changed_fraction: 1.0,
            ..MotionResult::default()
        };
        assert_eq!(
            bg.observe_analyzed(&Frame::solid(4, 4, 250, 1), &strong),
            BlendRate::Skipped
        );
        assert_eq!(bg.reference().unwrap().get_pixel(2, 2)[0], 30);
    }

    #[test]
    fn size_change_reseeds() {
        let mut bg = model(2);
        bg.observe(&Frame::solid(4, 4, 30, 0));
        bg.observe(&Frame::solid(4, 4, 30, 1));
        assert!(bg.is_warmed_up());

        assert_eq!(bg.observe(&Frame::solid(6, 6, 90, 2)), BlendRate::Seeded);
        assert!(!bg.is_warmed_up());
        assert_eq!(bg.reference().unwrap().dimensions(), (6, 6));
    }
}
