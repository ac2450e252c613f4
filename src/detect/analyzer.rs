//! Frame-differencing motion analyzer.
//!
//! For each frame:
//! 1. Gaussian-smooth frame and reference with the configured kernel size
//! 2. Absolute per-pixel difference, binarized at `delta_threshold`
//! 3. Drop changes outside the region of interest
//! 4. 3x3 close/open to remove speckle, then dilate to merge fragments
//! 5. 8-connected components, filtered by `min_area`
//! 6. Motion iff the summed surviving area reaches `motion_threshold`
//!
//! The analyzer holds only its settings, so `analyze` is a pure function of
//! its inputs.

use std::borrow::Cow;

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::{close, dilate, open};
use imageproc::region_labelling::{connected_components, Connectivity};

use super::result::{MotionRegion, MotionResult};
use crate::config::DetectionSettings;
use crate::error::ConfigError;
use crate::frame::Frame;

const CHANGED: u8 = 255;

pub struct MotionAnalyzer {
    settings: DetectionSettings,
}

impl MotionAnalyzer {
    pub fn new(settings: DetectionSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &DetectionSettings {
        &self.settings
    }

    /// Compare `frame` against the background reference.
    pub fn analyze(&self, frame: &Frame, background: &GrayImage) -> MotionResult {
        if frame.dimensions() != background.dimensions() {
            log::warn!(
                "frame #{} is {}x{} but background is {}x{}; skipping analysis",
                frame.sequence(),
                frame.width(),
                frame.height(),
                background.width(),
                background.height()
            );
            return MotionResult::default();
        }

        let current = self.smooth(frame.gray());
        let reference = self.smooth(background);

        let (mask, changed_pixels) = self.changed_mask(&current, &reference);
        if changed_pixels == 0 {
            return MotionResult::default();
        }

        let mask = self.merge_fragments(mask);
        let regions = self.extract_regions(&mask);
        let total_area: u64 = regions.iter().map(|r| r.area).sum();
        let motion_detected = total_area >= self.settings.motion_threshold;

        if motion_detected {
            log::debug!(
                "motion in frame #{}: area={} regions={}",
                frame.sequence(),
                total_area,
                regions.len()
            );
        }

        MotionResult {
            motion_detected,
            total_area,
            regions,
            changed_pixels,
            changed_fraction: changed_pixels as f32 / frame.pixel_count().max(1) as f32,
        }
    }

    fn smooth<'a>(&self, image: &'a GrayImage) -> Cow<'a, GrayImage> {
        match blur_sigma(self.settings.blur_kernel_size) {
            Some(sigma) => Cow::Owned(gaussian_blur_f32(image, sigma)),
            None => Cow::Borrowed(image),
        }
    }

    fn changed_mask(&self, current: &GrayImage, reference: &GrayImage) -> (GrayImage, u64) {
        let delta = self.settings.delta_threshold;
        let roi = self.settings.region_of_interest;
        let mut changed = 0u64;

        let mask = GrayImage::from_fn(current.width(), current.height(), |x, y| {
            let inside = roi.map_or(true, |r| r.contains(x, y));
            let diff = current.get_pixel(x, y)[0].abs_diff(reference.get_pixel(x, y)[0]);
            if inside && diff as u32 >= delta {
                changed += 1;
                Luma([CHANGED])
            } else {
                Luma([0])
            }
        });
        (mask, changed)
    }

    fn merge_fragments(&self, mask: GrayImage) -> GrayImage {
        let mask = close(&mask, Norm::LInf, 1);
        let mask = open(&mask, Norm::LInf, 1);
        match self.settings.dilate_iterations {
            0 => mask,
            // Validation caps iterations at u8::MAX.
            n => dilate(&mask, Norm::LInf, n.min(u8::MAX as u32) as u8),
        }
    }

    fn extract_regions(&self, mask: &GrayImage) -> Vec<MotionRegion> {
        // connected_components cannot label a single-pixel image.
        let labels = if mask.width() as u64 * (mask.height() as u64) < 2 {
            ImageBuffer::from_fn(mask.width(), mask.height(), |x, y| {
                Luma([u32::from(mask.get_pixel(x, y)[0] != 0)])
            })
        } else {
            connected_components(mask, Connectivity::Eight, Luma([0u8]))
        };

        let mut bounds: Vec<Option<Bounds>> = Vec::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let label = label[0] as usize;
            if label == 0 {
                continue;
            }
            if label >= bounds.len() {
                bounds.resize(label + 1, None);
            }
            match &mut bounds[label] {
                Some(b) => b.include(x, y),
                slot @ None => *slot = Some(Bounds::new(x, y)),
            }
        }

        let mut regions: Vec<MotionRegion> = bounds
            .into_iter()
            .flatten()
            .map(Bounds::into_region)
            .filter(|r| r.area >= self.settings.min_area)
            .collect();
        regions.sort_by(|a, b| {
            b.area
                .cmp(&a.area)
                .then(a.y.cmp(&b.y))
                .then(a.x.cmp(&b.x))
        });
        regions
    }
}

/// Gaussian sigma for an odd kernel size, using the usual
/// `0.3 * ((k - 1) / 2 - 1) + 0.8` rule. Kernel size 1 means no smoothing.
fn blur_sigma(kernel_size: u32) -> Option<f32> {
    if kernel_size <= 1 {
        return None;
    }
    let sigma = 0.3 * ((kernel_size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    Some(sigma.max(0.1))
}

#[derive(Clone, Copy)]
struct Bounds {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    area: u64,
}

impl Bounds {
    fn new(x: u32, y: u32) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
            area: 1,
        }
    }

    fn include(&mut self, x: u32, y: u32) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
        self.area += 1;
    }

    fn into_region(self) -> MotionRegion {
        MotionRegion {
            x: self.min_x,
            y: self.min_y,
            width: self.max_x - self.min_x + 1,
            height: self.max_y - self.min_y + 1,
            area: self.area,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionOfInterest;

    const W: u32 = 160;
    const H: u32 = 120;
    const BACKGROUND: u8 = 50;
    const OBJECT: u8 = 250;

    fn settings() -> DetectionSettings {
        DetectionSettings {
            motion_threshold: 1000,
            min_area: 500,
            blur_kernel_size: 5,
            delta_threshold: 25,
            dilate_iterations: 2,
            ..DetectionSettings::default()
        }
    }

    fn background() -> GrayImage {
        GrayImage::from_pixel(W, H, Luma([BACKGROUND]))
    }

    fn with_rects(rects: &[(u32, u32, u32, u32)]) -> Frame {
        let gray = GrayImage::from_fn(W, H, |x, y| {
            let inside = rects
                .iter()
                .any(|&(rx, ry, rw, rh)| x >= rx && x < rx + rw && y >= ry && y < ry + rh);
            Luma([if inside { OBJECT } else { BACKGROUND }])
        });
        Frame::from_gray(gray, 1)
    }

    #[test]
    fn identical_frames_report_no_motion() {
        let analyzer = MotionAnalyzer::new(settings()).unwrap();
        let bg = with_rects(&[(10, 10, 30, 30)]);

        let result = analyzer.analyze(&bg, bg.gray());
        assert!(!result.motion_detected);
        assert!(result.regions.is_empty());
        assert_eq!(result.changed_pixels, 0);
        assert_eq!(result.total_area, 0);
    }

    #[test]
    fn single_rectangle_yields_one_region() {
        let analyzer = MotionAnalyzer::new(settings()).unwrap();
        let frame = with_rects(&[(60, 40, 40, 40)]);

        let result = analyzer.analyze(&frame, &background());
        assert_eq!(result.regions.len(), 1);

        let region = result.regions[0];
        // Smoothing widens the changed area by a pixel or so and dilation by
        // two more on each side.
        assert!(region.area >= 40 * 40, "area {}", region.area);
        assert!(region.area <= 48 * 48, "area {}", region.area);
        assert!(region.x <= 60 && region.y <= 40);
        assert!(region.x + region.width >= 100 && region.y + region.height >= 80);
        assert_eq!(result.total_area, region.area);
        assert!(result.motion_detected);
    }

    #[test]
    fn region_below_min_area_is_discarded() {
        let analyzer = MotionAnalyzer::new(settings()).unwrap();
        let frame = with_rects(&[(70, 50, 10, 10)]);

        let result = analyzer.analyze(&frame, &background());
        assert!(result.changed_pixels > 0);
        assert!(result.regions.is_empty());
        assert!(!result.motion_detected);
    }

    #[test]
    fn surviving_region_below_motion_threshold_is_not_motion() {
        let analyzer = MotionAnalyzer::new(DetectionSettings {
            motion_threshold: 1500,
            ..settings()
        })
        .unwrap();
        let frame = with_rects(&[(60, 40, 30, 20)]);

        let result = analyzer.analyze(&frame, &background());
        assert_eq!(result.regions.len(), 1);
        assert!(result.total_area < 1500);
        assert!(!result.motion_detected);
    }

    #[test]
    fn verdict_uses_the_summed_area() {
        // Two regions, each under the threshold on its own.
        let analyzer = MotionAnalyzer::new(DetectionSettings {
            motion_threshold: 1500,
            ..settings()
        })
        .unwrap();
        let frame = with_rects(&[(10, 10, 30, 20), (110, 80, 30, 20)]);

        let result = analyzer.analyze(&frame, &background());
        assert_eq!(result.regions.len(), 2);
        assert!(result.regions.iter().all(|r| r.area < 1500));
        assert!(result.total_area >= 1500);
        assert!(result.motion_detected);
    }

    #[test]
    fn regions_are_ordered_largest_first() {
        let analyzer = MotionAnalyzer::new(settings()).unwrap();
        let frame = with_rects(&[(10, 10, 25, 25), (100, 60, 40, 40)]);

        let result = analyzer.analyze(&frame, &background());
        assert_eq!(result.regions.len(), 2);
        assert!(result.regions[0].area > result.regions[1].area);
        assert_eq!(result.largest_region(), Some(&result.regions[0]));
        assert!(result.regions[0].x >= 90);
    }

    #[test]
    fn changes_outside_region_of_interest_are_ignored() {
        let analyzer = MotionAnalyzer::new(DetectionSettings {
            region_of_interest: Some(RegionOfInterest {
                x: 0,
                y: 0,
                width: 80,
                height: H,
            }),
            ..settings()
        })
        .unwrap();
        let frame = with_rects(&[(100, 40, 40, 40)]);

        let result = analyzer.analyze(&frame, &background());
        assert_eq!(result.changed_pixels, 0);
        assert!(!result.motion_detected);
    }

    #[test]
    fn small_intensity_shifts_stay_below_delta() {
        let analyzer = MotionAnalyzer::new(settings()).unwrap();
        let frame = Frame::solid(W, H, BACKGROUND + 20, 1);

        let result = analyzer.analyze(&frame, &background());
        assert_eq!(result.changed_pixels, 0);
        assert!(!result.motion_detected);
    }

    #[test]
    fn analysis_is_repeatable() {
        let analyzer = MotionAnalyzer::new(settings()).unwrap();
        let frame = with_rects(&[(30, 30, 50, 35)]);
        let bg = background();

        assert_eq!(analyzer.analyze(&frame, &bg), analyzer.analyze(&frame, &bg));
    }

    #[test]
    fn mismatched_dimensions_are_not_motion() {
        let analyzer = MotionAnalyzer::new(settings()).unwrap();
        let frame = Frame::solid(80, 60, OBJECT, 1);

        let result = analyzer.analyze(&frame, &background());
        assert_eq!(result, MotionResult::default());
    }

    fn exact() -> DetectionSettings {
        DetectionSettings {
            motion_threshold: 100,
            min_area: 100,
            blur_kernel_size: 1,
            delta_threshold: 25,
            dilate_iterations: 0,
            ..DetectionSettings::default()
        }
    }

    fn block(value: u8) -> Frame {
        let gray = GrayImage::from_fn(W, H, |x, y| {
            let inside = (70..80).contains(&x) && (50..60).contains(&y);
            Luma([if inside { value } else { BACKGROUND }])
        });
        Frame::from_gray(gray, 1)
    }

    #[test]
    fn difference_equal_to_delta_counts_as_changed() {
        let analyzer = MotionAnalyzer::new(exact()).unwrap();

        let result = analyzer.analyze(&block(BACKGROUND + 25), &background());
        assert_eq!(result.changed_pixels, 100);

        let result = analyzer.analyze(&block(BACKGROUND + 24), &background());
        assert_eq!(result.changed_pixels, 0);
        assert!(!result.motion_detected);
    }

    #[test]
    fn region_of_exactly_min_area_survives_and_meets_threshold() {
        let analyzer = MotionAnalyzer::new(exact()).unwrap();

        let result = analyzer.analyze(&block(OBJECT), &background());
        assert_eq!(result.regions.len(), 1);
        let region = result.regions[0];
        assert_eq!((region.x, region.y, region.width, region.height), (70, 50, 10, 10));
        assert_eq!(region.area, 100);
        assert_eq!(region.area, region.bounding_area());
        assert_eq!(result.total_area, 100);
        assert!(result.motion_detected);
    }

    #[test]
    fn one_pixel_short_of_the_limits_is_rejected() {
        let analyzer = MotionAnalyzer::new(DetectionSettings {
            min_area: 101,
            ..exact()
        })
        .unwrap();
        let result = analyzer.analyze(&block(OBJECT), &background());
        assert!(result.regions.is_empty());
        assert!(!result.motion_detected);

        let analyzer = MotionAnalyzer::new(DetectionSettings {
            motion_threshold: 101,
            ..exact()
        })
        .unwrap();
        let result = analyzer.analyze(&block(OBJECT), &background());
        assert_eq!(result.total_area, 100);
        assert!(!result.motion_detected);
    }

    #[test]
    fn single_pixel_frames_are_analyzed() {
        for dilate_iterations in [0, 2] {
            let analyzer = MotionAnalyzer::new(DetectionSettings {
                motion_threshold: 1,
                min_area: 1,
                dilate_iterations,
                ..settings()
            })
            .unwrap();
            let bg = GrayImage::from_pixel(1, 1, Luma([BACKGROUND]));

            let result = analyzer.analyze(&Frame::solid(1, 1, OBJECT, 1), &bg);
            assert_eq!(result.changed_pixels, 1);
            assert_eq!(result.changed_fraction, 1.0);
            assert_eq!(result.regions.len(), 1);
            assert_eq!(result.regions[0].area, 1);
            assert!(result.motion_detected);

            let result = analyzer.analyze(&Frame::solid(1, 1, BACKGROUND, 2), &bg);
            assert_eq!(result, MotionResult::default());
        }
    }

    #[test]
    fn invalid_settings_fail_construction() {
        let err = MotionAnalyzer::new(DetectionSettings {
            blur_kernel_size: 4,
            ..settings()
        });
        assert!(err.is_err());
    }

    #[test]
    fn kernel_sigma_follows_size() {
        assert_eq!(blur_sigma(1), None);
        assert!((blur_sigma(3).unwrap() - 0.8).abs() < 1e-6);
        assert!((blur_sigma(21).unwrap() - 3.5).abs() < 1e-6);
    }
}
