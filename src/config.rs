use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_SOURCE_URI: &str = "stub://camera";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_MOTION_THRESHOLD: u64 = 1000;
const DEFAULT_MIN_AREA: u64 = 500;
const DEFAULT_BLUR_KERNEL_SIZE: u32 = 21;
const DEFAULT_DELTA_THRESHOLD: u32 = 25;
const DEFAULT_DILATE_ITERATIONS: u32 = 2;
const DEFAULT_LEARNING_RATE: f32 = 0.05;
const DEFAULT_STRONG_MOTION_FRACTION: f32 = 0.25;
const DEFAULT_STRONG_MOTION_LEARNING_RATE: f32 = 0.005;
const DEFAULT_PHOTO_DELAY_SECS: f64 = 5.0;
const DEFAULT_WARMUP_FRAMES: u32 = 30;
const DEFAULT_ERROR_RETRY_LIMIT: u32 = 5;
const DEFAULT_RETRY_DELAY_MS: u64 = 100;
const DEFAULT_OUTPUT_DIRECTORY: &str = "data/captured_images";
const DEFAULT_PHOTO_QUALITY: u8 = 95;
const DEFAULT_MAX_PHOTOS: usize = 1000;
const DEFAULT_MAX_AGE_DAYS: u32 = 30;
const DEFAULT_PERFORMANCE_WINDOW: usize = 120;
const DEFAULT_PERFORMANCE_LOG_INTERVAL: u64 = 100;

// ----------------------------------------------------------------------------
// On-disk representation (every field optional, merged over defaults)
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct MotionConfigFile {
    source: Option<SourceConfigFile>,
    detection: Option<DetectionConfigFile>,
    capture: Option<CaptureConfigFile>,
    storage: Option<StorageConfigFile>,
    performance: Option<PerformanceConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    uri: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    loop_playback: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    motion_threshold: Option<u64>,
    min_area: Option<u64>,
    blur_kernel_size: Option<u32>,
    delta_threshold: Option<u32>,
    dilate_iterations: Option<u32>,
    learning_rate: Option<f32>,
    strong_motion_fraction: Option<f32>,
    strong_motion_learning_rate: Option<f32>,
    region_of_interest: Option<RegionOfInterest>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    photo_delay_secs: Option<f64>,
    warmup_frames: Option<u32>,
    error_retry_limit: Option<u32>,
    retry_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    output_directory: Option<PathBuf>,
    photo_format: Option<String>,
    photo_quality: Option<u8>,
    max_photos: Option<usize>,
    max_age_days: Option<u32>,
    cleanup_enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct PerformanceConfigFile {
    window: Option<usize>,
    log_interval: Option<u64>,
}

// ----------------------------------------------------------------------------
// Resolved settings handed to components
// ----------------------------------------------------------------------------

/// Fully resolved configuration.
#[derive(Debug, Clone, Default)]
pub struct MotionConfig {
    pub source: SourceSettings,
    pub detection: DetectionSettings,
    pub capture: CaptureSettings,
    pub storage: StorageSettings,
    pub performance: PerformanceSettings,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// `stub://name`, a directory of images, or a V4L2 device node.
    pub uri: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    /// Restart recorded sequences when they run out.
    pub loop_playback: bool,
}

/// Parameters of the background model and the motion analyzer.
#[derive(Debug, Clone)]
pub struct DetectionSettings {
    /// Minimum summed region area (pixels) for a motion verdict.
    pub motion_threshold: u64,
    /// Regions smaller than this many pixels are discarded.
    pub min_area: u64,
    /// Odd smoothing kernel size; 1 disables smoothing.
    pub blur_kernel_size: u32,
    /// Minimum absolute intensity difference for a changed pixel.
    pub delta_threshold: u32,
    pub dilate_iterations: u32,
    /// Running-average blend weight of a new frame.
    pub learning_rate: f32,
    /// Fraction of changed pixels above which a frame counts as strong motion.
    pub strong_motion_fraction: f32,
    /// Blend weight used for strong-motion frames (0 skips the blend).
    pub strong_motion_learning_rate: f32,
    pub region_of_interest: Option<RegionOfInterest>,
}

/// Rectangle (in frame pixels) outside which changes are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl RegionOfInterest {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x
            && y >= self.y
            && x - self.x < self.width
            && y - self.y < self.height
    }
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Minimum interval between two capture requests.
    pub photo_delay: Duration,
    /// Frames observed by the background model before detection starts.
    pub warmup_frames: u32,
    /// Consecutive acquisition failures that put the controller in ERROR.
    pub error_retry_limit: u32,
    /// Pause after a failed acquisition before the next cycle.
    pub retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub output_directory: PathBuf,
    pub photo_format: PhotoFormat,
    pub photo_quality: u8,
    pub max_photos: usize,
    /// Captures older than this many days are deleted (0 keeps them forever).
    pub max_age_days: u32,
    /// When false, neither the photo limit nor the age limit is enforced.
    pub cleanup_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct PerformanceSettings {
    /// Ring buffer capacity of the performance tracker.
    pub window: usize,
    /// Cycles between performance log lines (0 disables them).
    pub log_interval: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoFormat {
    Jpeg,
    Png,
}

impl PhotoFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            PhotoFormat::Jpeg => "jpg",
            PhotoFormat::Png => "png",
        }
    }
}

impl FromStr for PhotoFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(PhotoFormat::Jpeg),
            "png" => Ok(PhotoFormat::Png),
            other => Err(ConfigError::invalid(
                "storage.photo_format",
                format!("unsupported format '{}'", other),
            )),
        }
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            uri: DEFAULT_SOURCE_URI.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            target_fps: DEFAULT_TARGET_FPS,
            loop_playback: false,
        }
    }
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            motion_threshold: DEFAULT_MOTION_THRESHOLD,
            min_area: DEFAULT_MIN_AREA,
            blur_kernel_size: DEFAULT_BLUR_KERNEL_SIZE,
            delta_threshold: DEFAULT_DELTA_THRESHOLD,
            dilate_iterations: DEFAULT_DILATE_ITERATIONS,
            learning_rate: DEFAULT_LEARNING_RATE,
            strong_motion_fraction: DEFAULT_STRONG_MOTION_FRACTION,
            strong_motion_learning_rate: DEFAULT_STRONG_MOTION_LEARNING_RATE,
            region_of_interest: None,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            photo_delay: Duration::from_secs_f64(DEFAULT_PHOTO_DELAY_SECS),
            warmup_frames: DEFAULT_WARMUP_FRAMES,
            error_retry_limit: DEFAULT_ERROR_RETRY_LIMIT,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            output_directory: PathBuf::from(DEFAULT_OUTPUT_DIRECTORY),
            photo_format: PhotoFormat::Jpeg,
            photo_quality: DEFAULT_PHOTO_QUALITY,
            max_photos: DEFAULT_MAX_PHOTOS,
            max_age_days: DEFAULT_MAX_AGE_DAYS,
            cleanup_enabled: true,
        }
    }
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            window: DEFAULT_PERFORMANCE_WINDOW,
            log_interval: DEFAULT_PERFORMANCE_LOG_INTERVAL,
        }
    }
}

// ----------------------------------------------------------------------------
// Validation
// ----------------------------------------------------------------------------

impl SourceSettings {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.uri.trim().is_empty() {
            return Err(ConfigError::invalid("source.uri", "must not be empty"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::invalid(
                "source.resolution",
                "width and height must be positive",
            ));
        }
        if self.target_fps == 0 {
            return Err(ConfigError::invalid("source.target_fps", "must be positive"));
        }
        Ok(())
    }
}

impl DetectionSettings {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.blur_kernel_size == 0 || self.blur_kernel_size % 2 == 0 {
            return Err(ConfigError::invalid(
                "detection.blur_kernel_size",
                format!("must be positive and odd, got {}", self.blur_kernel_size),
            ));
        }
        if self.motion_threshold == 0 {
            return Err(ConfigError::invalid(
                "detection.motion_threshold",
                "must be positive",
            ));
        }
        if self.min_area == 0 {
            return Err(ConfigError::invalid("detection.min_area", "must be positive"));
        }
        if !(1..=255).contains(&self.delta_threshold) {
            return Err(ConfigError::invalid(
                "detection.delta_threshold",
                format!("must be within 1..=255, got {}", self.delta_threshold),
            ));
        }
        if self.dilate_iterations > u8::MAX as u32 {
            return Err(ConfigError::invalid(
                "detection.dilate_iterations",
                format!("must be at most {}", u8::MAX),
            ));
        }
        check_rate("detection.learning_rate", self.learning_rate)?;
        check_rate(
            "detection.strong_motion_learning_rate",
            self.strong_motion_learning_rate,
        )?;
        if !(self.strong_motion_fraction > 0.0 && self.strong_motion_fraction <= 1.0) {
            return Err(ConfigError::invalid(
                "detection.strong_motion_fraction",
                "must be within (0, 1]",
            ));
        }
        if let Some(roi) = self.region_of_interest {
            if roi.width == 0 || roi.height == 0 {
                return Err(ConfigError::invalid(
                    "detection.region_of_interest",
                    "must have a positive width and height",
                ));
            }
        }
        Ok(())
    }
}

fn check_rate(field: &'static str, rate: f32) -> std::result::Result<(), ConfigError> {
    if rate.is_finite() && (0.0..=1.0).contains(&rate) {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be within [0, 1], got {}", rate)))
    }
}

impl CaptureSettings {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.warmup_frames == 0 {
            return Err(ConfigError::invalid("capture.warmup_frames", "must be at least 1"));
        }
        if self.error_retry_limit == 0 {
            return Err(ConfigError::invalid(
                "capture.error_retry_limit",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

impl StorageSettings {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !(1..=100).contains(&self.photo_quality) {
            return Err(ConfigError::invalid(
                "storage.photo_quality",
                "must be within 1..=100",
            ));
        }
        if self.max_photos == 0 {
            return Err(ConfigError::invalid("storage.max_photos", "must be positive"));
        }
        Ok(())
    }
}

impl PerformanceSettings {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.window < 2 {
            return Err(ConfigError::invalid("performance.window", "must be at least 2"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Loading
// ----------------------------------------------------------------------------

impl MotionConfig {
    /// Load configuration from `path` (or `MOTION_CONFIG`), then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("MOTION_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => read_config_file(&path)?,
            None => MotionConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MotionConfigFile) -> Result<Self> {
        let source = file.source.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let capture = file.capture.unwrap_or_default();
        let storage = file.storage.unwrap_or_default();
        let performance = file.performance.unwrap_or_default();

        let photo_delay_secs = capture.photo_delay_secs.unwrap_or(DEFAULT_PHOTO_DELAY_SECS);
        if !photo_delay_secs.is_finite() || photo_delay_secs < 0.0 {
            return Err(anyhow!("capture.photo_delay_secs cannot be negative"));
        }
        let photo_format = match storage.photo_format {
            Some(format) => format.parse()?,
            None => PhotoFormat::Jpeg,
        };

        Ok(Self {
            source: SourceSettings {
                uri: source.uri.unwrap_or_else(|| DEFAULT_SOURCE_URI.to_string()),
                width: source.width.unwrap_or(DEFAULT_WIDTH),
                height: source.height.unwrap_or(DEFAULT_HEIGHT),
                target_fps: source.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
                loop_playback: source.loop_playback.unwrap_or(false),
            },
            detection: DetectionSettings {
                motion_threshold: detection
                    .motion_threshold
                    .unwrap_or(DEFAULT_MOTION_THRESHOLD),
                min_area: detection.min_area.unwrap_or(DEFAULT_MIN_AREA),
                blur_kernel_size: detection
                    .blur_kernel_size
                    .unwrap_or(DEFAULT_BLUR_KERNEL_SIZE),
                delta_threshold: detection.delta_threshold.unwrap_or(DEFAULT_DELTA_THRESHOLD),
                dilate_iterations: detection
                    .dilate_iterations
                    .unwrap_or(DEFAULT_DILATE_ITERATIONS),
                learning_rate: detection.learning_rate.unwrap_or(DEFAULT_LEARNING_RATE),
                strong_motion_fraction: detection
                    .strong_motion_fraction
                    .unwrap_or(DEFAULT_STRONG_MOTION_FRACTION),
                strong_motion_learning_rate: detection
                    .strong_motion_learning_rate
                    .unwrap_or(DEFAULT_STRONG_MOTION_LEARNING_RATE),
                region_of_interest: detection.region_of_interest,
            },
            capture: CaptureSettings {
                photo_delay: Duration::from_secs_f64(photo_delay_secs),
                warmup_frames: capture.warmup_frames.unwrap_or(DEFAULT_WARMUP_FRAMES),
                error_retry_limit: capture
                    .error_retry_limit
                    .unwrap_or(DEFAULT_ERROR_RETRY_LIMIT),
                retry_delay: Duration::from_millis(
                    capture.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
                ),
            },
            storage: StorageSettings {
                output_directory: storage
                    .output_directory
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIRECTORY)),
                photo_format,
                photo_quality: storage.photo_quality.unwrap_or(DEFAULT_PHOTO_QUALITY),
                max_photos: storage.max_photos.unwrap_or(DEFAULT_MAX_PHOTOS),
                max_age_days: storage.max_age_days.unwrap_or(DEFAULT_MAX_AGE_DAYS),
                cleanup_enabled: storage.cleanup_enabled.unwrap_or(true),
            },
            performance: PerformanceSettings {
                window: performance.window.unwrap_or(DEFAULT_PERFORMANCE_WINDOW),
                log_interval: performance
                    .log_interval
                    .unwrap_or(DEFAULT_PERFORMANCE_LOG_INTERVAL),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(uri) = std::env::var("MOTION_SOURCE") {
            if !uri.trim().is_empty() {
                self.source.uri = uri;
            }
        }
        if let Ok(dir) = std::env::var("MOTION_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.storage.output_directory = PathBuf::from(dir);
            }
        }
        if let Ok(delay) = std::env::var("MOTION_PHOTO_DELAY_SECS") {
            let secs: f64 = delay
                .parse()
                .map_err(|_| anyhow!("MOTION_PHOTO_DELAY_SECS must be a number of seconds"))?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(anyhow!("MOTION_PHOTO_DELAY_SECS cannot be negative"));
            }
            self.capture.photo_delay = Duration::from_secs_f64(secs);
        }
        if let Ok(max) = std::env::var("MOTION_MAX_PHOTOS") {
            self.storage.max_photos = max
                .parse()
                .map_err(|_| anyhow!("MOTION_MAX_PHOTOS must be an integer"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.source.validate()?;
        self.detection.validate()?;
        if let Some(roi) = self.detection.region_of_interest {
            let fits = roi.x as u64 + roi.width as u64 <= self.source.width as u64
                && roi.y as u64 + roi.height as u64 <= self.source.height as u64;
            if !fits {
                return Err(ConfigError::invalid(
                    "detection.region_of_interest",
                    format!(
                        "{}x{}+{}+{} does not fit a {}x{} frame",
                        roi.width,
                        roi.height,
                        roi.x,
                        roi.y,
                        self.source.width,
                        self.source.height
                    ),
                ));
            }
        }
        self.capture.validate()?;
        self.storage.validate()?;
        self.performance.validate()?;
        Ok(())
    }

    /// Human-readable summary logged at startup.
    pub fn summary(&self) -> String {
        format!(
            "source={} {}x{}@{}fps | threshold={} min_area={} blur={} delta={} dilate={} | \
             photo_delay={:.1}s warmup={} retry_limit={} | output={} format={} quality={} \
             max_photos={} max_age_days={} cleanup={}",
            self.source.uri,
            self.source.width,
            self.source.height,
            self.source.target_fps,
            self.detection.motion_threshold,
            self.detection.min_area,
            self.detection.blur_kernel_size,
            self.detection.delta_threshold,
            self.detection.dilate_iterations,
            self.capture.photo_delay.as_secs_f64(),
            self.capture.warmup_frames,
            self.capture.error_retry_limit,
            self.storage.output_directory.display(),
            self.storage.photo_format.extension(),
            self.storage.photo_quality,
            self.storage.max_photos,
            self.storage.max_age_days,
            self.storage.cleanup_enabled,
        )
    }
}

fn read_config_file(path: &Path) -> Result<MotionConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
