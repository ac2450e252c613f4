//! Motion Sentinel
//!
//! Background-subtraction motion detection with debounced photo capture.
//!
//! # Architecture
//!
//! Each pipeline cycle pulls one frame and runs it through:
//!
//! 1. **BackgroundModel**: running average of the scene at rest, seeded on the
//!    first frame and warmed up before detection starts.
//! 2. **MotionAnalyzer**: smoothed frame difference, morphology and connected
//!    components filtered by minimum area.
//! 3. **CaptureController**: Idle/Armed/Cooldown/Error state machine that
//!    emits at most one capture request per `photo_delay`.
//! 4. **PerformanceTracker**: bounded window of cycle timings.
//!
//! Capture requests go to a `StorageWriter` thread over a channel; preview
//! consumers read the latest snapshot from a `PreviewSlot`.
//!
//! # Module Structure
//!
//! - `frame`: immutable timestamped frames
//! - `ingest`: frame sources (synthetic, image sequences, V4L2)
//! - `background`, `detect`, `capture`, `perf`: the detection core
//! - `pipeline`: cycle orchestration and cross-thread controls
//! - `storage`, `preview`: output collaborators
//! - `config`, `error`: settings and error types
//! - `diagnostics`: startup self-checks (source, output directory, disk space)

pub mod background;
pub mod capture;
pub mod config;
pub mod detect;
pub mod diagnostics;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod perf;
pub mod pipeline;
pub mod preview;
pub mod storage;

pub use background::{BackgroundModel, BlendRate};
pub use capture::{
    CaptureController, CaptureRequest, CaptureState, CaptureStats, CaptureTrigger, Observation,
};
pub use config::{
    CaptureSettings, DetectionSettings, MotionConfig, PerformanceSettings, PhotoFormat,
    RegionOfInterest, SourceSettings, StorageSettings,
};
pub use detect::{MotionAnalyzer, MotionRegion, MotionResult};
pub use diagnostics::{run_diagnostics, CheckOutcome, CheckStatus, DiagnosticReport};
pub use error::{ConfigError, FrameError, NotReady};
pub use frame::Frame;
pub use ingest::{open_source, FrameSource, SequenceSource, SourceStats, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use ingest::{v4l2::V4l2Config, V4l2Source};
pub use perf::{PerformanceSample, PerformanceSnapshot, PerformanceTracker};
pub use pipeline::{CycleReport, CycleStatus, DetectionPipeline, PipelineControls, PipelineStats};
pub use preview::{render_overlay, PreviewSlot, PreviewSnapshot};
pub use storage::{StorageHandle, StorageStats, StorageWriter};
