//! Detection pipeline orchestrator.
//!
//! One `cycle()` acquires a frame, updates the background model, analyzes the
//! frame, advances the capture controller and records timing. Cycles run
//! sequentially on the owning thread. Capture requests leave through an mpsc
//! channel and preview snapshots through a drop-latest slot, so neither disk
//! writes nor display block detection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::background::BackgroundModel;
use crate::capture::{CaptureController, CaptureRequest, CaptureState, CaptureStats, Observation};
use crate::config::MotionConfig;
use crate::detect::{MotionAnalyzer, MotionResult};
use crate::error::{ConfigError, FrameError};
use crate::frame::Frame;
use crate::ingest::{FrameSource, SourceStats};
use crate::perf::{PerformanceSample, PerformanceSnapshot, PerformanceTracker};
use crate::preview::{PreviewSlot, PreviewSnapshot};

/// Cross-thread requests, honored at the start of the next cycle.
#[derive(Clone, Default)]
pub struct PipelineControls {
    flags: Arc<ControlFlags>,
}

#[derive(Default)]
struct ControlFlags {
    stop: AtomicBool,
    reset_background: AtomicBool,
    manual_capture: AtomicBool,
}

impl PipelineControls {
    pub fn request_stop(&self) {
        self.flags.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flags.stop.load(Ordering::SeqCst)
    }

    pub fn request_background_reset(&self) {
        self.flags.reset_background.store(true, Ordering::SeqCst);
    }

    pub fn request_manual_capture(&self) {
        self.flags.manual_capture.store(true, Ordering::SeqCst);
    }

    fn take_background_reset(&self) -> bool {
        self.flags.reset_background.swap(false, Ordering::SeqCst)
    }

    fn take_manual_capture(&self) -> bool {
        self.flags.manual_capture.swap(false, Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CycleStatus {
    Analyzed,
    /// Frame fed to the background model only.
    WarmingUp { remaining: u32 },
    /// Acquisition failed; `consecutive` failures so far.
    Unavailable { consecutive: u32 },
    /// The source has no more frames.
    SourceClosed,
}

/// Outcome of one cycle.
#[derive(Clone, Debug)]
pub struct CycleReport {
    pub cycle: u64,
    pub status: CycleStatus,
    pub motion: Option<MotionResult>,
    pub capture: Option<CaptureRequest>,
    pub state: CaptureState,
    pub performance: PerformanceSnapshot,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub cycles: u64,
    pub frames_analyzed: u64,
    pub motion_frames: u64,
    pub captures_sent: u64,
    /// Requests that could not be handed to the storage writer.
    pub captures_dropped: u64,
    pub background_resets: u64,
}

pub struct DetectionPipeline {
    source: Box<dyn FrameSource>,
    background: BackgroundModel,
    analyzer: MotionAnalyzer,
    controller: CaptureController,
    tracker: PerformanceTracker,
    capture_sink: Option<Sender<CaptureRequest>>,
    preview: Option<PreviewSlot>,
    controls: PipelineControls,
    retry_delay: Duration,
    log_interval: u64,
    started_at: Option<Instant>,
    stats: PipelineStats,
}

impl DetectionPipeline {
    /// Build a pipeline around `source`. Invalid settings fail here, before
    /// the first cycle.
    pub fn new(source: Box<dyn FrameSource>, config: &MotionConfig) -> Result<Self, ConfigError> {
        config.detection.validate()?;
        config.capture.validate()?;
        config.performance.validate()?;

        Ok(Self {
            source,
            background: BackgroundModel::new(&config.detection, config.capture.warmup_frames)?,
            analyzer: MotionAnalyzer::new(config.detection.clone())?,
            controller: CaptureController::new(&config.capture)?,
            tracker: PerformanceTracker::new(config.performance.window),
            capture_sink: None,
            preview: None,
            controls: PipelineControls::default(),
            retry_delay: config.capture.retry_delay,
            log_interval: config.performance.log_interval,
            started_at: None,
            stats: PipelineStats::default(),
        })
    }

    /// Send capture requests to `sink` (usually a storage writer thread).
    pub fn with_capture_sink(mut self, sink: Sender<CaptureRequest>) -> Self {
        self.capture_sink = Some(sink);
        self
    }

    /// Publish a snapshot to a preview slot after every frame.
    pub fn with_preview(mut self, slot: PreviewSlot) -> Self {
        self.preview = Some(slot);
        self
    }

    pub fn controls(&self) -> PipelineControls {
        self.controls.clone()
    }

    pub fn background(&self) -> &BackgroundModel {
        &self.background
    }

    pub fn state(&self) -> CaptureState {
        self.controller.state()
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.controller.stats()
    }

    pub fn performance(&self) -> PerformanceSnapshot {
        self.tracker.snapshot()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn source_stats(&self) -> SourceStats {
        self.source.stats()
    }

    pub fn source_healthy(&self) -> bool {
        self.source.is_healthy()
    }

    pub fn cycle(&mut self) -> CycleReport {
        let started = Instant::now();
        self.started_at.get_or_insert(started);
        self.stats.cycles += 1;
        let cycle = self.stats.cycles;
        self.apply_controls();

        let acquired = self.source.next_frame();
        let acquired_at = Instant::now();

        let (status, motion, capture) = match acquired {
            Err(FrameError::Closed) => {
                log::info!("frame source {} closed", self.source.name());
                return self.report(cycle, CycleStatus::SourceClosed, None, None);
            }
            Err(FrameError::Unavailable(reason)) => {
                log::debug!("cycle {}: {}", cycle, reason);
                let before = self.controller.state();
                self.controller.advance(Observation::Unavailable, acquired_at);
                let entered_error = before != CaptureState::Error
                    && self.controller.state() == CaptureState::Error;
                if entered_error {
                    log::warn!(
                        "source {} unhealthy after {} failures: {}",
                        self.source.name(),
                        self.source.stats().failures,
                        reason
                    );
                }
                let consecutive = self.controller.stats().consecutive_failures;
                (CycleStatus::Unavailable { consecutive }, None, None)
            }
            Ok(frame) => self.process(Arc::new(frame), acquired_at),
        };

        self.tracker.record_sample(PerformanceSample {
            started_at: started,
            capture_latency: acquired_at.saturating_duration_since(started),
            processing_latency: started.elapsed(),
        });
        if self.log_interval > 0 && cycle % self.log_interval == 0 {
            self.log_performance(cycle);
        }
        self.report(cycle, status, motion, capture)
    }

    fn process(
        &mut self,
        frame: Arc<Frame>,
        acquired_at: Instant,
    ) -> (CycleStatus, Option<MotionResult>, Option<CaptureRequest>) {
        if self.controller.frame_acquired(acquired_at) {
            self.reset_background();
        }
        let now = frame.captured_at();

        let reference = match self.background.reference() {
            Ok(reference) if self.background.is_warmed_up() => reference,
            _ => return self.warm_up(&frame, now),
        };

        let result = self.analyzer.analyze(&frame, &reference);
        self.stats.frames_analyzed += 1;
        if result.motion_detected {
            self.stats.motion_frames += 1;
        }

        let capture = self.controller.advance(
            Observation::Analyzed {
                result: &result,
                frame: &frame,
            },
            now,
        );
        self.background.observe_analyzed(&frame, &result);

        if let Some(request) = &capture {
            self.dispatch(request.clone());
        }
        self.publish_preview(&frame, Some(result.clone()));
        (CycleStatus::Analyzed, Some(result), capture)
    }

    fn warm_up(
        &mut self,
        frame: &Arc<Frame>,
        now: Instant,
    ) -> (CycleStatus, Option<MotionResult>, Option<CaptureRequest>) {
        self.background.observe(frame);
        self.controller.advance(Observation::WarmingUp, now);
        self.publish_preview(frame, None);
        let remaining = self.background.warmup_remaining();
        if remaining == 0 {
            log::info!(
                "background warm-up complete after {} frames, detection active",
                self.background.observed_frames()
            );
        }
        (CycleStatus::WarmingUp { remaining }, None, None)
    }

    /// Run until a stop is requested or the source closes.
    pub fn run(&mut self) -> PipelineStats {
        self.run_cycles(None)
    }

    /// Run at most `max_cycles` cycles.
    pub fn run_for(&mut self, max_cycles: u64) -> PipelineStats {
        self.run_cycles(Some(max_cycles))
    }

    fn run_cycles(&mut self, limit: Option<u64>) -> PipelineStats {
        log::info!(
            "detection pipeline running (source={}, warm-up={} frames)",
            self.source.name(),
            self.background.warmup_remaining()
        );
        let mut remaining = limit;
        loop {
            if self.controls.is_stop_requested() {
                log::info!("stop requested, leaving detection loop");
                break;
            }
            if let Some(left) = remaining.as_mut() {
                if *left == 0 {
                    break;
                }
                *left -= 1;
            }

            let report = self.cycle();
            match report.status {
                CycleStatus::SourceClosed => break,
                CycleStatus::Unavailable { .. } if !self.retry_delay.is_zero() => {
                    std::thread::sleep(self.retry_delay);
                }
                _ => {}
            }
        }
        self.log_final_statistics();
        self.stats
    }

    fn apply_controls(&mut self) {
        if self.controls.take_background_reset() {
            self.reset_background();
        }
        if self.controls.take_manual_capture() {
            log::info!("manual capture requested");
            self.controller.request_manual_capture();
        }
    }

    fn reset_background(&mut self) {
        self.background.reset();
        self.stats.background_resets += 1;
    }

    fn dispatch(&mut self, request: CaptureRequest) {
        let Some(sink) = &self.capture_sink else {
            return;
        };
        if sink.send(request).is_ok() {
            self.stats.captures_sent += 1;
        } else {
            self.stats.captures_dropped += 1;
            log::warn!("storage writer is gone, capture request dropped");
            self.capture_sink = None;
        }
    }

    fn publish_preview(&self, frame: &Arc<Frame>, result: Option<MotionResult>) {
        if let Some(slot) = &self.preview {
            slot.publish(PreviewSnapshot {
                cycle: self.stats.cycles,
                frame: Arc::clone(frame),
                result,
                state: self.controller.state(),
                performance: self.tracker.snapshot(),
            });
        }
    }

    fn report(
        &self,
        cycle: u64,
        status: CycleStatus,
        motion: Option<MotionResult>,
        capture: Option<CaptureRequest>,
    ) -> CycleReport {
        CycleReport {
            cycle,
            status,
            motion,
            capture,
            state: self.controller.state(),
            performance: self.tracker.snapshot(),
        }
    }

    fn log_performance(&self, cycle: u64) {
        let perf = self.tracker.snapshot();
        let capture = self.controller.stats();
        log::info!(
            "cycle {}: fps={:.1} latency={:.1}ms acquire={:.1}ms state={} captures={} \
             failures={} source={}",
            cycle,
            perf.fps,
            perf.avg_latency_ms,
            perf.avg_capture_ms,
            self.controller.state(),
            capture.captures,
            capture.total_failures,
            if self.source.is_healthy() { "healthy" } else { "degraded" }
        );
    }

    fn log_final_statistics(&self) {
        let runtime = self
            .started_at
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let capture = self.controller.stats();
        let source = self.source.stats();
        let avg_fps = if runtime.as_secs_f64() > 0.0 {
            self.stats.cycles as f64 / runtime.as_secs_f64()
        } else {
            0.0
        };
        log::info!(
            "final statistics: runtime={:.1}s cycles={} frames={} analyzed={} motion_frames={} \
             captures={} dropped={} failures={} background_resets={} avg_fps={:.1}",
            runtime.as_secs_f64(),
            self.stats.cycles,
            source.frames_captured,
            self.stats.frames_analyzed,
            self.stats.motion_frames,
            capture.captures,
            self.stats.captures_dropped,
            capture.total_failures,
            self.stats.background_resets,
            avg_fps
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaptureSettings, DetectionSettings};
    use crate::ingest::SourceStats;
    use std::collections::VecDeque;

    /// Source replaying a fixed script.
    struct Scripted {
        frames: VecDeque<Result<Frame, FrameError>>,
    }

    impl FrameSource for Scripted {
        fn next_frame(&mut self) -> Result<Frame, FrameError> {
            self.frames.pop_front().unwrap_or(Err(FrameError::Closed))
        }

        fn name(&self) -> &str {
            "scripted"
        }

        fn stats(&self) -> SourceStats {
            SourceStats::default()
        }
    }

    fn config() -> MotionConfig {
        MotionConfig {
            detection: DetectionSettings {
                blur_kernel_size: 1,
                ..DetectionSettings::default()
            },
            capture: CaptureSettings {
                warmup_frames: 2,
                error_retry_limit: 2,
                retry_delay: Duration::ZERO,
                ..CaptureSettings::default()
            },
            ..MotionConfig::default()
        }
    }

    fn pipeline(frames: Vec<Result<Frame, FrameError>>) -> DetectionPipeline {
        let source = Scripted {
            frames: frames.into(),
        };
        DetectionPipeline::new(Box::new(source), &config()).unwrap()
    }

    #[test]
    fn warm_up_precedes_analysis() {
        let mut p = pipeline(vec![
            Ok(Frame::solid(64, 48, 30, 0)),
            Ok(Frame::solid(64, 48, 30, 1)),
            Ok(Frame::solid(64, 48, 30, 2)),
        ]);

        assert_eq!(p.cycle().status, CycleStatus::WarmingUp { remaining: 1 });
        assert_eq!(p.cycle().status, CycleStatus::WarmingUp { remaining: 0 });
        let report = p.cycle();
        assert_eq!(report.status, CycleStatus::Analyzed);
        assert!(!report.motion.unwrap().motion_detected);
        assert_eq!(p.cycle().status, CycleStatus::SourceClosed);
    }

    #[test]
    fn controls_are_applied_at_cycle_start() {
        let mut p = pipeline(vec![
            Ok(Frame::solid(64, 48, 30, 0)),
            Ok(Frame::solid(64, 48, 30, 1)),
            Ok(Frame::solid(64, 48, 90, 2)),
        ]);
        p.cycle();
        p.cycle();
        assert!(p.background().is_warmed_up());

        p.controls().request_background_reset();
        let report = p.cycle();
        assert_eq!(report.status, CycleStatus::WarmingUp { remaining: 1 });
        assert_eq!(p.background().reference().unwrap().get_pixel(0, 0)[0], 90);
        assert_eq!(p.stats().background_resets, 1);
    }

    #[test]
    fn run_stops_when_requested() {
        let mut p = pipeline((0..10).map(|i| Ok(Frame::solid(8, 8, 10, i))).collect());
        p.controls().request_stop();
        let stats = p.run();
        assert_eq!(stats.cycles, 0);
    }

    #[test]
    fn run_for_bounds_cycle_count() {
        let mut p = pipeline((0..10).map(|i| Ok(Frame::solid(8, 8, 10, i))).collect());
        assert_eq!(p.run_for(4).cycles, 4);
    }

    #[test]
    fn invalid_config_fails_fast() {
        let mut cfg = config();
        cfg.detection.blur_kernel_size = 2;
        let source = Scripted {
            frames: VecDeque::new(),
        };
        assert!(DetectionPipeline::new(Box::new(source), &cfg).is_err());
    }
}
