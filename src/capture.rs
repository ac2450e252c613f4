//! Capture state machine.
//!
//! `CaptureController` turns per-cycle observations into at most one capture
//! request, enforcing the minimum interval between captures and suspending
//! capture while the frame source is failing.
//!
//! ```text
//!   Idle --motion--> Armed --emit--> Cooldown --delay elapsed, no motion--> Idle
//!                                       ^  |
//!                                       +--+ delay elapsed, motion (emit)
//!   any --N consecutive failures--> Error --first good frame--> Idle
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::CaptureSettings;
use crate::detect::MotionResult;
use crate::error::ConfigError;
use crate::frame::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Armed,
    Cooldown,
    Error,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::Idle => "idle",
            CaptureState::Armed => "armed",
            CaptureState::Cooldown => "cooldown",
            CaptureState::Error => "error",
        };
        f.write_str(name)
    }
}

/// What the pipeline saw this cycle.
#[derive(Clone, Copy, Debug)]
pub enum Observation<'a> {
    Analyzed {
        result: &'a MotionResult,
        frame: &'a Arc<Frame>,
    },
    /// A frame arrived but the background is still warming up.
    WarmingUp,
    /// Frame acquisition failed.
    Unavailable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureTrigger {
    Motion,
    /// Operator-requested snapshot.
    Manual,
}

/// Instruction to persist a frame.
#[derive(Clone, Debug)]
pub struct CaptureRequest {
    pub frame: Arc<Frame>,
    pub timestamp: Instant,
    /// 1-based count of requests emitted by the controller.
    pub sequence: u64,
    pub trigger: CaptureTrigger,
    pub total_area: u64,
    pub region_count: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub captures: u64,
    pub motion_cycles: u64,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_good_frame: Option<Instant>,
}

pub struct CaptureController {
    state: CaptureState,
    photo_delay: Duration,
    error_retry_limit: u32,
    last_capture: Option<Instant>,
    manual_pending: bool,
    stats: CaptureStats,
}

impl CaptureController {
    pub fn new(settings: &CaptureSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            state: CaptureState::Idle,
            photo_delay: settings.photo_delay,
            error_retry_limit: settings.error_retry_limit,
            last_capture: None,
            manual_pending: false,
            stats: CaptureStats::default(),
        })
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn last_capture(&self) -> Option<Instant> {
        self.last_capture
    }

    /// Treat the next analyzed frame as motion. The request still waits for
    /// the cooldown.
    pub fn request_manual_capture(&mut self) {
        self.manual_pending = true;
    }

    /// Record a successful acquisition. Returns true when this leaves the
    /// Error state, in which case the caller must reset the background.
    pub fn frame_acquired(&mut self, now: Instant) -> bool {
        self.stats.consecutive_failures = 0;
        self.stats.last_good_frame = Some(now);
        if self.state == CaptureState::Error {
            log::info!("frame source recovered after {} failures", self.stats.total_failures);
            self.transition(CaptureState::Idle);
            true
        } else {
            false
        }
    }

    /// Return to Idle. `last_capture` is kept so the cooldown still applies.
    pub fn reset(&mut self) {
        self.manual_pending = false;
        self.stats.consecutive_failures = 0;
        self.transition(CaptureState::Idle);
    }

    pub fn advance(
        &mut self,
        observation: Observation<'_>,
        now: Instant,
    ) -> Option<CaptureRequest> {
        match observation {
            Observation::Unavailable => {
                self.record_failure(now);
                None
            }
            Observation::WarmingUp => {
                if self.state == CaptureState::Cooldown && self.cooldown_elapsed(now) {
                    self.transition(CaptureState::Idle);
                }
                None
            }
            Observation::Analyzed { result, frame } => self.on_analyzed(result, frame, now),
        }
    }

    fn on_analyzed(
        &mut self,
        result: &MotionResult,
        frame: &Arc<Frame>,
        now: Instant,
    ) -> Option<CaptureRequest> {
        if self.state == CaptureState::Error {
            return None;
        }

        let manual = std::mem::take(&mut self.manual_pending);
        if result.motion_detected {
            self.stats.motion_cycles += 1;
        }
        let trigger = if manual {
            CaptureTrigger::Manual
        } else {
            CaptureTrigger::Motion
        };
        let motion = result.motion_detected || manual;

        match self.state {
            CaptureState::Idle if motion => {
                if self.cooldown_elapsed(now) {
                    self.transition(CaptureState::Armed);
                    Some(self.emit(result, frame, trigger, now))
                } else {
                    if manual {
                        log::info!("manual capture suppressed: cooldown active");
                    }
                    self.transition(CaptureState::Cooldown);
                    None
                }
            }
            CaptureState::Cooldown if self.cooldown_elapsed(now) => {
                if motion {
                    Some(self.emit(result, frame, trigger, now))
                } else {
                    self.transition(CaptureState::Idle);
                    None
                }
            }
            CaptureState::Cooldown => {
                if manual {
                    log::info!("manual capture suppressed: cooldown active");
                }
                None
            }
            // Armed never survives a call; Error handled above.
            _ => None,
        }
    }

    fn emit(
        &mut self,
        result: &MotionResult,
        frame: &Arc<Frame>,
        trigger: CaptureTrigger,
        now: Instant,
    ) -> CaptureRequest {
        self.last_capture = Some(now);
        self.stats.captures += 1;
        if self.state != CaptureState::Cooldown {
            self.transition(CaptureState::Cooldown);
        }
        log::info!(
            "capture #{} requested ({:?}): frame #{} area={} regions={}",
            self.stats.captures,
            trigger,
            frame.sequence(),
            result.total_area,
            result.region_count()
        );
        CaptureRequest {
            frame: Arc::clone(frame),
            timestamp: now,
            sequence: self.stats.captures,
            trigger,
            total_area: result.total_area,
            region_count: result.region_count(),
        }
    }

    fn record_failure(&mut self, now: Instant) {
        self.stats.consecutive_failures = self.stats.consecutive_failures.saturating_add(1);
        self.stats.total_failures += 1;

        if self.state == CaptureState::Error {
            return;
        }
        if self.stats.consecutive_failures >= self.error_retry_limit {
            let since_good = self
                .stats
                .last_good_frame
                .map(|t| format!("{:.1}s", now.saturating_duration_since(t).as_secs_f64()))
                .unwrap_or_else(|| "never".to_string());
            log::error!(
                "frame source failed {} consecutive times (last good frame: {}); \
                 suspending capture",
                self.stats.consecutive_failures,
                since_good
            );
            self.transition(CaptureState::Error);
        } else {
            log::warn!(
                "frame acquisition failed ({}/{})",
                self.stats.consecutive_failures,
                self.error_retry_limit
            );
        }
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        match self.last_capture {
            Some(last) => now.saturating_duration_since(last) >= self.photo_delay,
            None => true,
        }
    }

    fn transition(&mut self, next: CaptureState) {
        if self.state != next {
            log::debug!("capture state {} -> {}", self.state, next);
            self.state = next;
        }
    }
}
