//! Latest-frame preview hand-off and overlay rendering.
//!
//! The pipeline publishes a snapshot after every cycle; consumers take the
//! most recent one whenever they are ready. Older snapshots are overwritten,
//! never queued, so a slow consumer cannot hold up detection.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_cross_mut, draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use std::sync::{Arc, Mutex};

use crate::capture::CaptureState;
use crate::detect::MotionResult;
use crate::frame::Frame;
use crate::perf::PerformanceSnapshot;

const REGION_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const MOTION_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const STATUS_BAR_HEIGHT: u32 = 6;

#[derive(Clone, Debug)]
pub struct PreviewSnapshot {
    pub cycle: u64,
    pub frame: Arc<Frame>,
    /// `None` while the background is warming up.
    pub result: Option<MotionResult>,
    pub state: CaptureState,
    pub performance: PerformanceSnapshot,
}

/// Single-entry, drop-latest mailbox.
#[derive(Clone, Default)]
pub struct PreviewSlot {
    inner: Arc<Mutex<Option<PreviewSnapshot>>>,
}

impl PreviewSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace whatever snapshot is waiting.
    pub fn publish(&self, snapshot: PreviewSnapshot) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(snapshot);
    }

    /// Take the waiting snapshot, leaving the slot empty.
    pub fn take_latest(&self) -> Option<PreviewSnapshot> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Frame with region boxes, center marks and a status bar colored by
/// capture state.
pub fn render_overlay(snapshot: &PreviewSnapshot) -> RgbImage {
    let mut image = snapshot.frame.to_rgb();

    if let Some(result) = &snapshot.result {
        let color = if result.motion_detected {
            MOTION_COLOR
        } else {
            REGION_COLOR
        };
        for region in &result.regions {
            let rect = Rect::at(region.x as i32, region.y as i32)
                .of_size(region.width.max(1), region.height.max(1));
            draw_hollow_rect_mut(&mut image, rect, color);
            let (cx, cy) = region.center();
            draw_cross_mut(&mut image, color, cx as i32, cy as i32);
        }
    }

    let bar_height = STATUS_BAR_HEIGHT.min(image.height()).max(1);
    let bar = Rect::at(0, 0).of_size(image.width().max(1), bar_height);
    let bar_color = state_color(snapshot.state, snapshot.result.is_none());
    draw_filled_rect_mut(&mut image, bar, bar_color);
    image
}

fn state_color(state: CaptureState, warming_up: bool) -> Rgb<u8> {
    match state {
        _ if warming_up => Rgb([128, 128, 128]),
        CaptureState::Idle => Rgb([0, 160, 0]),
        CaptureState::Armed | CaptureState::Cooldown => Rgb([255, 160, 0]),
        CaptureState::Error => Rgb([200, 0, 0]),
    }
}
