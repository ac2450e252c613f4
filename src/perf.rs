//! Rolling per-cycle timing.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PerformanceSample {
    pub started_at: Instant,
    /// Time spent waiting on the frame source.
    pub capture_latency: Duration,
    /// Time from cycle start to the end of the cycle.
    pub processing_latency: Duration,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PerformanceSnapshot {
    pub fps: f64,
    pub avg_latency_ms: f64,
    pub avg_capture_ms: f64,
    pub sample_count: usize,
}

/// Fixed-capacity window of recent cycle samples.
pub struct PerformanceTracker {
    samples: VecDeque<PerformanceSample>,
    capacity: usize,
}

impl PerformanceTracker {
    pub fn new(window: usize) -> Self {
        let capacity = window.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, start: Instant, end: Instant) {
        self.record_sample(PerformanceSample {
            started_at: start,
            capture_latency: Duration::ZERO,
            processing_latency: end.saturating_duration_since(start),
        });
    }

    pub fn record_sample(&mut self, sample: PerformanceSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let count = self.samples.len();
        if count == 0 {
            return PerformanceSnapshot::default();
        }

        let total_latency: f64 = self
            .samples
            .iter()
            .map(|s| s.processing_latency.as_secs_f64())
            .sum();
        let total_capture: f64 = self
            .samples
            .iter()
            .map(|s| s.capture_latency.as_secs_f64())
            .sum();

        let fps = match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) if count >= 2 => {
                let span = last
                    .started_at
                    .saturating_duration_since(first.started_at)
                    .as_secs_f64();
                if span > 0.0 {
                    (count - 1) as f64 / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        PerformanceSnapshot {
            fps,
            avg_latency_ms: total_latency * 1000.0 / count as f64,
            avg_capture_ms: total_capture * 1000.0 / count as f64,
            sample_count: count,
        }
    }
}
