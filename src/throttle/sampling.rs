use std::sync::Arc;

use super::{MAX_DIVISOR, MIN_DIVISOR};
use crate::clock::Clock;

/// Frames per sampling window.
pub const SAMPLING_WINDOW_FRAMES: u64 = 500;

/// Divisor re-evaluated once per window of frames from the share of wall
/// time spent in inference.
#[derive(Debug)]
pub struct SamplingWindowThrottle {
    clock: Arc<dyn Clock>,
    target_fraction: f64,
    window_frames: u64,
    frame_count: u64,
    divisor: u32,
    inference_started_millis: u64,
    inference_total_millis: u64,
    window_started_millis: u64,
}

impl SamplingWindowThrottle {
    pub fn new(clock: Arc<dyn Clock>, budget_percent: u32) -> Self {
        Self::with_window(clock, budget_percent, SAMPLING_WINDOW_FRAMES)
    }

    pub fn with_window(clock: Arc<dyn Clock>, budget_percent: u32, window_frames: u64) -> Self {
        let now = clock.now_millis();
        Self {
            clock,
            target_fraction: budget_percent as f64 / 100.0,
            window_frames,
            frame_count: 0,
            divisor: MIN_DIVISOR,
            inference_started_millis: now,
            inference_total_millis: 0,
            window_started_millis: now,
        }
    }

    pub fn submit_frame(&mut self) {
        self.frame_count += 1;
    }

    pub fn should_run_inference(&self) -> bool {
        self.frame_count % self.divisor as u64 == 0
    }

    pub fn inference_started(&mut self) {
        self.inference_started_millis = self.clock.now_millis();
    }

    pub fn inference_completed(&mut self) {
        let now = self.clock.now_millis();
        self.inference_total_millis += now.saturating_sub(self.inference_started_millis);
        if self.frame_count >= self.window_frames {
            let elapsed = now.saturating_sub(self.window_started_millis).max(1);
            self.adjust(self.inference_total_millis as f64 / elapsed as f64, now);
        }
    }

    fn adjust(&mut self, observed_fraction: f64, now: u64) {
        if observed_fraction > self.target_fraction {
            if self.divisor < MAX_DIVISOR {
                self.divisor += 1;
                tracing::info!(
                    "Segmentation cycle percentage above the configured maximal value. \
                     Decreasing segmentation rate to 1 segmentation per {} frames",
                    self.divisor
                );
            }
        } else if observed_fraction < self.target_fraction && self.divisor > MIN_DIVISOR {
            self.divisor -= 1;
            tracing::info!(
                "Segmentation cycle percentage below the configured maximal value. \
                 Increasing segmentation rate to 1 segmentation per {} frames",
                self.divisor
            );
        }

        self.inference_total_millis = 0;
        self.frame_count = 0;
        self.window_started_millis = now;
    }

    pub fn divisor(&self) -> u32 {
        self.divisor
    }
}
