use std::sync::Arc;

use super::{MAX_DIVISOR, MIN_DIVISOR};
use crate::clock::Clock;
use crate::metrics::CpuUtilizationHighEvent;

pub const CPU_MONITORING_PERIOD_MILLIS: u64 = 5000;

/// Divisor driven by CPU-high reports from the frame counter.
///
/// A report above budget raises the divisor by one, at most once per
/// monitoring period. Two full periods without a raise lower it by one.
#[derive(Debug)]
pub struct CpuMonitorThrottle {
    clock: Arc<dyn Clock>,
    budget_percent: u32,
    period_millis: u64,
    last_change_millis: Option<u64>,
    frame_count: u64,
    divisor: u32,
}

impl CpuMonitorThrottle {
    pub fn new(clock: Arc<dyn Clock>, budget_percent: u32) -> Self {
        Self::with_period(clock, budget_percent, CPU_MONITORING_PERIOD_MILLIS)
    }

    pub fn with_period(clock: Arc<dyn Clock>, budget_percent: u32, period_millis: u64) -> Self {
        Self {
            clock,
            budget_percent,
            period_millis,
            last_change_millis: None,
            frame_count: 0,
            divisor: MIN_DIVISOR,
        }
    }

    fn elapsed_since_change(&self, now: u64) -> Option<u64> {
        self.last_change_millis.map(|last| now.saturating_sub(last))
    }

    pub fn on_cpu_utilization_high(&mut self, event: &CpuUtilizationHighEvent) {
        // Exactly at budget is on target.
        if event.cpu_utilization <= self.budget_percent as u64 {
            return;
        }
        let now = self.clock.now_millis();
        if self
            .elapsed_since_change(now)
            .map_or(true, |elapsed| elapsed >= self.period_millis)
        {
            self.last_change_millis = Some(now);
            self.set_divisor((self.divisor + 1).min(MAX_DIVISOR));
        }
    }

    /// Called on every incoming frame.
    pub fn frame_received(&mut self) {
        let now = self.clock.now_millis();
        if self
            .elapsed_since_change(now)
            .map_or(true, |elapsed| elapsed >= self.period_millis * 2)
        {
            self.last_change_millis = Some(now);
            self.set_divisor(self.divisor.saturating_sub(1).max(MIN_DIVISOR));
        }
    }

    pub fn submit_frame(&mut self) {
        self.frame_count += 1;
    }

    pub fn should_run_inference(&self) -> bool {
        self.frame_count % self.divisor as u64 == 0
    }

    pub fn divisor(&self) -> u32 {
        self.divisor
    }

    fn set_divisor(&mut self, divisor: u32) {
        if divisor != self.divisor {
            self.divisor = divisor;
            tracing::info!(
                "Adjusting filter rate to compensate for CPU utilization. \
                 Filter rate is {} video frames per filter.",
                divisor
            );
        }
    }
}
