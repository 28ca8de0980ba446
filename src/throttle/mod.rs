//! Inference rate control.
//!
//! Both strategies keep an integer divisor in `[MIN_DIVISOR, MAX_DIVISOR]`
//! and run inference on every frame whose 1-based count is a multiple of
//! it. They differ in what moves the divisor.

mod cpu_monitor;
mod sampling;

pub use cpu_monitor::{CpuMonitorThrottle, CPU_MONITORING_PERIOD_MILLIS};
pub use sampling::{SamplingWindowThrottle, SAMPLING_WINDOW_FRAMES};

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::ThrottleStrategy;
use crate::metrics::CpuUtilizationHighEvent;

pub const MIN_DIVISOR: u32 = 1;
pub const MAX_DIVISOR: u32 = 10;

#[derive(Debug)]
pub enum Throttle {
    CpuObserver(CpuMonitorThrottle),
    SamplingWindow(SamplingWindowThrottle),
}

impl Throttle {
    pub fn new(strategy: ThrottleStrategy, clock: Arc<dyn Clock>, budget_percent: u32) -> Self {
        match strategy {
            ThrottleStrategy::CpuObserver => {
                Throttle::CpuObserver(CpuMonitorThrottle::new(clock, budget_percent))
            }
            ThrottleStrategy::SamplingWindow => {
                Throttle::SamplingWindow(SamplingWindowThrottle::new(clock, budget_percent))
            }
        }
    }

    /// Every incoming frame, before any readiness check.
    pub fn frame_received(&mut self) {
        if let Throttle::CpuObserver(t) = self {
            t.frame_received();
        }
    }

    /// Count a frame that reached the scheduling decision.
    pub fn submit_frame(&mut self) {
        match self {
            Throttle::CpuObserver(t) => t.submit_frame(),
            Throttle::SamplingWindow(t) => t.submit_frame(),
        }
    }

    pub fn should_run_inference(&self) -> bool {
        match self {
            Throttle::CpuObserver(t) => t.should_run_inference(),
            Throttle::SamplingWindow(t) => t.should_run_inference(),
        }
    }

    pub fn inference_started(&mut self) {
        if let Throttle::SamplingWindow(t) = self {
            t.inference_started();
        }
    }

    pub fn inference_completed(&mut self) {
        if let Throttle::SamplingWindow(t) = self {
            t.inference_completed();
        }
    }

    pub fn on_cpu_utilization_high(&mut self, event: &CpuUtilizationHighEvent) {
        if let Throttle::CpuObserver(t) = self {
            t.on_cpu_utilization_high(event);
        }
    }

    pub fn divisor(&self) -> u32 {
        match self {
            Throttle::CpuObserver(t) => t.divisor(),
            Throttle::SamplingWindow(t) => t.divisor(),
        }
    }

    pub fn strategy(&self) -> ThrottleStrategy {
        match self {
            Throttle::CpuObserver(_) => ThrottleStrategy::CpuObserver,
            Throttle::SamplingWindow(_) => ThrottleStrategy::SamplingWindow,
        }
    }
}
