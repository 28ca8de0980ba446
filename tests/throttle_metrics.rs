use std::sync::Arc;

use backdrop::clock::ManualClock;
use backdrop::config::ThrottleStrategy;
use backdrop::metrics::{CpuUtilizationHighEvent, FilterReport, FrameCounter};
use backdrop::throttle::{Throttle, MAX_DIVISOR};

/// Drives a frame counter and a throttle the way the effects processor does,
/// with inference cost simulated on a manual clock.
struct Simulation {
    clock: ManualClock,
    counter: FrameCounter,
    throttle: Throttle,
    framerate: u32,
    reports: Vec<FilterReport>,
    inferences: u64,
}

impl Simulation {
    fn new(strategy: ThrottleStrategy, budget: u32, reporting_period: u64, framerate: u32) -> Self {
        let clock = ManualClock::new();
        let shared = Arc::new(clock.clone());
        Self {
            counter: FrameCounter::new(shared.clone(), reporting_period, budget),
            throttle: Throttle::new(strategy, shared, budget),
            clock,
            framerate,
            reports: Vec::new(),
            inferences: 0,
        }
    }

    /// One frame: `inference_millis` when the throttle lets inference run,
    /// then `idle_millis` either way.
    fn frame(&mut self, inference_millis: u64, idle_millis: u64) {
        let report = self.counter.frame_received(self.framerate);
        if let Some(event) = &report.cpu_high {
            self.throttle.on_cpu_utilization_high(event);
        }
        if !report.is_empty() {
            self.reports.push(report);
        }
        self.throttle.frame_received();

        self.counter.filter_submitted();
        self.throttle.submit_frame();
        if self.throttle.should_run_inference() {
            self.throttle.inference_started();
            self.clock.advance_millis(inference_millis);
            self.throttle.inference_completed();
            self.inferences += 1;
        }
        self.counter.filter_complete();
        self.clock.advance_millis(idle_millis);
    }

    fn cpu_events(&self) -> Vec<CpuUtilizationHighEvent> {
        self.reports.iter().filter_map(|r| r.cpu_high).collect()
    }
}

#[test]
fn cpu_exactly_at_budget_keeps_the_rate() {
    let mut sim = Simulation::new(ThrottleStrategy::CpuObserver, 50, 1000, 10);
    for _ in 0..11 {
        sim.frame(50, 50);
    }

    assert_eq!(
        sim.cpu_events(),
        vec![CpuUtilizationHighEvent {
            cpu_utilization: 50,
            filter_millis: 500,
            period_millis: 1000,
        }]
    );
    assert!(sim.reports[0].duration_high.is_none());
    assert_eq!(sim.throttle.divisor(), 1);
    assert_eq!(sim.inferences, 11);
}

#[test]
fn cpu_over_budget_halves_the_rate() {
    let mut sim = Simulation::new(ThrottleStrategy::CpuObserver, 50, 5000, 10);
    for _ in 0..51 {
        sim.frame(60, 40);
    }

    assert_eq!(
        sim.cpu_events(),
        vec![CpuUtilizationHighEvent {
            cpu_utilization: 60,
            filter_millis: 3000,
            period_millis: 5000,
        }]
    );
    assert_eq!(sim.throttle.divisor(), 2);

    // Every second frame from here on.
    for _ in 0..10 {
        sim.frame(60, 40);
    }
    assert_eq!(sim.inferences, 55);
}

#[test]
fn sampling_window_raises_then_lowers_the_divisor() {
    let mut sim = Simulation::new(ThrottleStrategy::SamplingWindow, 50, 1000, 15);

    // 50 of every 67 ms in inference.
    for _ in 0..499 {
        sim.frame(50, 17);
    }
    assert_eq!(sim.throttle.divisor(), 1);
    sim.frame(50, 17);
    assert_eq!(sim.throttle.divisor(), 2);

    // Cheaper inference brings the share back under budget.
    for _ in 0..500 {
        sim.frame(20, 17);
    }
    assert_eq!(sim.throttle.divisor(), 1);
}

#[test]
fn sampling_window_divisor_is_capped() {
    let mut sim = Simulation::new(ThrottleStrategy::SamplingWindow, 10, 1000, 15);
    for _ in 0..6500 {
        sim.frame(1000, 10);
    }
    assert_eq!(sim.throttle.divisor(), MAX_DIVISOR);
}

#[test]
fn sampling_window_ignores_cpu_reports() {
    let mut sim = Simulation::new(ThrottleStrategy::SamplingWindow, 50, 1000, 15);
    for _ in 0..100 {
        sim.frame(77, 0);
    }
    assert!(!sim.cpu_events().is_empty());
    assert_eq!(sim.throttle.divisor(), 1);
}
