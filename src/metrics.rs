//! Filter cost reporting.
//!
//! [`FrameCounter`] accumulates how long inference takes and, once per
//! reporting period, turns that into events for registered
//! [`FilterObserver`]s.

use std::sync::Arc;

use serde::Serialize;

use crate::clock::Clock;

/// Filtering may use up to this share of the expected frame duration.
const FILTER_DURATION_FACTOR: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterDurationHighEvent {
    pub frames_dropped: i64,
    pub avg_filter_duration_millis: u64,
    pub framerate: u32,
    pub period_millis: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuUtilizationHighEvent {
    pub cpu_utilization: u64,
    pub filter_millis: u64,
    pub period_millis: u64,
}

/// Listener for filter cost events. Both methods default to doing nothing.
pub trait FilterObserver: Send + Sync {
    fn filter_frame_duration_high(&self, _event: &FilterDurationHighEvent) {}

    fn filter_cpu_utilization_high(&self, _event: &CpuUtilizationHighEvent) {}
}

/// Events produced by one `frame_received` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterReport {
    pub duration_high: Option<FilterDurationHighEvent>,
    pub cpu_high: Option<CpuUtilizationHighEvent>,
}

impl FilterReport {
    pub fn is_empty(&self) -> bool {
        self.duration_high.is_none() && self.cpu_high.is_none()
    }
}

#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn FilterObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Adding the same one twice is a no-op.
    pub fn add(&mut self, observer: Arc<dyn FilterObserver>) {
        if !self.observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            self.observers.push(observer);
        }
    }

    pub fn remove(&mut self, observer: &Arc<dyn FilterObserver>) {
        self.observers.retain(|o| !Arc::ptr_eq(o, observer));
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn notify(&self, report: &FilterReport) {
        for observer in &self.observers {
            if let Some(event) = &report.duration_high {
                observer.filter_frame_duration_high(event);
            }
            if let Some(event) = &report.cpu_high {
                observer.filter_cpu_utilization_high(event);
            }
        }
    }
}

/// Tracks frame and filter timing, reporting once per period.
#[derive(Debug)]
pub struct FrameCounter {
    clock: Arc<dyn Clock>,
    reporting_period_millis: u64,
    cpu_threshold_percent: u32,
    framerate: u32,
    duration_notify_millis: u64,
    last_reported_millis: u64,
    filter_started_millis: u64,
    filter_count: u64,
    filter_total_millis: u64,
    processing_filter: bool,
}

impl FrameCounter {
    pub fn new(clock: Arc<dyn Clock>, reporting_period_millis: u64, cpu_threshold_percent: u32) -> Self {
        let now = clock.now_millis();
        Self {
            clock,
            reporting_period_millis,
            cpu_threshold_percent,
            framerate: 0,
            duration_notify_millis: 0,
            last_reported_millis: now,
            filter_started_millis: now,
            filter_count: 0,
            filter_total_millis: 0,
            processing_filter: false,
        }
    }

    pub fn frame_received(&mut self, framerate: u32) -> FilterReport {
        if framerate != self.framerate {
            self.framerate = framerate;
            tracing::info!("frame counter setting frame rate to {}", framerate);
            self.duration_notify_millis = if framerate == 0 {
                0
            } else {
                (1000.0 / framerate as f64 * FILTER_DURATION_FACTOR).round() as u64
            };
        }
        let now = self.clock.now_millis();
        self.report(now)
    }

    fn report(&mut self, now: u64) -> FilterReport {
        let period = now.saturating_sub(self.last_reported_millis);
        if period == 0 || period < self.reporting_period_millis {
            return FilterReport::default();
        }

        let count = std::mem::take(&mut self.filter_count);
        let total = std::mem::take(&mut self.filter_total_millis);
        self.last_reported_millis = now;

        // Nothing meaningful to report without a frame rate or any filtering.
        if self.framerate == 0 || count == 0 {
            return FilterReport::default();
        }

        let avg = (total as f64 / count as f64).round() as u64;
        let expected_frames = (self.framerate as f64 * period as f64 / 1000.0).round() as i64;
        let cpu_utilization = (100.0 * total as f64 / period as f64).round() as u64;

        let mut report = FilterReport::default();
        if avg >= self.duration_notify_millis {
            report.duration_high = Some(FilterDurationHighEvent {
                frames_dropped: expected_frames - count as i64,
                avg_filter_duration_millis: avg,
                framerate: self.framerate,
                period_millis: period,
            });
        }
        if cpu_utilization >= self.cpu_threshold_percent as u64 {
            report.cpu_high = Some(CpuUtilizationHighEvent {
                cpu_utilization,
                filter_millis: total,
                period_millis: period,
            });
        }
        if !report.is_empty() {
            tracing::debug!(?report, "filter cost report");
        }
        report
    }

    pub fn filter_submitted(&mut self) {
        self.processing_filter = true;
        self.filter_started_millis = self.clock.now_millis();
    }

    /// Close the filter opened by [`filter_submitted`](Self::filter_submitted).
    /// A completion with no filter open is ignored.
    pub fn filter_complete(&mut self) {
        if !std::mem::take(&mut self.processing_filter) {
            tracing::debug!("filter completed without being submitted");
            return;
        }
        let now = self.clock.now_millis();
        self.filter_total_millis += now.saturating_sub(self.filter_started_millis);
        self.filter_count += 1;
    }

    pub fn filter_count(&self) -> u64 {
        self.filter_count
    }

    pub fn filter_total_millis(&self) -> u64 {
        self.filter_total_millis
    }
}
