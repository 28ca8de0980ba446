use crate::capture::FrameSource;
use crate::output::FrameSink;
use crate::processor::VideoFrameProcessor;
use anyhow::{Context, Result};
use std::time::{Duration, Instant};

/// Log averaged timings every this many frames
const STATS_INTERVAL: u64 = 30;

/// Accumulated loop timings
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStats {
    pub frames: u64,
    pub capture: Duration,
    pub process: Duration,
    pub output: Duration,
}

impl PipelineStats {
    fn average_ms(&self, total: Duration) -> f64 {
        if self.frames == 0 {
            return 0.0;
        }
        total.as_secs_f64() * 1000.0 / self.frames as f64
    }

    fn log(&self) {
        let avg_capture_ms = self.average_ms(self.capture);
        let avg_process_ms = self.average_ms(self.process);
        let avg_output_ms = self.average_ms(self.output);
        let total_ms = avg_capture_ms + avg_process_ms + avg_output_ms;
        let actual_fps = if total_ms > 0.0 { 1000.0 / total_ms } else { 0.0 };

        tracing::info!(
            "Frame {}: capture={:.1}ms, process={:.1}ms, output={:.1}ms, total={:.1}ms, fps={:.1}",
            self.frames,
            avg_capture_ms,
            avg_process_ms,
            avg_output_ms,
            total_ms,
            actual_fps
        );
    }
}

/// Pull, process and emit frames until `max_frames` (or forever), pacing the
/// loop to the source's frame rate.
pub fn run_pipeline<S, O>(
    source: &mut S,
    sink: &mut O,
    processor: &mut dyn VideoFrameProcessor,
    max_frames: Option<u64>,
) -> Result<PipelineStats>
where
    S: FrameSource + ?Sized,
    O: FrameSink + ?Sized,
{
    let framerate = source.stream_parameters().framerate.max(1);
    let frame_duration = Duration::from_secs_f32(1.0 / framerate as f32);
    let mut stats = PipelineStats::default();

    tracing::info!("Starting main pipeline loop");
    if max_frames.is_none() {
        tracing::info!("Press Ctrl+C to stop");
    }

    while max_frames.map_or(true, |max| stats.frames < max) {
        let loop_start = Instant::now();

        // Capture frame
        let capture_start = Instant::now();
        let frame = source.next_frame().context("Failed to capture frame")?;
        stats.capture += capture_start.elapsed();

        // Effects
        let process_start = Instant::now();
        let processed = processor.process(&frame);
        stats.process += process_start.elapsed();

        // Output frame
        let output_start = Instant::now();
        if !sink.present(&processed).context("Failed to write frame")? {
            tracing::debug!("Frame {} had no surface to emit", stats.frames);
        }
        stats.output += output_start.elapsed();

        stats.frames += 1;

        if stats.frames % STATS_INTERVAL == 0 {
            stats.log();
        }

        // Frame rate limiting
        let elapsed = loop_start.elapsed();
        if elapsed < frame_duration {
            std::thread::sleep(frame_duration - elapsed);
        }
    }

    Ok(stats)
}
