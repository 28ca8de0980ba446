mod common;

use std::sync::Arc;
use std::thread;

use backdrop::clock::ManualClock;
use backdrop::config::{
    AssetSource, BlurMethod, BlurStrength, EffectConfiguration, ProcessorOptions,
    ThrottleStrategy, TransferMode,
};
use backdrop::error::{ConfigError, ProcessorError, WorkerError};
use backdrop::frame::VideoFrame;
use backdrop::metrics::{CpuUtilizationHighEvent, FilterDurationHighEvent, FilterObserver};
use backdrop::processor::{EffectsProcessor, NoOpProcessor, ProcessorState, VideoFrameProcessor};
use common::{default_options, gate, manual_capabilities, solid, Journal, ScriptedEngine};
use parking_lot::Mutex;

const RED: [u8; 4] = [255, 0, 0, 255];
const BLUE: [u8; 4] = [0, 0, 255, 255];

fn replacing_blue(
    options: ProcessorOptions,
    engine: ScriptedEngine,
    shared_memory: bool,
) -> Result<EffectsProcessor, ProcessorError> {
    let clock = ManualClock::new();
    EffectsProcessor::create(
        options,
        manual_capabilities(&clock, shared_memory),
        engine.boxed(),
        EffectConfiguration::replace_with_color("#0000ff"),
    )
}

fn red_frame(width: u32, height: u32) -> VideoFrame {
    VideoFrame::new(solid(width, height, RED), 15)
}

fn assert_left_person_over_blue(frame: &VideoFrame) {
    let surface = frame.surface().unwrap();
    let (width, height) = surface.dimensions();
    assert_eq!(surface.get_pixel(0, height / 2).0, RED);
    assert_eq!(surface.get_pixel(width - 1, height / 2).0, BLUE);
}

#[test]
fn shared_memory_frame_is_composited() {
    let journal = Journal::default();
    let mut processor = replacing_blue(default_options(), ScriptedEngine::new(&journal), true).unwrap();
    assert_eq!(processor.state(), ProcessorState::Ready);

    let frame = red_frame(64, 36);
    let output = processor.process(&frame);
    assert!(!std::ptr::eq(output, &frame));
    assert_left_person_over_blue(output);
    assert!(processor.has_mask());
    assert_eq!(processor.scale_factors(), (4.0, 4.0));
}

#[test]
fn transfer_mode_matches_shared_memory() {
    let journal = Journal::default();
    let options = ProcessorOptions {
        transfer_mode: TransferMode::Transfer,
        ..default_options()
    };
    let mut processor = replacing_blue(options, ScriptedEngine::new(&journal), true).unwrap();

    let frame = red_frame(64, 36);
    assert_left_person_over_blue(processor.process(&frame));
    assert!(journal.entries().contains(&"predict:256x144".to_string()));
}

#[test]
fn missing_shared_memory_falls_back_to_transfer() {
    let journal = Journal::default();
    let mut processor = replacing_blue(default_options(), ScriptedEngine::new(&journal), false).unwrap();

    let frame = red_frame(64, 36);
    assert_left_person_over_blue(processor.process(&frame));
}

#[test]
fn engine_build_brings_the_worker_up() {
    let journal = Journal::default();
    let options = ProcessorOptions {
        assets: AssetSource::Engine {
            cdn_base: "/opt/assets".to_string(),
            versioning: Default::default(),
        },
        ..default_options()
    };
    let mut processor = replacing_blue(options, ScriptedEngine::new(&journal), true).unwrap();
    assert_eq!(journal.entries(), vec!["buildEngine:/opt/assets"]);

    assert_left_person_over_blue(processor.process(&red_frame(64, 36)));
}

#[test]
fn dimension_change_reconfigures_the_stream() {
    let journal = Journal::default();
    let mut processor = replacing_blue(default_options(), ScriptedEngine::new(&journal), true).unwrap();

    processor.process(&red_frame(64, 36));
    assert_eq!(processor.stream_parameters().unwrap().dimensions(), (64, 36));

    let frame = red_frame(32, 18);
    let output = processor.process(&frame);
    assert_eq!((output.width(), output.height()), (32, 18));
    assert_left_person_over_blue(output);
    assert_eq!(processor.stream_parameters().unwrap().dimensions(), (32, 18));
    assert_eq!(processor.scale_factors(), (8.0, 8.0));
}

#[test]
fn empty_frame_is_returned_untouched() {
    let journal = Journal::default();
    let mut processor = replacing_blue(default_options(), ScriptedEngine::new(&journal), true).unwrap();

    let frame = VideoFrame::blank(0, 0, 15);
    assert!(std::ptr::eq(processor.process(&frame), &frame));
    assert_eq!(journal.count("predict"), 0);
}

#[test]
fn inactive_config_passes_frames_through() {
    let journal = Journal::default();
    let mut processor = replacing_blue(default_options(), ScriptedEngine::new(&journal), true).unwrap();
    processor
        .set_effect_config(EffectConfiguration::default())
        .unwrap();

    let frame = red_frame(64, 36);
    assert!(std::ptr::eq(processor.process(&frame), &frame));
    assert_eq!(journal.count("predict"), 0);
}

#[test]
fn rejected_config_keeps_the_current_one() {
    let journal = Journal::default();
    let mut processor = replacing_blue(default_options(), ScriptedEngine::new(&journal), true).unwrap();
    let before = processor.effect_config();

    let mut conflicting = EffectConfiguration::blur(BlurStrength::Low);
    conflicting.replacement.enabled = true;
    assert!(matches!(
        processor.set_effect_config(conflicting),
        Err(ProcessorError::Config(ConfigError::ConflictingEffects))
    ));

    assert!(matches!(
        processor.set_effect_config(EffectConfiguration::replace_with_color("#zz0000")),
        Err(ProcessorError::Config(ConfigError::InvalidHexColor(_)))
    ));
    assert!(matches!(
        processor.set_effect_config(EffectConfiguration::replace_with_color("chartreuse-ish")),
        Err(ProcessorError::Config(ConfigError::UnknownColor(_)))
    ));
    assert!(matches!(
        processor.set_effect_config(EffectConfiguration::replace_with_image("/no/such/background.png")),
        Err(ProcessorError::Config(ConfigError::ImageLoad { .. }))
    ));

    assert_eq!(processor.effect_config(), before);
    assert_left_person_over_blue(processor.process(&red_frame(64, 36)));
}

#[test]
fn effect_config_is_a_copy() {
    let journal = Journal::default();
    let processor = replacing_blue(default_options(), ScriptedEngine::new(&journal), true).unwrap();

    let mut copy = processor.effect_config();
    copy.replacement.color = Some("white".to_string());
    assert_eq!(
        processor.effect_config().replacement.color.as_deref(),
        Some("#0000ff")
    );
}

#[test]
fn failed_initialize_leaves_processor_unusable() {
    let journal = Journal::default();
    let error = replacing_blue(
        default_options(),
        ScriptedEngine::new(&journal).failing_initialize(),
        true,
    )
    .err()
    .unwrap();
    assert!(matches!(
        error,
        ProcessorError::Assets(WorkerError::ModuleInitialize)
    ));
    assert!(error.to_string().contains("module failed to initialize"));

    // Callers fall back to passthrough.
    let mut fallback = NoOpProcessor;
    let frame = red_frame(8, 8);
    assert!(std::ptr::eq(fallback.process(&frame), &frame));
}

#[test]
fn failed_model_load_reports_status() {
    let journal = Journal::default();
    let clock = ManualClock::new();
    let mut processor =
        EffectsProcessor::new(default_options(), manual_capabilities(&clock, true)).unwrap();
    processor
        .set_effect_config(EffectConfiguration::replace_with_color("blue"))
        .unwrap();

    let error = processor
        .load_assets(ScriptedEngine::new(&journal).failing_load().boxed())
        .unwrap_err();
    assert!(error.to_string().contains("model failed to load, status=0"));
    assert_eq!(processor.state(), ProcessorState::Uninitialized);

    let frame = red_frame(16, 16);
    assert!(std::ptr::eq(processor.process(&frame), &frame));

    // A second attempt with a working engine recovers.
    processor
        .load_assets(ScriptedEngine::new(&journal).boxed())
        .unwrap();
    assert_eq!(processor.state(), ProcessorState::Ready);
    assert_left_person_over_blue(processor.process(&red_frame(64, 36)));
}

#[test]
fn budget_out_of_range_is_rejected_up_front() {
    let clock = ManualClock::new();
    let options = ProcessorOptions {
        cpu_budget_percent: 101,
        ..default_options()
    };
    assert!(matches!(
        EffectsProcessor::new(options, manual_capabilities(&clock, true)),
        Err(ProcessorError::Config(ConfigError::BudgetOutOfRange { value: 101, .. }))
    ));
}

#[test]
fn failed_frame_returns_the_input() {
    let journal = Journal::default();
    let mut processor = replacing_blue(
        default_options(),
        ScriptedEngine::new(&journal).failing_predict(),
        true,
    )
    .unwrap();

    let frame = red_frame(64, 36);
    assert!(std::ptr::eq(processor.process(&frame), &frame));
    assert!(!processor.has_mask());

    // The shared region was handed back, so the next frame is attempted too.
    let frame = red_frame(64, 36);
    assert!(std::ptr::eq(processor.process(&frame), &frame));
    assert_eq!(journal.count("predict"), 2);
}

#[test]
fn shutdown_during_inference_returns_the_input() {
    let journal = Journal::default();
    let (engine_gate, handle) = gate();
    let mut processor = replacing_blue(
        default_options(),
        ScriptedEngine::new(&journal).gated(engine_gate),
        true,
    )
    .unwrap();
    let shutdown = processor.shutdown_handle();

    let frame = red_frame(64, 36);
    let inference = thread::spawn(move || {
        let passthrough = std::ptr::eq(processor.process(&frame), &frame);
        (processor, passthrough)
    });

    handle.entered.recv().unwrap();
    shutdown.shutdown();
    handle.release.send(()).unwrap();

    let (mut processor, passthrough) = inference.join().unwrap();
    assert!(passthrough);
    assert!(shutdown.is_shutdown());
    assert_eq!(processor.state(), ProcessorState::Destroyed);
    assert!(!processor.has_mask());

    let frame = red_frame(64, 36);
    assert!(std::ptr::eq(processor.process(&frame), &frame));

    processor.destroy();
    assert!(matches!(
        processor.set_effect_config(EffectConfiguration::blur(BlurStrength::High)),
        Err(ProcessorError::Destroyed)
    ));
    assert_eq!(journal.count("destroyAssets"), 1);
}

#[test]
fn destroy_is_idempotent() {
    let journal = Journal::default();
    let mut processor = replacing_blue(default_options(), ScriptedEngine::new(&journal), true).unwrap();
    processor.process(&red_frame(64, 36));

    processor.destroy();
    processor.destroy();
    drop(processor);
    assert_eq!(journal.count("destroyAssets"), 1);
}

#[test]
fn model_blur_strength_change_reloads_the_model() {
    let journal = Journal::default();
    let clock = ManualClock::new();
    let options = ProcessorOptions {
        blur_method: BlurMethod::Model,
        ..default_options()
    };
    let mut processor = EffectsProcessor::create(
        options,
        manual_capabilities(&clock, true),
        ScriptedEngine::new(&journal).boxed(),
        EffectConfiguration::blur(BlurStrength::Low),
    )
    .unwrap();
    assert_eq!(journal.entries(), vec!["initialize", "loadModel:7"]);

    let frame = red_frame(64, 36);
    let output = processor.process(&frame).surface().unwrap();
    assert_eq!(output.get_pixel(0, 18).0, RED);
    assert_eq!(output.get_pixel(63, 18).0, common::MODEL_BLUR_COLOR);

    processor
        .set_effect_config(EffectConfiguration::blur(BlurStrength::High))
        .unwrap();
    assert_eq!(
        journal.entries()[2..],
        ["predict:256x144", "destroyAssets", "loadModel:25"]
    );

    // Same strength again: nothing to reload.
    processor
        .set_effect_config(EffectConfiguration::blur(BlurStrength::High))
        .unwrap();
    assert_eq!(journal.count("loadModel"), 2);
}

fn blurring_with_model(engine: ScriptedEngine) -> EffectsProcessor {
    let clock = ManualClock::new();
    let options = ProcessorOptions {
        blur_method: BlurMethod::Model,
        ..default_options()
    };
    EffectsProcessor::create(
        options,
        manual_capabilities(&clock, true),
        engine.boxed(),
        EffectConfiguration::blur(BlurStrength::Low),
    )
    .unwrap()
}

#[test]
fn failed_model_reload_restores_the_previous_model() {
    let journal = Journal::default();
    let mut processor =
        blurring_with_model(ScriptedEngine::new(&journal).failing_load_attempts(&[2]));
    processor.process(&red_frame(64, 36));

    let error = processor
        .set_effect_config(EffectConfiguration::blur(BlurStrength::High))
        .unwrap_err();
    assert!(matches!(
        error,
        ProcessorError::Assets(WorkerError::ModelLoad(0))
    ));
    assert_eq!(processor.effect_config(), EffectConfiguration::blur(BlurStrength::Low));
    assert_eq!(processor.state(), ProcessorState::Ready);
    assert_eq!(
        journal.entries()[2..],
        ["predict:256x144", "destroyAssets", "loadModel:25", "loadModel:7"]
    );

    for _ in 0..5 {
        let frame = red_frame(64, 36);
        let output = processor.process(&frame);
        assert!(!std::ptr::eq(output, &frame));
        let surface = output.surface().unwrap();
        assert_eq!(surface.get_pixel(0, 18).0, RED);
        assert_eq!(surface.get_pixel(63, 18).0, common::MODEL_BLUR_COLOR);
    }
    assert_eq!(journal.count("predict"), 6);
}

#[test]
fn unrecoverable_model_reload_passes_frames_through() {
    let journal = Journal::default();
    let mut processor =
        blurring_with_model(ScriptedEngine::new(&journal).failing_load_attempts(&[2, 3]));
    processor.process(&red_frame(64, 36));

    assert!(processor
        .set_effect_config(EffectConfiguration::blur(BlurStrength::High))
        .is_err());
    assert_eq!(processor.state(), ProcessorState::Uninitialized);
    assert!(!processor.has_mask());

    let frame = red_frame(64, 36);
    assert!(std::ptr::eq(processor.process(&frame), &frame));
    assert_eq!(journal.count("predict"), 1);

    let fresh = Journal::default();
    processor
        .load_assets(ScriptedEngine::new(&fresh).boxed())
        .unwrap();
    assert_eq!(fresh.entries(), vec!["initialize", "loadModel:7"]);
    let frame = red_frame(64, 36);
    let output = processor.process(&frame).surface().unwrap();
    assert_eq!(output.get_pixel(63, 18).0, common::MODEL_BLUR_COLOR);
}

#[test]
fn frame_without_a_mask_is_all_background() {
    let journal = Journal::default();
    let clock = ManualClock::new();
    let options = ProcessorOptions {
        throttle: ThrottleStrategy::CpuObserver,
        ..default_options()
    };
    let mut processor = EffectsProcessor::create(
        options,
        manual_capabilities(&clock, true),
        ScriptedEngine::new(&journal).costing(&clock, 77).boxed(),
        EffectConfiguration::replace_with_color("blue"),
    )
    .unwrap();
    // Load pushes the divisor to 2 on the 66th frame.
    for _ in 0..66 {
        processor.process(&red_frame(64, 36));
    }
    assert_eq!(processor.divisor(), 2);

    // A new model starts without a mask, and the next frame is not segmented.
    let fresh = Journal::default();
    processor
        .load_assets(ScriptedEngine::new(&fresh).boxed())
        .unwrap();
    assert_eq!(processor.state(), ProcessorState::Ready);

    let frame = red_frame(64, 36);
    let output = processor.process(&frame);
    assert!(!std::ptr::eq(output, &frame));
    assert!(output.surface().unwrap().pixels().all(|p| p.0 == BLUE));
    assert_eq!(fresh.count("predict"), 0);
    assert!(!processor.has_mask());

    assert_left_person_over_blue(processor.process(&red_frame(64, 36)));
    assert_eq!(fresh.count("predict"), 1);
}

#[derive(Default)]
struct RecordingObserver {
    durations: Mutex<Vec<FilterDurationHighEvent>>,
    cpu: Mutex<Vec<CpuUtilizationHighEvent>>,
}

impl FilterObserver for RecordingObserver {
    fn filter_frame_duration_high(&self, event: &FilterDurationHighEvent) {
        self.durations.lock().push(event.clone());
    }

    fn filter_cpu_utilization_high(&self, event: &CpuUtilizationHighEvent) {
        self.cpu.lock().push(event.clone());
    }
}

#[test]
fn slow_filtering_notifies_observers() {
    let journal = Journal::default();
    let clock = ManualClock::new();
    let mut processor = EffectsProcessor::create(
        default_options(),
        manual_capabilities(&clock, true),
        ScriptedEngine::new(&journal).costing(&clock, 77).boxed(),
        EffectConfiguration::replace_with_color("blue"),
    )
    .unwrap();
    let recorder = Arc::new(RecordingObserver::default());
    let observer: Arc<dyn FilterObserver> = recorder.clone();
    processor.add_observer(Arc::clone(&observer));

    // Thirteen frames fill the first second; the fourteenth reports it.
    for _ in 0..14 {
        processor.process(&red_frame(64, 36));
    }

    let durations = recorder.durations.lock().clone();
    assert_eq!(durations.len(), 1);
    assert_eq!(durations[0].avg_filter_duration_millis, 77);
    assert_eq!(durations[0].framerate, 15);
    assert_eq!(durations[0].period_millis, 1001);
    assert_eq!(durations[0].frames_dropped, 2);

    let cpu = recorder.cpu.lock().clone();
    assert_eq!(cpu.len(), 1);
    assert_eq!(cpu[0].cpu_utilization, 100);

    processor.remove_observer(&observer);
    for _ in 0..14 {
        processor.process(&red_frame(64, 36));
    }
    assert_eq!(recorder.durations.lock().len(), 1);
    assert_eq!(recorder.cpu.lock().len(), 1);
}

#[test]
fn cpu_observer_throttle_backs_off_under_load() {
    let journal = Journal::default();
    let clock = ManualClock::new();
    let options = ProcessorOptions {
        throttle: ThrottleStrategy::CpuObserver,
        ..default_options()
    };
    let mut processor = EffectsProcessor::create(
        options,
        manual_capabilities(&clock, true),
        ScriptedEngine::new(&journal).costing(&clock, 77).boxed(),
        EffectConfiguration::replace_with_color("blue"),
    )
    .unwrap();
    assert_eq!(processor.divisor(), 1);

    // Every frame is filtered until the first report past the 5 s window.
    for _ in 0..65 {
        processor.process(&red_frame(64, 36));
    }
    assert_eq!(processor.divisor(), 1);
    assert_eq!(journal.count("predict"), 65);

    processor.process(&red_frame(64, 36));
    assert_eq!(processor.divisor(), 2);

    for _ in 0..20 {
        processor.process(&red_frame(64, 36));
    }
    assert_eq!(processor.divisor(), 2);
    assert!(journal.count("predict") < 87);
}
