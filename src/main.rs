use anyhow::{Context, Result};
use backdrop::capture::{FrameSource, StillImageCapture, WebcamCapture};
use backdrop::config::{
    AssetSource, BlurMethod, BlurStrength, Capabilities, EffectConfiguration, ProcessorOptions,
    ThrottleStrategy, TransferMode, DEFAULT_PROCESSING_BUDGET,
};
use backdrop::frame::{DEFAULT_FRAMERATE, DEFAULT_STREAM_HEIGHT, DEFAULT_STREAM_WIDTH};
use backdrop::output::LoopbackOutput;
use backdrop::pipeline::run_pipeline;
use backdrop::processor::{EffectsProcessor, NoOpProcessor, VideoFrameProcessor};
use backdrop::segmentation::OnnxInferenceEngine;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Replay a still image instead of opening a webcam
    #[arg(long)]
    input_image: Option<PathBuf>,

    /// Output v4l2loopback device path
    #[arg(short, long, default_value = "/dev/video10")]
    output_device: String,

    /// Capture resolution width
    #[arg(long, default_value_t = DEFAULT_STREAM_WIDTH)]
    capture_width: u32,

    /// Capture resolution height
    #[arg(long, default_value_t = DEFAULT_STREAM_HEIGHT)]
    capture_height: u32,

    /// Output resolution width
    #[arg(long, default_value_t = DEFAULT_STREAM_WIDTH)]
    output_width: u32,

    /// Output resolution height
    #[arg(long, default_value_t = DEFAULT_STREAM_HEIGHT)]
    output_height: u32,

    /// Frame rate requested from the camera
    #[arg(long, default_value_t = DEFAULT_FRAMERATE)]
    fps: u32,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Path to segmentation model (ONNX file)
    #[arg(long)]
    model: Option<String>,

    /// Blur the background with this strength
    #[arg(long, value_enum, conflicts_with_all = ["replace_color", "replace_image"])]
    blur: Option<BlurStrength>,

    /// Replace the background with a named or #rrggbb color
    #[arg(long, conflicts_with = "replace_image")]
    replace_color: Option<String>,

    /// Replace the background with an image (path or file:// URL)
    #[arg(long)]
    replace_image: Option<String>,

    /// Read the effect configuration from a JSON file
    #[arg(long, conflicts_with_all = ["blur", "replace_color", "replace_image"])]
    effect_config: Option<PathBuf>,

    /// How the inference rate adapts to load
    #[arg(long, value_enum, default_value_t = ThrottleStrategy::SamplingWindow)]
    throttle: ThrottleStrategy,

    /// How frames reach the inference worker
    #[arg(long, value_enum, default_value_t = TransferMode::SharedMemory)]
    transfer_mode: TransferMode,

    /// Where the blurred background comes from
    #[arg(long, value_enum, default_value_t = BlurMethod::Filter)]
    blur_method: BlurMethod,

    /// Share of wall time inference may use, in percent (10-100)
    #[arg(long, default_value_t = DEFAULT_PROCESSING_BUDGET)]
    cpu_budget: u32,

    /// Build the model from this asset directory instead of --model
    #[arg(long, conflicts_with = "model")]
    asset_base: Option<String>,

    /// Stop after this many frames
    #[arg(long)]
    max_frames: Option<u64>,
}

impl Args {
    fn effect_config(&self) -> Result<EffectConfiguration> {
        if let Some(path) = &self.effect_config {
            return EffectConfiguration::from_json_file(path);
        }
        let config = if let Some(strength) = self.blur {
            EffectConfiguration::blur(strength)
        } else if let Some(color) = &self.replace_color {
            EffectConfiguration::replace_with_color(color.clone())
        } else if let Some(url) = &self.replace_image {
            EffectConfiguration::replace_with_image(url.clone())
        } else {
            EffectConfiguration::default()
        };
        Ok(config)
    }

    fn processor_options(&self) -> ProcessorOptions {
        let mut options = ProcessorOptions {
            throttle: self.throttle,
            transfer_mode: self.transfer_mode,
            blur_method: self.blur_method,
            cpu_budget_percent: self.cpu_budget,
            ..ProcessorOptions::default()
        };
        if let Some(model) = &self.model {
            options.model.path = model.clone();
        }
        if let Some(cdn_base) = &self.asset_base {
            options.assets = AssetSource::Engine {
                cdn_base: cdn_base.clone(),
                versioning: Default::default(),
            };
        }
        options
    }
}

/// Effects processor, or passthrough when bring-up fails.
fn build_processor(args: &Args, config: EffectConfiguration) -> Box<dyn VideoFrameProcessor> {
    if !config.is_active() {
        tracing::info!("Running in passthrough mode (no effect enabled)");
        return Box::new(NoOpProcessor);
    }

    let options = args.processor_options();
    let engine = Box::new(OnnxInferenceEngine::new(options.model.clone()));
    match EffectsProcessor::create(options, Capabilities::default(), engine, config) {
        Ok(processor) => Box::new(processor),
        Err(e) => {
            tracing::warn!("Falling back to passthrough: {}", e);
            Box::new(NoOpProcessor)
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("backdrop starting");
    tracing::info!("Capture: {}x{}", args.capture_width, args.capture_height);
    tracing::info!("Output: {}x{}", args.output_width, args.output_height);
    tracing::info!("Target FPS: {}", args.fps);

    let config = args.effect_config().context("Failed to read effect configuration")?;

    // Initialize capture
    let mut capture: Box<dyn FrameSource> = match &args.input_image {
        Some(path) => Box::new(
            StillImageCapture::open(path, args.capture_width, args.capture_height, args.fps)
                .context("Failed to open still image input")?,
        ),
        None => Box::new(
            WebcamCapture::open(
                args.input_device,
                args.capture_width,
                args.capture_height,
                args.fps,
            )
            .context("Failed to initialize webcam capture")?,
        ),
    };

    // Initialize output
    let mut output = LoopbackOutput::open(&args.output_device, args.output_width, args.output_height)
        .context("Failed to initialize v4l2loopback output")?;

    let mut processor = build_processor(&args, config);

    // Main loop
    let result = run_pipeline(
        capture.as_mut(),
        &mut output,
        processor.as_mut(),
        args.max_frames,
    );
    processor.destroy();

    let stats = result?;
    tracing::info!("Processed {} frames", stats.frames);
    Ok(())
}
