use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::{Rgba, RgbaImage};

use super::{ProcessorState, ShutdownHandle, VideoFrameProcessor};
use crate::compositor::{Background, FrameCompositor};
use crate::config::{
    AssetSource, BlurMethod, Capabilities, EffectConfiguration, ProcessorOptions, TransferMode,
};
use crate::error::{ProcessError, ProcessorError, WorkerError};
use crate::frame::{StreamParameters, VideoFrame, DEFAULT_CHANNELS};
use crate::metrics::{FilterObserver, FrameCounter, ObserverSet};
use crate::segmentation::SegmentationMask;
use crate::throttle::Throttle;
use crate::worker::{
    BuildEnginePayload, InferenceEngine, InferenceWorkerClient, InitializePayload,
    LoadModelPayload,
};

/// Background blur / replacement on top of an inference worker.
pub struct EffectsProcessor {
    options: ProcessorOptions,
    capabilities: Capabilities,
    state: ProcessorState,
    destroyed: Arc<AtomicBool>,
    worker: Option<InferenceWorkerClient>,
    config: EffectConfiguration,
    effect_active: bool,
    loaded_blur_pixels: u32,
    compositor: FrameCompositor,
    frame_counter: FrameCounter,
    throttle: Throttle,
    observers: ObserverSet,
    stream: Option<StreamParameters>,
    mask: Option<SegmentationMask>,
    model_blur: Option<RgbaImage>,
    output: VideoFrame,
}

impl EffectsProcessor {
    /// Validate options and build the per-frame components. No worker runs
    /// until [`load_assets`](Self::load_assets).
    pub fn new(options: ProcessorOptions, capabilities: Capabilities) -> Result<Self, ProcessorError> {
        options.validate()?;

        let clock = Arc::clone(&capabilities.clock);
        let frame_counter = FrameCounter::new(
            Arc::clone(&clock),
            options.reporting_period_millis,
            options.cpu_budget_percent,
        );
        let throttle = Throttle::new(options.throttle, clock, options.cpu_budget_percent);
        let compositor = FrameCompositor::new(options.model.input.width, options.model.input.height);

        tracing::debug!(
            "effects processor created, throttle {:?}, transfer {:?}, blur {:?}",
            options.throttle,
            options.transfer_mode,
            options.blur_method
        );

        Ok(Self {
            options,
            capabilities,
            state: ProcessorState::Uninitialized,
            destroyed: Arc::new(AtomicBool::new(false)),
            worker: None,
            config: EffectConfiguration::default(),
            effect_active: false,
            loaded_blur_pixels: 0,
            compositor,
            frame_counter,
            throttle,
            observers: ObserverSet::new(),
            stream: None,
            mask: None,
            model_blur: None,
            output: VideoFrame::blank(0, 0, 0),
        })
    }

    /// Build a processor, apply `config` and bring up the worker.
    ///
    /// On error the caller is expected to fall back to `NoOpProcessor`.
    pub fn create(
        options: ProcessorOptions,
        capabilities: Capabilities,
        engine: Box<dyn InferenceEngine>,
        config: EffectConfiguration,
    ) -> Result<Self, ProcessorError> {
        let mut processor = Self::new(options, capabilities)?;
        processor.set_effect_config(config)?;
        processor.load_assets(engine)?;
        Ok(processor)
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Blur radius the worker should return a blurred copy for.
    fn model_blur_pixels(&self, config: &EffectConfiguration) -> u32 {
        if self.options.blur_method == BlurMethod::Model && config.blur.enabled {
            config.blur.strength.base_pixels()
        } else {
            0
        }
    }

    /// Spawn the worker around `engine` and load the model.
    pub fn load_assets(&mut self, engine: Box<dyn InferenceEngine>) -> Result<(), ProcessorError> {
        if self.is_destroyed() {
            return Err(ProcessorError::Destroyed);
        }
        self.state = ProcessorState::Loading;
        self.mask = None;
        self.model_blur = None;

        match self.bring_up(engine) {
            Ok(worker) => {
                self.worker = Some(worker);
                self.state = ProcessorState::Ready;
                tracing::info!("successfully initialized the effects processor");
                Ok(())
            }
            Err(e) => {
                self.state = ProcessorState::Uninitialized;
                tracing::warn!("could not initialize the effects processor: {}", e);
                Err(e.into())
            }
        }
    }

    fn bring_up(&mut self, engine: Box<dyn InferenceEngine>) -> Result<InferenceWorkerClient, WorkerError> {
        // The old worker goes first so two are never alive at once.
        if let Some(mut old) = self.worker.take() {
            old.terminate();
        }

        let worker = InferenceWorkerClient::spawn(engine, &self.options.model, &self.capabilities)?;
        match &self.options.assets {
            AssetSource::Explicit(paths) => {
                worker.initialize(InitializePayload {
                    wasm_path: paths.runtime_path.clone(),
                    simd_path: paths.simd_path.clone(),
                })?;
                let blur_pixels = self.model_blur_pixels(&self.config);
                worker.load_model(LoadModelPayload::from_spec(&self.options.model, blur_pixels))?;
                self.loaded_blur_pixels = blur_pixels;
            }
            AssetSource::Engine {
                cdn_base,
                versioning,
            } => {
                worker.build_engine(BuildEnginePayload {
                    cdn_base: cdn_base.clone(),
                    versioning_params: versioning.clone(),
                })?;
                self.loaded_blur_pixels = 0;
            }
        }

        if self.options.transfer_mode == TransferMode::SharedMemory && worker.shared_region().is_none() {
            tracing::info!("shared memory unavailable, transferring frames to the worker");
        }
        Ok(worker)
    }

    /// Validate and apply a new effect configuration.
    ///
    /// On error the current configuration is left in place.
    pub fn set_effect_config(&mut self, config: EffectConfiguration) -> Result<(), ProcessorError> {
        if self.is_destroyed() {
            return Err(ProcessorError::Destroyed);
        }
        if config == self.config {
            tracing::debug!("effect configuration unchanged");
            return Ok(());
        }

        let background = Background::for_config(&config, self.options.blur_method)?;

        let blur_pixels = self.model_blur_pixels(&config);
        if blur_pixels != self.loaded_blur_pixels && self.state == ProcessorState::Ready {
            self.reload_model(blur_pixels)?;
        }

        self.compositor.set_background(background);
        self.effect_active = config.is_active();
        tracing::info!("effect configuration set to {}", config);
        self.config = config;
        Ok(())
    }

    /// Swap the loaded model for one returning a `blur_pixels` blurred copy.
    ///
    /// When the new model fails to load the previous one is loaded again, so
    /// a rejected change leaves the worker as it was. If that fails too the
    /// processor drops back to `Uninitialized` and passes frames through
    /// until [`load_assets`](Self::load_assets) succeeds.
    fn reload_model(&mut self, blur_pixels: u32) -> Result<(), ProcessorError> {
        let Some(worker) = self.worker.as_ref() else {
            return Ok(());
        };
        let previous = self.loaded_blur_pixels;

        let outcome = worker
            .destroy_assets()
            .and_then(|()| worker.load_model(LoadModelPayload::from_spec(&self.options.model, blur_pixels)));
        let Err(e) = outcome else {
            self.loaded_blur_pixels = blur_pixels;
            self.model_blur = None;
            return Ok(());
        };

        tracing::warn!("could not reload the model with blur {}: {}", blur_pixels, e);
        match worker.load_model(LoadModelPayload::from_spec(&self.options.model, previous)) {
            Ok(()) => tracing::info!("restored the model with blur {}", previous),
            Err(restore) => {
                tracing::error!("could not restore the previous model: {}", restore);
                self.state = ProcessorState::Uninitialized;
                self.mask = None;
                self.model_blur = None;
            }
        }
        Err(e.into())
    }

    /// A copy of the active configuration.
    pub fn effect_config(&self) -> EffectConfiguration {
        self.config.clone()
    }

    pub fn add_observer(&mut self, observer: Arc<dyn FilterObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_observer(&mut self, observer: &Arc<dyn FilterObserver>) {
        self.observers.remove(observer);
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(Arc::clone(&self.destroyed))
    }

    pub fn state(&self) -> ProcessorState {
        if self.is_destroyed() {
            ProcessorState::Destroyed
        } else {
            self.state
        }
    }

    pub fn divisor(&self) -> u32 {
        self.throttle.divisor()
    }

    pub fn stream_parameters(&self) -> Option<StreamParameters> {
        self.stream
    }

    pub fn has_mask(&self) -> bool {
        self.mask.is_some()
    }

    pub fn scale_factors(&self) -> (f32, f32) {
        self.compositor.scale_factors()
    }

    fn reconfigure(&mut self, width: u32, height: u32, framerate: u32) {
        tracing::info!("stream dimensions changed to {}x{}", width, height);
        self.stream = Some(StreamParameters {
            width,
            height,
            framerate,
            channels: DEFAULT_CHANNELS,
        });
        self.output.resize(width, height);
        self.output.set_framerate(framerate);
        self.compositor.configure_for_stream(width, height);
    }

    /// Run inference on `source` and store the new mask.
    fn segment(&mut self, source: &RgbaImage) -> Result<(), ProcessError> {
        let worker = self.worker.as_ref().ok_or(ProcessError::NoWorker)?;
        let shared = match self.options.transfer_mode {
            TransferMode::SharedMemory => worker.shared_region().cloned(),
            TransferMode::Transfer => None,
        };

        let downsampled = self.compositor.downsample(source);

        let Some(arena) = shared else {
            let input = self.compositor.take_downsampled();
            let prediction = worker.predict(input)?;
            if !self.destroyed.load(Ordering::SeqCst) {
                self.mask = Some(prediction.mask);
                self.model_blur = prediction.blurred;
            }
            return Ok(());
        };

        arena.write_input(downsampled.as_raw())?;
        let completion = worker.predict_shared_memory()?;
        if self.destroyed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let view = arena.read_view()?;
        let (width, height) = arena.output_size();
        let image = view.as_image().ok_or(WorkerError::SharedRegionSize {
            expected: width as usize * height as usize * 4,
            actual: view.as_bytes().len(),
        })?;
        self.mask = Some(SegmentationMask::from_rgba_alpha(&image));
        self.model_blur = completion.blurred.then(|| {
            RgbaImage::from_fn(width, height, |x, y| {
                let p = image.get_pixel(x, y);
                Rgba([p[0], p[1], p[2], u8::MAX])
            })
        });
        Ok(())
    }

    /// Decide, segment if due, and composite. `Ok(false)` when the
    /// processor was destroyed while waiting.
    fn render(&mut self, source: &RgbaImage) -> Result<bool, ProcessError> {
        self.throttle.submit_frame();
        if self.throttle.should_run_inference() {
            self.throttle.inference_started();
            let outcome = self.segment(source);
            self.throttle.inference_completed();
            if self.is_destroyed() {
                tracing::debug!("processor destroyed during inference");
                return Ok(false);
            }
            outcome?;
        }

        let Some(surface) = self.output.surface_mut() else {
            return Ok(false);
        };
        let model_blur = if self.compositor.background().is_some_and(|b| b.is_model_blur()) {
            self.model_blur.as_ref()
        } else {
            None
        };
        self.compositor
            .composite(surface, source, self.mask.as_ref(), model_blur)?;
        Ok(true)
    }

    /// Tear down: flag, release surfaces, then destroy and close the worker.
    pub fn destroy(&mut self) {
        if self.state == ProcessorState::Destroyed {
            return;
        }
        self.destroyed.store(true, Ordering::SeqCst);
        self.state = ProcessorState::Destroyed;
        self.output.dispose();
        self.compositor.release();
        self.mask = None;
        self.model_blur = None;
        if let Some(mut worker) = self.worker.take() {
            worker.terminate();
        }
        tracing::info!("effects processor destroyed");
    }
}

impl VideoFrameProcessor for EffectsProcessor {
    fn process<'a>(&'a mut self, frame: &'a VideoFrame) -> &'a VideoFrame {
        if self.is_destroyed() {
            return frame;
        }

        let report = self.frame_counter.frame_received(frame.framerate());
        if !report.is_empty() {
            self.observers.notify(&report);
            if let Some(event) = &report.cpu_high {
                self.throttle.on_cpu_utilization_high(event);
            }
        }
        self.throttle.frame_received();

        if !self.effect_active || self.state != ProcessorState::Ready {
            return frame;
        }
        let Some(source) = frame.surface() else {
            return frame;
        };
        let (width, height) = source.dimensions();
        if width == 0 || height == 0 {
            return frame;
        }
        if self.stream.map(|s| s.dimensions()) != Some((width, height)) {
            self.reconfigure(width, height, frame.framerate());
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.framerate = frame.framerate();
        }
        self.output.set_framerate(frame.framerate());

        self.frame_counter.filter_submitted();
        let result = self.render(source);
        self.frame_counter.filter_complete();

        match result {
            Ok(true) => &self.output,
            Ok(false) => frame,
            Err(e) => {
                tracing::error!("could not process frame: {}", e);
                frame
            }
        }
    }

    fn destroy(&mut self) {
        EffectsProcessor::destroy(self);
    }
}

impl Drop for EffectsProcessor {
    fn drop(&mut self) {
        self.destroy();
    }
}
