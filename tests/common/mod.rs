#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use backdrop::clock::ManualClock;
use backdrop::config::{Capabilities, ProcessorOptions};
use backdrop::segmentation::SegmentationMask;
use backdrop::worker::{
    BuildEnginePayload, InferenceEngine, InitializePayload, LoadModelPayload, Outbox, Prediction,
};
use crossbeam_channel::{Receiver, Sender};
use image::{GrayImage, Luma, Rgba, RgbaImage};
use parking_lot::Mutex;

/// Color the scripted engine paints its blurred copy with.
pub const MODEL_BLUR_COLOR: [u8; 4] = [10, 20, 30, 255];

/// Requests the engine saw, in order.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Engine side of a gate: `predict` announces itself and waits for release.
pub struct Gate {
    entered: Sender<()>,
    release: Receiver<()>,
}

/// Test side of a gate.
pub struct GateHandle {
    pub entered: Receiver<()>,
    pub release: Sender<()>,
}

pub fn gate() -> (Gate, GateHandle) {
    let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
    let (release_tx, release_rx) = crossbeam_channel::unbounded();
    (
        Gate {
            entered: entered_tx,
            release: release_rx,
        },
        GateHandle {
            entered: entered_rx,
            release: release_tx,
        },
    )
}

/// Deterministic stand-in for the ONNX engine. Its mask marks the left half
/// of every input as foreground.
pub struct ScriptedEngine {
    journal: Journal,
    fail_initialize: bool,
    fail_load: bool,
    failing_load_attempts: Vec<u32>,
    load_attempts: u32,
    fail_predict: bool,
    shared_memory: bool,
    announce: Option<String>,
    gate: Option<Gate>,
    cost: Option<(ManualClock, Duration)>,
    outbox: Option<Outbox>,
    loaded: bool,
    blur_pixels: u32,
}

impl ScriptedEngine {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            fail_initialize: false,
            fail_load: false,
            failing_load_attempts: Vec::new(),
            load_attempts: 0,
            fail_predict: false,
            shared_memory: true,
            announce: None,
            gate: None,
            cost: None,
            outbox: None,
            loaded: false,
            blur_pixels: 0,
        }
    }

    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    /// Fail only the listed `loadModel` attempts, counted from 1.
    pub fn failing_load_attempts(mut self, attempts: &[u32]) -> Self {
        self.failing_load_attempts = attempts.to_vec();
        self
    }

    pub fn failing_predict(mut self) -> Self {
        self.fail_predict = true;
        self
    }

    pub fn without_shared_memory(mut self) -> Self {
        self.shared_memory = false;
        self
    }

    /// Post a message with `tag` while initializing.
    pub fn announcing(mut self, tag: &str) -> Self {
        self.announce = Some(tag.to_string());
        self
    }

    pub fn gated(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Advance `clock` by `millis` inside every prediction.
    pub fn costing(mut self, clock: &ManualClock, millis: u64) -> Self {
        self.cost = Some((clock.clone(), Duration::from_millis(millis)));
        self
    }

    pub fn boxed(self) -> Box<dyn InferenceEngine> {
        Box::new(self)
    }
}

impl InferenceEngine for ScriptedEngine {
    fn initialize(&mut self, _payload: &InitializePayload) -> Result<()> {
        self.journal.record("initialize");
        if let (Some(tag), Some(outbox)) = (&self.announce, &self.outbox) {
            outbox.post(tag.clone());
        }
        if self.fail_initialize {
            bail!("runtime refused to start");
        }
        Ok(())
    }

    fn load_model(&mut self, payload: &LoadModelPayload) -> Result<()> {
        self.journal.record(format!("loadModel:{}", payload.blur_pixels));
        self.load_attempts += 1;
        if self.fail_load || self.failing_load_attempts.contains(&self.load_attempts) {
            bail!("model rejected");
        }
        self.loaded = true;
        self.blur_pixels = payload.blur_pixels;
        Ok(())
    }

    fn build_engine(&mut self, payload: &BuildEnginePayload) -> Result<()> {
        self.journal.record(format!("buildEngine:{}", payload.cdn_base));
        if self.fail_load {
            bail!("engine rejected");
        }
        self.loaded = true;
        self.blur_pixels = 0;
        Ok(())
    }

    fn predict(&mut self, input: &RgbaImage) -> Result<Prediction> {
        let (width, height) = input.dimensions();
        self.journal.record(format!("predict:{}x{}", width, height));
        if let Some(gate) = &self.gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }
        if let Some((clock, cost)) = &self.cost {
            clock.advance(*cost);
        }
        if self.fail_predict || !self.loaded {
            bail!("prediction failed");
        }

        let alpha = GrayImage::from_fn(width, height, |x, _| {
            Luma([if x < width / 2 { u8::MAX } else { 0 }])
        });
        let blurred =
            (self.blur_pixels > 0).then(|| RgbaImage::from_pixel(width, height, Rgba(MODEL_BLUR_COLOR)));
        Ok(Prediction {
            mask: SegmentationMask::from_alpha(alpha),
            blurred,
        })
    }

    fn destroy_assets(&mut self) {
        self.journal.record("destroyAssets");
        self.loaded = false;
        self.blur_pixels = 0;
    }

    fn supports_shared_memory(&self) -> bool {
        self.shared_memory
    }

    fn attach_outbox(&mut self, outbox: Outbox) {
        self.outbox = Some(outbox);
    }
}

pub fn manual_capabilities(clock: &ManualClock, shared_memory: bool) -> Capabilities {
    Capabilities::new(shared_memory, Arc::new(clock.clone()))
}

pub fn default_options() -> ProcessorOptions {
    ProcessorOptions::default()
}

/// A uniformly colored frame.
pub fn solid(width: u32, height: u32, color: [u8; 4]) -> RgbaImage {
    RgbaImage::from_pixel(width, height, Rgba(color))
}
