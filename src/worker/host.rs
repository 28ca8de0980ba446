//! Worker side of the protocol: a thread that owns the inference engine and
//! answers one request at a time.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use image::{imageops, RgbaImage};

use super::protocol::{
    BuildEnginePayload, InitializePayload, InitializeStatus, LoadModelPayload, Prediction, Request,
    Response, MODEL_LOAD_FAILURE, MODEL_LOAD_SUCCESS,
};
use super::shared::SharedFrameArena;
use crate::error::WorkerError;
use crate::segmentation::SegmentationMask;

pub const WORKER_THREAD_NAME: &str = "backdrop-inference";

/// The model behind the worker. Runs on the worker thread only.
pub trait InferenceEngine: Send {
    /// Bring up the runtime. An error becomes the falsy `initialize` reply.
    fn initialize(&mut self, payload: &InitializePayload) -> Result<()>;

    fn load_model(&mut self, payload: &LoadModelPayload) -> Result<()>;

    /// Resolve and load the model from an asset base.
    fn build_engine(&mut self, payload: &BuildEnginePayload) -> Result<()>;

    /// Segment one frame at model input resolution.
    fn predict(&mut self, input: &RgbaImage) -> Result<Prediction>;

    /// Drop the loaded model and any per-stream state.
    fn destroy_assets(&mut self);

    fn supports_shared_memory(&self) -> bool {
        true
    }

    /// Receives a handle for posting messages outside the request cycle.
    fn attach_outbox(&mut self, _outbox: Outbox) {}
}

/// Lets an engine post raw messages to the main thread.
#[derive(Debug, Clone)]
pub struct Outbox {
    responses: Sender<Response>,
}

impl Outbox {
    /// Post a message with a tag the client may not know.
    pub fn post(&self, tag: impl Into<String>) -> bool {
        self.responses
            .send(Response::Unknown { tag: tag.into() })
            .is_ok()
    }
}

/// Request handling, separated from the thread loop.
pub struct WorkerHost {
    engine: Box<dyn InferenceEngine>,
    arena: Option<Arc<SharedFrameArena>>,
}

impl WorkerHost {
    pub fn new(engine: Box<dyn InferenceEngine>, arena: Option<Arc<SharedFrameArena>>) -> Self {
        Self { engine, arena }
    }

    fn shared_memory_available(&self) -> bool {
        self.arena.is_some() && self.engine.supports_shared_memory()
    }

    /// Answer one request. `None` means the worker should stop.
    pub fn handle(&mut self, request: Request) -> Option<Response> {
        let tag = request.tag();
        tracing::debug!("worker handling {}", tag);

        let response = match request {
            Request::Initialize(payload) => match self.engine.initialize(&payload) {
                Ok(()) => Response::Initialize(Some(InitializeStatus {
                    supports_shared_memory: self.shared_memory_available(),
                })),
                Err(e) => {
                    tracing::warn!("worker initialize failed: {:#}", e);
                    Response::Initialize(None)
                }
            },
            Request::LoadModel(payload) => {
                let status = match self.engine.load_model(&payload) {
                    Ok(()) => MODEL_LOAD_SUCCESS,
                    Err(e) => {
                        tracing::warn!("worker failed to load {}: {:#}", payload.model_url, e);
                        MODEL_LOAD_FAILURE
                    }
                };
                Response::LoadModel { status }
            }
            Request::BuildEngine(payload) => {
                let status = match self.engine.build_engine(&payload) {
                    Ok(()) => MODEL_LOAD_SUCCESS,
                    Err(e) => {
                        tracing::warn!("worker failed to build engine from {}: {:#}", payload.cdn_base, e);
                        MODEL_LOAD_FAILURE
                    }
                };
                Response::BuildEngine {
                    status,
                    supports_shared_memory: self.shared_memory_available(),
                }
            }
            Request::Predict(input) => match self.engine.predict(&input) {
                Ok(prediction) => Response::Predict(Some(prediction)),
                Err(e) => {
                    tracing::warn!("worker prediction failed: {:#}", e);
                    Response::Predict(None)
                }
            },
            Request::PredictSharedMemory => self.predict_shared(),
            Request::DestroyAssets => {
                self.engine.destroy_assets();
                Response::DestroyAssets
            }
            Request::CloseWorker => return None,
        };
        Some(response)
    }

    fn predict_shared(&mut self) -> Response {
        let failed = Response::PredictSharedMemory {
            completed: false,
            blurred: false,
        };
        let Some(arena) = self.arena.clone() else {
            tracing::warn!("predictSharedMemory without a shared region");
            return failed;
        };

        let (width, height) = arena.input_size();
        let output_size = arena.output_size();
        let engine = &mut self.engine;
        let result = arena.with_worker_access(|input, output| -> Result<bool> {
            let frame = RgbaImage::from_raw(width, height, input.to_vec())
                .ok_or_else(|| anyhow::anyhow!("shared input does not match {}x{}", width, height))?;
            let prediction = engine.predict(&frame)?;
            write_prediction(&prediction, output_size, output);
            Ok(prediction.blurred.is_some())
        });

        match result {
            Ok(Ok(blurred)) => match arena.complete() {
                Ok(()) => Response::PredictSharedMemory {
                    completed: true,
                    blurred,
                },
                Err(e) => {
                    tracing::warn!("could not publish shared result: {}", e);
                    failed
                }
            },
            Ok(Err(e)) => {
                tracing::warn!("worker prediction failed: {:#}", e);
                if let Err(e) = arena.abandon() {
                    tracing::warn!("could not release shared region: {}", e);
                }
                failed
            }
            Err(e) => {
                tracing::warn!("shared region not handed over: {}", e);
                failed
            }
        }
    }
}

/// Lay a prediction out as RGBA: alpha is the mask, RGB the blurred copy.
fn write_prediction(prediction: &Prediction, size: (u32, u32), output: &mut [u8]) {
    let mask = if prediction.mask.dimensions() == size {
        prediction.mask.clone()
    } else {
        SegmentationMask::from_alpha(imageops::resize(
            prediction.mask.alpha(),
            size.0,
            size.1,
            imageops::FilterType::Triangle,
        ))
    };
    prediction_rgb(prediction, size, output);
    for (dst, value) in output.chunks_exact_mut(4).zip(mask.alpha().as_raw()) {
        dst[3] = *value;
    }
}

fn prediction_rgb(prediction: &Prediction, size: (u32, u32), output: &mut [u8]) {
    let Some(blurred) = &prediction.blurred else {
        return;
    };
    let resized;
    let blurred = if blurred.dimensions() == size {
        blurred
    } else {
        resized = imageops::resize(blurred, size.0, size.1, imageops::FilterType::Triangle);
        &resized
    };
    for (dst, src) in output.chunks_exact_mut(4).zip(blurred.pixels()) {
        dst[..3].copy_from_slice(&src.0[..3]);
    }
}

/// Start the worker thread. It runs until `closeWorker` or until the
/// request channel closes.
pub fn spawn_worker(
    mut engine: Box<dyn InferenceEngine>,
    arena: Option<Arc<SharedFrameArena>>,
    requests: Receiver<Request>,
    responses: Sender<Response>,
) -> Result<JoinHandle<()>, WorkerError> {
    engine.attach_outbox(Outbox {
        responses: responses.clone(),
    });

    thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || {
            let mut host = WorkerHost::new(engine, arena);
            tracing::debug!("inference worker started");
            for request in requests.iter() {
                let Some(response) = host.handle(request) else {
                    break;
                };
                if responses.send(response).is_err() {
                    tracing::debug!("response channel closed");
                    break;
                }
            }
            tracing::debug!("inference worker stopped");
        })
        .map_err(|e| WorkerError::Spawn(e.to_string()))
}
