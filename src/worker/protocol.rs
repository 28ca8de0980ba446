//! Messages exchanged with the inference worker.
//!
//! There are no correlation ids. At most one request of each kind is ever
//! outstanding, so a response is matched to its request by tag alone.

use std::fmt;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::config::{ModelSpec, VersioningParams};
use crate::segmentation::SegmentationMask;

/// `loadModel` / `buildEngine` status reported on success.
pub const MODEL_LOAD_SUCCESS: u32 = 2;
/// Status reported when the model could not be loaded.
pub const MODEL_LOAD_FAILURE: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Initialize,
    LoadModel,
    Predict,
    PredictSharedMemory,
    BuildEngine,
    DestroyAssets,
    CloseWorker,
}

impl MessageTag {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageTag::Initialize => "initialize",
            MessageTag::LoadModel => "loadModel",
            MessageTag::Predict => "predict",
            MessageTag::PredictSharedMemory => "predictSharedMemory",
            MessageTag::BuildEngine => "buildEngine",
            MessageTag::DestroyAssets => "destroyAssets",
            MessageTag::CloseWorker => "closeWorker",
        }
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializePayload {
    pub wasm_path: String,
    pub simd_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadModelPayload {
    pub model_url: String,
    pub input_width: u32,
    pub input_height: u32,
    pub input_channels: u32,
    pub range_min: f32,
    pub range_max: f32,
    /// Radius of the blurred copy returned with each mask. 0 disables it.
    pub blur_pixels: u32,
}

impl LoadModelPayload {
    pub fn from_spec(spec: &ModelSpec, blur_pixels: u32) -> Self {
        Self {
            model_url: spec.path.clone(),
            input_width: spec.input.width,
            input_height: spec.input.height,
            input_channels: spec.input.channels,
            range_min: spec.input.range.0,
            range_max: spec.input.range.1,
            blur_pixels,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildEnginePayload {
    pub cdn_base: String,
    pub versioning_params: VersioningParams,
}

/// Main thread → worker.
#[derive(Debug)]
pub enum Request {
    Initialize(InitializePayload),
    LoadModel(LoadModelPayload),
    /// The frame moves to the worker.
    Predict(RgbaImage),
    /// The input is already in the shared region.
    PredictSharedMemory,
    BuildEngine(BuildEnginePayload),
    DestroyAssets,
    CloseWorker,
}

impl Request {
    pub fn tag(&self) -> MessageTag {
        match self {
            Request::Initialize(_) => MessageTag::Initialize,
            Request::LoadModel(_) => MessageTag::LoadModel,
            Request::Predict(_) => MessageTag::Predict,
            Request::PredictSharedMemory => MessageTag::PredictSharedMemory,
            Request::BuildEngine(_) => MessageTag::BuildEngine,
            Request::DestroyAssets => MessageTag::DestroyAssets,
            Request::CloseWorker => MessageTag::CloseWorker,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitializeStatus {
    /// Whether the worker will serve `predictSharedMemory`.
    pub supports_shared_memory: bool,
}

/// What the engine hands back for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub mask: SegmentationMask,
    /// Blurred copy of the input, present when the model was loaded with
    /// `blur_pixels > 0`.
    pub blurred: Option<RgbaImage>,
}

/// Worker → main thread.
#[derive(Debug)]
pub enum Response {
    /// `None` is the falsy payload of a failed module start.
    Initialize(Option<InitializeStatus>),
    LoadModel { status: u32 },
    /// `None` when segmentation failed.
    Predict(Option<Prediction>),
    /// Signal only. The result sits in the shared region.
    PredictSharedMemory { completed: bool, blurred: bool },
    BuildEngine { status: u32, supports_shared_memory: bool },
    DestroyAssets,
    /// A message the client has no handler for.
    Unknown { tag: String },
}

impl Response {
    pub fn tag(&self) -> Option<MessageTag> {
        match self {
            Response::Initialize(_) => Some(MessageTag::Initialize),
            Response::LoadModel { .. } => Some(MessageTag::LoadModel),
            Response::Predict(_) => Some(MessageTag::Predict),
            Response::PredictSharedMemory { .. } => Some(MessageTag::PredictSharedMemory),
            Response::BuildEngine { .. } => Some(MessageTag::BuildEngine),
            Response::DestroyAssets => Some(MessageTag::DestroyAssets),
            Response::Unknown { .. } => None,
        }
    }
}
