use super::types::SegmentationModel;
use super::{create_model, model_path};
use crate::config::{ModelShape, ModelSpec};
use crate::worker::{
    BuildEnginePayload, InferenceEngine, InitializePayload, LoadModelPayload, Prediction,
};
use anyhow::{bail, Context, Result};
use image::{imageops, RgbaImage};
use std::path::{Path, PathBuf};

/// Where an engine build finds the model under its asset base.
pub const ENGINE_MODEL_PATH: &str = "models/selfie_segmentation.onnx";

/// Worker-side engine backed by ONNX Runtime
pub struct OnnxInferenceEngine {
    model: Option<Box<dyn SegmentationModel>>,
    blur_pixels: u32,
    /// Shapes for engine builds, and the output shape for explicit loads
    default_spec: ModelSpec,
}

impl OnnxInferenceEngine {
    pub fn new(default_spec: ModelSpec) -> Self {
        Self {
            model: None,
            blur_pixels: 0,
            default_spec,
        }
    }

    fn install(&mut self, model: Box<dyn SegmentationModel>, blur_pixels: u32) {
        tracing::info!(
            "Loaded {} model, input {:?}, output {:?}",
            model.name(),
            model.input_size(),
            model.output_size()
        );
        self.model = Some(model);
        self.blur_pixels = blur_pixels;
    }
}

fn check_runtime_path(path: &str) -> Result<()> {
    if !path.is_empty() && !Path::new(model_path(path)).exists() {
        bail!("runtime library {} not found", path);
    }
    Ok(())
}

impl InferenceEngine for OnnxInferenceEngine {
    fn initialize(&mut self, payload: &InitializePayload) -> Result<()> {
        check_runtime_path(&payload.wasm_path)?;
        check_runtime_path(&payload.simd_path)?;
        Ok(())
    }

    fn load_model(&mut self, payload: &LoadModelPayload) -> Result<()> {
        let input = ModelShape {
            width: payload.input_width,
            height: payload.input_height,
            channels: payload.input_channels,
            range: (payload.range_min, payload.range_max),
        };
        let spec = ModelSpec {
            path: payload.model_url.clone(),
            input,
            output: self.default_spec.output,
        };
        let model = create_model(&spec)
            .with_context(|| format!("Failed to load model {}", payload.model_url))?;
        self.install(model, payload.blur_pixels);
        Ok(())
    }

    fn build_engine(&mut self, payload: &BuildEnginePayload) -> Result<()> {
        tracing::info!(
            "Building engine from {} (asset group {}, sdk {})",
            payload.cdn_base,
            payload.versioning_params.asset_group,
            payload.versioning_params.sdk
        );
        let path: PathBuf = Path::new(model_path(&payload.cdn_base)).join(ENGINE_MODEL_PATH);
        let spec = ModelSpec {
            path: path.to_string_lossy().into_owned(),
            ..self.default_spec.clone()
        };
        let model = create_model(&spec)
            .with_context(|| format!("Failed to build engine from {}", payload.cdn_base))?;
        self.install(model, 0);
        Ok(())
    }

    fn predict(&mut self, input: &RgbaImage) -> Result<Prediction> {
        let Some(model) = self.model.as_mut() else {
            bail!("no model loaded");
        };
        let mask = model.segment(input)?;
        let blurred = (self.blur_pixels > 0)
            .then(|| imageops::fast_blur(input, self.blur_pixels as f32));
        Ok(Prediction { mask, blurred })
    }

    fn destroy_assets(&mut self) {
        if let Some(mut model) = self.model.take() {
            model.reset_state();
            tracing::info!("Released {} model", model.name());
        }
        self.blur_pixels = 0;
    }
}
