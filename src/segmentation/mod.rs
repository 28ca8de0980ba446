mod engine;
mod preprocess;
mod rvm;
mod selfie;
pub mod types;

pub use engine::{OnnxInferenceEngine, ENGINE_MODEL_PATH};
pub use preprocess::{Preprocessor, TensorLayout};
pub use rvm::RobustVideoMatting;
pub use selfie::SelfieSegmentation;
pub use types::{SegmentationMask, SegmentationModel};

use crate::config::ModelSpec;
use anyhow::{bail, Context, Result};
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::Path;

/// Strip a `file://` prefix so model URLs and plain paths both work
pub fn model_path(url: &str) -> &str {
    url.strip_prefix("file://").unwrap_or(url)
}

/// Build an ONNX Runtime session for the model at `path`
pub fn build_session(path: &Path) -> Result<Session> {
    if !path.exists() {
        bail!("model file {} does not exist", path.display());
    }

    tracing::info!("Loading segmentation model from {}", path.display());

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(path)
        .with_context(|| format!("Failed to load model from {}", path.display()))?;

    Ok(session)
}

/// Load the model described by `spec`, picking the family from its inputs
///
/// One input is selfie segmentation; five or more is RobustVideoMatting.
pub fn create_model(spec: &ModelSpec) -> Result<Box<dyn SegmentationModel>> {
    let session = build_session(Path::new(model_path(&spec.path)))?;
    let input_size = (spec.input.width, spec.input.height);
    let output_size = (spec.output.width, spec.output.height);

    match session.inputs.len() {
        1 => Ok(Box::new(SelfieSegmentation::new(
            session,
            input_size,
            output_size,
            spec.input.range,
        ))),
        n if n >= 5 => Ok(Box::new(RobustVideoMatting::new(
            session,
            input_size,
            output_size,
            spec.input.range,
        ))),
        n => bail!("unsupported segmentation model with {} inputs", n),
    }
}
