use thiserror::Error;

use crate::worker::shared::Phase;

/// Rejections raised by `EffectsProcessor::set_effect_config` and by option
/// validation. The active configuration is never modified when one of these
/// is returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("background blur and background replacement can not both be enabled")]
    ConflictingEffects,

    #[error("background replacement can not have both an image URL and a color")]
    AmbiguousReplacement,

    #[error("background replacement needs either an image URL or a color")]
    MissingReplacementSource,

    #[error("invalid hexadecimal color code for replacement background: {0}")]
    InvalidHexColor(String),

    #[error("invalid color for replacement background: {0}")]
    UnknownColor(String),

    #[error("unsupported replacement image URL: {0}")]
    UnsupportedImageUrl(String),

    #[error("replacement image {url} failed to load")]
    ImageLoad {
        url: String,
        #[source]
        source: image::ImageError,
    },

    #[error("processing budget must be within {min}..={max} percent, got {value}")]
    BudgetOutOfRange { value: u32, min: u32, max: u32 },
}

/// Failures on the inference worker boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("module failed to initialize")]
    ModuleInitialize,

    #[error("model failed to load, status={0}")]
    ModelLoad(u32),

    #[error("engine failed to build, status={0}")]
    EngineBuild(u32),

    #[error("failed to perform a segmentation on the input image")]
    Segmentation,

    #[error("a {0} request is already outstanding")]
    RequestOutstanding(&'static str),

    #[error("inference worker is not running")]
    Disconnected,

    #[error("failed to spawn inference worker: {0}")]
    Spawn(String),

    #[error("shared region is {actual:?}, expected {expected:?}")]
    SharedRegion { expected: Phase, actual: Phase },

    #[error("shared region holds {actual} bytes, input needs {expected}")]
    SharedRegionSize { expected: usize, actual: usize },
}

/// A failure confined to one frame. `process` logs it and hands back the
/// input frame.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("segmentation mask could not be generated: {0}")]
    Inference(#[from] WorkerError),

    #[error("output surface is {output:?} but source frame is {frame:?}")]
    DimensionMismatch {
        output: (u32, u32),
        frame: (u32, u32),
    },

    #[error("no inference worker is attached")]
    NoWorker,
}

/// Bring-up failures from `EffectsProcessor::load_assets` and `create`.
/// Callers are expected to fall back to `NoOpProcessor`.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("could not load the segmentation assets: {0}")]
    Assets(#[from] WorkerError),

    #[error("invalid processor configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("processor has been destroyed")]
    Destroyed,
}
