//! Effect and processor configuration.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;

/// Lowest accepted processing budget, in percent of wall time.
pub const MIN_PROCESSING_BUDGET: u32 = 10;
/// Highest accepted processing budget, in percent of wall time.
pub const MAX_PROCESSING_BUDGET: u32 = 100;
pub const DEFAULT_PROCESSING_BUDGET: u32 = 50;
pub const DEFAULT_REPORTING_PERIOD_MILLIS: u64 = 1000;

/// Frame height the blur strengths are tuned for.
const BLUR_REFERENCE_HEIGHT: u32 = 540;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BlurStrength {
    Low,
    Medium,
    High,
}

impl BlurStrength {
    /// Blur radius in pixels at 540p.
    pub fn base_pixels(self) -> u32 {
        match self {
            BlurStrength::Low => 7,
            BlurStrength::Medium => 15,
            BlurStrength::High => 25,
        }
    }

    /// Blur radius for a frame of the given height, scaled from 540p.
    pub fn blur_pixels(self, frame_height: u32) -> u32 {
        let scaled = self.base_pixels() as f64 * frame_height as f64 / BLUR_REFERENCE_HEIGHT as f64;
        scaled.round() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlurConfig {
    pub enabled: bool,
    pub strength: BlurStrength,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementConfig {
    pub enabled: bool,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

/// Which background effect runs. Blur and replacement are mutually
/// exclusive, and replacement needs exactly one of an image or a color.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectConfiguration {
    pub blur: BlurConfig,
    pub replacement: ReplacementConfig,
}

impl Default for EffectConfiguration {
    fn default() -> Self {
        Self {
            blur: BlurConfig {
                enabled: false,
                strength: BlurStrength::Low,
            },
            replacement: ReplacementConfig {
                enabled: false,
                image_url: None,
                color: Some("black".to_string()),
            },
        }
    }
}

impl EffectConfiguration {
    pub fn blur(strength: BlurStrength) -> Self {
        let mut config = Self::default();
        config.blur = BlurConfig {
            enabled: true,
            strength,
        };
        config
    }

    pub fn replace_with_color(color: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.replacement = ReplacementConfig {
            enabled: true,
            image_url: None,
            color: Some(color.into()),
        };
        config
    }

    pub fn replace_with_image(url: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.replacement = ReplacementConfig {
            enabled: true,
            image_url: Some(url.into()),
            color: None,
        };
        config
    }

    /// Whether any effect is enabled. With none, frames pass through.
    pub fn is_active(&self) -> bool {
        self.blur.enabled || self.replacement.enabled
    }

    /// Structural checks. Loading the replacement image and parsing the
    /// color happen when the background is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.blur.enabled && self.replacement.enabled {
            return Err(ConfigError::ConflictingEffects);
        }
        if self.replacement.enabled {
            let has_url = self.replacement.image_url.as_deref().is_some_and(|u| !u.is_empty());
            let has_color = self.replacement.color.as_deref().is_some_and(|c| !c.is_empty());
            match (has_url, has_color) {
                (true, true) => return Err(ConfigError::AmbiguousReplacement),
                (false, false) => return Err(ConfigError::MissingReplacementSource),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read effect config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse effect config {}", path.display()))?;
        Ok(config)
    }
}

impl fmt::Display for EffectConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

/// Input or output tensor shape of the segmentation model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelShape {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub range: (f32, f32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Path (or `file://` URL) of the ONNX model.
    pub path: String,
    pub input: ModelShape,
    pub output: ModelShape,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            path: "models/selfie_segmentation.onnx".to_string(),
            input: ModelShape {
                width: 256,
                height: 144,
                channels: 4,
                range: (0.0, 1.0),
            },
            output: ModelShape {
                width: 256,
                height: 144,
                channels: 1,
                range: (0.0, 1.0),
            },
        }
    }
}

/// Runtime library locations handed to the worker's `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimePaths {
    pub runtime_path: String,
    pub simd_path: String,
}

/// Version tags attached to an engine build request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersioningParams {
    pub asset_group: String,
    pub revision_id: Option<String>,
    pub sdk: String,
    pub ua: String,
}

impl Default for VersioningParams {
    fn default() -> Self {
        let version = env!("CARGO_PKG_VERSION");
        let mut parts = version.split('.');
        let major = parts.next().unwrap_or("0");
        let minor = parts.next().unwrap_or("0");
        Self {
            asset_group: format!("sdk-{}.{}", major, minor),
            revision_id: None,
            sdk: version.to_string(),
            ua: format!("{}/{}", env!("CARGO_PKG_NAME"), version),
        }
    }
}

/// How the worker is brought up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetSource {
    /// `initialize` with runtime paths, then `loadModel` with the model spec.
    Explicit(RuntimePaths),
    /// `buildEngine` against an asset base directory.
    Engine {
        cdn_base: String,
        versioning: VersioningParams,
    },
}

impl Default for AssetSource {
    fn default() -> Self {
        AssetSource::Explicit(RuntimePaths::default())
    }
}

/// Which throttle adapts the inference rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ThrottleStrategy {
    /// Reacts to CPU-high reports, at most one step per 5 s window.
    CpuObserver,
    /// Re-evaluates every 500 frames against the measured inference share.
    #[default]
    SamplingWindow,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TransferMode {
    /// Hand each input buffer to the worker by move.
    Transfer,
    /// Reuse one region shared with the worker.
    #[default]
    SharedMemory,
}

/// Where the blurred background comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BlurMethod {
    /// Blur the full-resolution source in the compositor.
    #[default]
    Filter,
    /// Let the worker return a blurred copy at model resolution.
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorOptions {
    pub model: ModelSpec,
    pub assets: AssetSource,
    pub reporting_period_millis: u64,
    /// Share of wall time inference may use, in percent.
    pub cpu_budget_percent: u32,
    pub throttle: ThrottleStrategy,
    pub transfer_mode: TransferMode,
    pub blur_method: BlurMethod,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            model: ModelSpec::default(),
            assets: AssetSource::default(),
            reporting_period_millis: DEFAULT_REPORTING_PERIOD_MILLIS,
            cpu_budget_percent: DEFAULT_PROCESSING_BUDGET,
            throttle: ThrottleStrategy::default(),
            transfer_mode: TransferMode::default(),
            blur_method: BlurMethod::default(),
        }
    }
}

impl ProcessorOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_PROCESSING_BUDGET..=MAX_PROCESSING_BUDGET).contains(&self.cpu_budget_percent) {
            return Err(ConfigError::BudgetOutOfRange {
                value: self.cpu_budget_percent,
                min: MIN_PROCESSING_BUDGET,
                max: MAX_PROCESSING_BUDGET,
            });
        }
        Ok(())
    }
}

/// Host capabilities, built once and handed to every component that needs
/// them.
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// Whether a region shared with the worker may be used.
    pub shared_memory: bool,
    pub clock: Arc<dyn Clock>,
}

impl Capabilities {
    pub fn new(shared_memory: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared_memory,
            clock,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::new(true, Arc::new(SystemClock::new()))
    }
}
