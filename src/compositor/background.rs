use std::borrow::Cow;
use std::path::Path;

use image::{imageops, Rgba, RgbaImage};

use crate::config::{BlurMethod, BlurStrength, EffectConfiguration, ReplacementConfig};
use crate::error::ConfigError;

const NAMED_COLORS: &[(&str, [u8; 3])] = &[
    ("black", [0, 0, 0]),
    ("white", [255, 255, 255]),
    ("red", [255, 0, 0]),
    ("green", [0, 128, 0]),
    ("blue", [0, 0, 255]),
    ("gray", [128, 128, 128]),
    ("grey", [128, 128, 128]),
    ("yellow", [255, 255, 0]),
    ("cyan", [0, 255, 255]),
    ("magenta", [255, 0, 255]),
    ("orange", [255, 165, 0]),
    ("purple", [128, 0, 128]),
];

/// Parse a replacement color: a named color, `#rgb` or `#rrggbb`.
pub fn parse_color(color: &str) -> Result<Rgba<u8>, ConfigError> {
    let trimmed = color.trim();
    if trimmed.contains('#') {
        return parse_hex(trimmed).ok_or_else(|| ConfigError::InvalidHexColor(color.to_string()));
    }
    let lower = trimmed.to_ascii_lowercase();
    NAMED_COLORS
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, [r, g, b])| Rgba([*r, *g, *b, u8::MAX]))
        .ok_or_else(|| ConfigError::UnknownColor(color.to_string()))
}

fn parse_hex(color: &str) -> Option<Rgba<u8>> {
    let digits = color.strip_prefix('#')?;
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let channel = |s: &str| u8::from_str_radix(s, 16).ok();
    match digits.len() {
        6 => Some(Rgba([
            channel(&digits[0..2])?,
            channel(&digits[2..4])?,
            channel(&digits[4..6])?,
            u8::MAX,
        ])),
        3 => {
            let short = |i: usize| channel(&digits[i..i + 1]).map(|v| v * 17);
            Some(Rgba([short(0)?, short(1)?, short(2)?, u8::MAX]))
        }
        _ => None,
    }
}

/// Load a replacement image from a local path or `file://` URL.
pub fn load_image(url: &str) -> Result<RgbaImage, ConfigError> {
    let path = match url.split_once("://") {
        Some(("file", rest)) => rest,
        Some(_) => return Err(ConfigError::UnsupportedImageUrl(url.to_string())),
        None => url,
    };
    let image = image::open(Path::new(path)).map_err(|source| ConfigError::ImageLoad {
        url: url.to_string(),
        source,
    })?;
    Ok(image.to_rgba8())
}

/// What fills the pixels outside the mask.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplacementSource {
    Color(Rgba<u8>),
    /// The image as loaded, before any stretching.
    Image(RgbaImage),
}

impl ReplacementSource {
    pub fn from_config(config: &ReplacementConfig) -> Result<Self, ConfigError> {
        let url = config.image_url.as_deref().filter(|u| !u.is_empty());
        let color = config.color.as_deref().filter(|c| !c.is_empty());
        match (url, color) {
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousReplacement),
            (Some(url), None) => Ok(ReplacementSource::Image(load_image(url)?)),
            (None, Some(color)) => Ok(ReplacementSource::Color(parse_color(color)?)),
            (None, None) => Err(ConfigError::MissingReplacementSource),
        }
    }

    /// Fill a surface of the given size, stretching images to fit.
    pub fn stretch(&self, width: u32, height: u32) -> RgbaImage {
        match self {
            ReplacementSource::Color(color) => RgbaImage::from_pixel(width, height, *color),
            ReplacementSource::Image(image) if image.dimensions() == (width, height) => image.clone(),
            ReplacementSource::Image(image) => {
                imageops::resize(image, width, height, imageops::FilterType::Triangle)
            }
        }
    }
}

/// Background variant picked once per effect configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum Background {
    /// Blur the full-resolution source.
    FilterBlur { strength: BlurStrength, pixels: u32 },
    /// Upsample the blurred copy the worker returns with each mask.
    ModelBlur { strength: BlurStrength },
    Replacement {
        source: ReplacementSource,
        stretched: Option<RgbaImage>,
    },
}

impl Background {
    /// Build the background for `config`, loading any replacement image.
    /// `None` when no effect is enabled.
    pub fn for_config(
        config: &EffectConfiguration,
        method: BlurMethod,
    ) -> Result<Option<Self>, ConfigError> {
        config.validate()?;
        if config.blur.enabled {
            let strength = config.blur.strength;
            return Ok(Some(match method {
                BlurMethod::Filter => Background::FilterBlur {
                    strength,
                    pixels: strength.base_pixels(),
                },
                BlurMethod::Model => Background::ModelBlur { strength },
            }));
        }
        if config.replacement.enabled {
            let source = ReplacementSource::from_config(&config.replacement)?;
            return Ok(Some(Background::Replacement {
                source,
                stretched: None,
            }));
        }
        Ok(None)
    }

    /// Adapt to a new stream size.
    pub fn resize(&mut self, width: u32, height: u32) {
        match self {
            Background::FilterBlur { strength, pixels } => {
                *pixels = strength.blur_pixels(height);
            }
            Background::ModelBlur { .. } => {}
            Background::Replacement { source, stretched } => {
                *stretched = Some(source.stretch(width, height));
            }
        }
    }

    pub fn release(&mut self) {
        if let Background::Replacement { stretched, .. } = self {
            *stretched = None;
        }
    }

    /// Background pixels for `source`. `model_blur` is the worker's blurred
    /// copy when one came back with the mask.
    ///
    /// Cached and already-sized images are borrowed, not copied.
    pub fn render<'a>(
        &'a self,
        source: &'a RgbaImage,
        model_blur: Option<&'a RgbaImage>,
    ) -> Cow<'a, RgbaImage> {
        let (width, height) = source.dimensions();
        match self {
            Background::FilterBlur { pixels, .. } => blur(source, *pixels),
            Background::ModelBlur { strength } => match model_blur {
                Some(blurred) if blurred.dimensions() == (width, height) => Cow::Borrowed(blurred),
                Some(blurred) => Cow::Owned(imageops::resize(
                    blurred,
                    width,
                    height,
                    imageops::FilterType::Triangle,
                )),
                None => blur(source, strength.blur_pixels(height)),
            },
            Background::Replacement { source: replacement, stretched } => match stretched {
                Some(image) if image.dimensions() == (width, height) => Cow::Borrowed(image),
                _ => Cow::Owned(replacement.stretch(width, height)),
            },
        }
    }

    pub fn is_model_blur(&self) -> bool {
        matches!(self, Background::ModelBlur { .. })
    }
}

fn blur(source: &RgbaImage, pixels: u32) -> Cow<'_, RgbaImage> {
    if pixels == 0 {
        return Cow::Borrowed(source);
    }
    Cow::Owned(imageops::fast_blur(source, pixels as f32))
}
