use anyhow::Result;
use image::{GrayImage, ImageBuffer, Luma, Rgba, RgbaImage};
use std::ops::Deref;

/// Per-pixel foreground likelihood at model output resolution.
///
/// 0 = background, 255 = foreground.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMask {
    alpha: GrayImage,
}

impl SegmentationMask {
    pub fn from_alpha(alpha: GrayImage) -> Self {
        Self { alpha }
    }

    /// A mask that marks every pixel as background. Compositing with it
    /// yields the fully blurred or fully replaced frame.
    pub fn background(width: u32, height: u32) -> Self {
        Self {
            alpha: GrayImage::new(width, height),
        }
    }

    /// Read the alpha channel of an RGBA buffer, owned or borrowed.
    pub fn from_rgba_alpha<C>(rgba: &ImageBuffer<Rgba<u8>, C>) -> Self
    where
        C: Deref<Target = [u8]>,
    {
        let (width, height) = rgba.dimensions();
        let alpha = GrayImage::from_fn(width, height, |x, y| Luma([rgba.get_pixel(x, y)[3]]));
        Self { alpha }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.alpha.dimensions()
    }

    pub fn alpha(&self) -> &GrayImage {
        &self.alpha
    }
}

/// A person-segmentation network behind a uniform interface.
pub trait SegmentationModel: Send {
    /// Segment a frame already sized to [`input_size`](Self::input_size).
    /// The mask comes back at [`output_size`](Self::output_size).
    fn segment(&mut self, frame: &RgbaImage) -> Result<SegmentationMask>;

    /// Forget anything carried between frames. Called when the worker's
    /// assets are destroyed.
    fn reset_state(&mut self) {}

    /// `(width, height)` the network consumes.
    fn input_size(&self) -> (u32, u32);

    fn output_size(&self) -> (u32, u32) {
        self.input_size()
    }

    fn name(&self) -> &'static str;
}
