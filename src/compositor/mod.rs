//! Downsampling for the model and mask compositing onto the output.

mod background;

pub use background::{load_image, parse_color, Background, ReplacementSource};

use image::{imageops, GrayImage, RgbaImage};

use crate::error::ProcessError;
use crate::segmentation::SegmentationMask;

/// Owns the model-sized downsample surface and the current background.
#[derive(Debug)]
pub struct FrameCompositor {
    model_size: (u32, u32),
    stream_size: (u32, u32),
    scale: (f32, f32),
    surface: RgbaImage,
    background: Option<Background>,
}

impl FrameCompositor {
    pub fn new(model_width: u32, model_height: u32) -> Self {
        Self {
            model_size: (model_width, model_height),
            stream_size: (0, 0),
            scale: (1.0, 1.0),
            surface: RgbaImage::new(model_width, model_height),
            background: None,
        }
    }

    pub fn stream_size(&self) -> (u32, u32) {
        self.stream_size
    }

    /// Horizontal and vertical factors of the last downsample.
    pub fn scale_factors(&self) -> (f32, f32) {
        self.scale
    }

    /// Scale `source` onto the model-sized surface and return it.
    pub fn downsample(&mut self, source: &RgbaImage) -> &RgbaImage {
        let _span = tracing::debug_span!("downsample").entered();
        let (width, height) = source.dimensions();
        let (model_width, model_height) = self.model_size;
        self.scale = (
            model_width as f32 / width.max(1) as f32,
            model_height as f32 / height.max(1) as f32,
        );
        self.surface = imageops::resize(
            source,
            model_width,
            model_height,
            imageops::FilterType::Triangle,
        );
        &self.surface
    }

    /// Move the downsampled pixels out. The surface is rebuilt on the next
    /// [`downsample`](Self::downsample).
    pub fn take_downsampled(&mut self) -> RgbaImage {
        std::mem::take(&mut self.surface)
    }

    /// Rebuild per-stream state after the input dimensions changed.
    pub fn configure_for_stream(&mut self, width: u32, height: u32) {
        tracing::info!("compositor reconfigured for {}x{}", width, height);
        self.stream_size = (width, height);
        let (model_width, model_height) = self.model_size;
        self.surface = RgbaImage::new(model_width, model_height);
        self.scale = (
            model_width as f32 / width.max(1) as f32,
            model_height as f32 / height.max(1) as f32,
        );
        if let Some(background) = self.background.as_mut() {
            background.resize(width, height);
        }
    }

    pub fn set_background(&mut self, mut background: Option<Background>) {
        let (width, height) = self.stream_size;
        if let Some(background) = background.as_mut() {
            if width > 0 && height > 0 {
                background.resize(width, height);
            }
        }
        self.background = background;
    }

    pub fn background(&self) -> Option<&Background> {
        self.background.as_ref()
    }

    /// Drop surfaces. The compositor can be reconfigured afterwards.
    pub fn release(&mut self) {
        self.surface = RgbaImage::new(0, 0);
        self.stream_size = (0, 0);
        if let Some(background) = self.background.as_mut() {
            background.release();
        }
    }

    /// Foreground where the mask is set, background everywhere else.
    ///
    /// A missing mask counts as all background.
    pub fn composite(
        &self,
        output: &mut RgbaImage,
        source: &RgbaImage,
        mask: Option<&SegmentationMask>,
        model_blur: Option<&RgbaImage>,
    ) -> Result<(), ProcessError> {
        let _span = tracing::debug_span!("composite").entered();
        let (width, height) = source.dimensions();
        if output.dimensions() != (width, height) {
            return Err(ProcessError::DimensionMismatch {
                output: output.dimensions(),
                frame: (width, height),
            });
        }

        let Some(background) = self.background.as_ref() else {
            output.copy_from_slice(source);
            return Ok(());
        };

        let fallback;
        let resized: GrayImage;
        let alpha = match mask {
            Some(mask) if mask.dimensions() == (width, height) => mask.alpha(),
            Some(mask) => {
                resized = imageops::resize(mask.alpha(), width, height, imageops::FilterType::Triangle);
                &resized
            }
            None => {
                fallback = SegmentationMask::background(width, height);
                fallback.alpha()
            }
        };
        let fill = background.render(source, model_blur);

        for (((out, src), bg), a) in output
            .pixels_mut()
            .zip(source.pixels())
            .zip(fill.pixels())
            .zip(alpha.pixels())
        {
            let a = a[0] as u32;
            for c in 0..3 {
                out[c] = ((src[c] as u32 * a + bg[c] as u32 * (255 - a) + 127) / 255) as u8;
            }
            out[3] = u8::MAX;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlurMethod, EffectConfiguration};
    use image::{Luma, Rgba};

    fn replacing(color: &str, width: u32, height: u32) -> FrameCompositor {
        let mut compositor = FrameCompositor::new(256, 144);
        compositor.configure_for_stream(width, height);
        let background =
            Background::for_config(&EffectConfiguration::replace_with_color(color), BlurMethod::Filter)
                .unwrap();
        compositor.set_background(background);
        compositor
    }

    #[test]
    fn downsample_uses_independent_scale_factors() {
        let mut compositor = FrameCompositor::new(256, 144);
        let source = RgbaImage::new(1280, 720);
        let buffer = compositor.downsample(&source);
        assert_eq!(buffer.dimensions(), (256, 144));
        assert_eq!(compositor.scale_factors(), (0.2, 0.2));

        let source = RgbaImage::new(640, 480);
        assert_eq!(compositor.downsample(&source).dimensions(), (256, 144));
        assert_eq!(compositor.scale_factors(), (0.4, 0.3));
    }

    #[test]
    fn missing_mask_fills_with_background() {
        let compositor = replacing("#0000ff", 8, 4);
        let source = RgbaImage::from_pixel(8, 4, Rgba([200, 100, 50, 255]));
        let mut output = RgbaImage::new(8, 4);
        compositor.composite(&mut output, &source, None, None).unwrap();
        assert!(output.pixels().all(|p| p.0 == [0, 0, 255, 255]));
    }

    #[test]
    fn mask_selects_source_pixels() {
        let compositor = replacing("black", 4, 2);
        let source = RgbaImage::from_pixel(4, 2, Rgba([90, 90, 90, 255]));
        let alpha = GrayImage::from_fn(4, 2, |x, _| Luma([if x < 2 { 255 } else { 0 }]));
        let mask = SegmentationMask::from_alpha(alpha);
        let mut output = RgbaImage::new(4, 2);
        compositor
            .composite(&mut output, &source, Some(&mask), None)
            .unwrap();
        assert_eq!(output.get_pixel(0, 1).0, [90, 90, 90, 255]);
        assert_eq!(output.get_pixel(3, 0).0, [0, 0, 0, 255]);
    }

    #[test]
    fn output_size_must_match_source() {
        let compositor = replacing("black", 4, 2);
        let mut output = RgbaImage::new(2, 2);
        let result = compositor.composite(&mut output, &RgbaImage::new(4, 2), None, None);
        assert!(matches!(result, Err(ProcessError::DimensionMismatch { .. })));
    }

    #[test]
    fn reconfigure_restretches_replacement() {
        let mut compositor = replacing("red", 4, 2);
        compositor.configure_for_stream(6, 3);
        let mut output = RgbaImage::new(6, 3);
        compositor
            .composite(&mut output, &RgbaImage::new(6, 3), None, None)
            .unwrap();
        assert_eq!(output.get_pixel(5, 2).0, [255, 0, 0, 255]);
        assert_eq!(compositor.stream_size(), (6, 3));
    }
}
