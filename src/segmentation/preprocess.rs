use anyhow::{ensure, Result};
use image::{imageops, GrayImage, Luma, RgbaImage};
use ndarray::Array4;

/// Memory layout a model expects for its image input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// [1, 3, height, width]
    Nchw,
    /// [1, height, width, 3]
    Nhwc,
}

/// Preprocessor for converting RGBA frames to model input tensors
#[derive(Debug, Clone)]
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
    range: (f32, f32),
    layout: TensorLayout,
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32, range: (f32, f32), layout: TensorLayout) -> Self {
        Self {
            target_width,
            target_height,
            range,
            layout,
        }
    }

    pub fn target_size(&self) -> (u32, u32) {
        (self.target_width, self.target_height)
    }

    /// Preprocess an RGBA image into a normalized tensor
    ///
    /// Steps:
    /// 1. Resize to target dimensions (frames from the compositor already match)
    /// 2. Drop alpha and map each channel from [0, 255] into the model range
    /// 3. Lay out as NCHW or NHWC
    pub fn preprocess(&self, image: &RgbaImage) -> Result<Array4<f32>> {
        let _span = tracing::debug_span!("preprocess").entered();

        let resized;
        let image = if image.dimensions() != (self.target_width, self.target_height) {
            resized = imageops::resize(
                image,
                self.target_width,
                self.target_height,
                imageops::FilterType::Triangle,
            );
            &resized
        } else {
            image
        };

        let (width, height) = (self.target_width as usize, self.target_height as usize);
        let mut tensor = match self.layout {
            TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, height, width)),
            TensorLayout::Nhwc => Array4::<f32>::zeros((1, height, width, 3)),
        };

        let (min, max) = self.range;
        let scale = (max - min) / 255.0;

        for (x, y, pixel) in image.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let value = min + pixel[c] as f32 * scale;
                match self.layout {
                    TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
                    TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
                }
            }
        }

        Ok(tensor)
    }

    /// Turn a model matte into a mask at the requested size
    ///
    /// # Arguments
    /// * `matte` - Row-major matte values, `stride` floats per pixel
    /// * `matte_width` / `matte_height` - Matte resolution
    /// * `stride` - Values per pixel; the last one is the foreground score
    /// * `range` - Value range the model emits
    /// * `target_width` / `target_height` - Mask resolution to produce
    #[allow(clippy::too_many_arguments)]
    pub fn matte_to_mask(
        matte: &[f32],
        matte_width: u32,
        matte_height: u32,
        stride: usize,
        range: (f32, f32),
        target_width: u32,
        target_height: u32,
    ) -> Result<super::SegmentationMask> {
        let _span = tracing::debug_span!("postprocess").entered();

        let pixels = (matte_width * matte_height) as usize;
        ensure!(stride > 0, "matte stride must be positive");
        ensure!(
            matte.len() >= pixels * stride,
            "matte holds {} values, expected {}x{}x{}",
            matte.len(),
            matte_width,
            matte_height,
            stride
        );

        let (min, max) = range;
        let span = if max > min { max - min } else { 1.0 };

        let gray = GrayImage::from_fn(matte_width, matte_height, |x, y| {
            let idx = (y * matte_width + x) as usize * stride + (stride - 1);
            let value = ((matte[idx] - min) / span * 255.0).clamp(0.0, 255.0) as u8;
            Luma([value])
        });

        let gray = if (matte_width, matte_height) != (target_width, target_height) {
            imageops::resize(&gray, target_width, target_height, imageops::FilterType::Triangle)
        } else {
            gray
        };

        Ok(super::SegmentationMask::from_alpha(gray))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn nchw_maps_into_model_range() {
        let pre = Preprocessor::new(2, 1, (-1.0, 1.0), TensorLayout::Nchw);
        let mut image = RgbaImage::new(2, 1);
        image.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        let tensor = pre.preprocess(&image).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 1, 2]);
        assert_eq!(tensor[[0, 0, 0, 0]], 1.0);
        assert_eq!(tensor[[0, 1, 0, 0]], -1.0);
    }

    #[test]
    fn nhwc_resizes_to_target() {
        let pre = Preprocessor::new(4, 2, (0.0, 1.0), TensorLayout::Nhwc);
        let image = RgbaImage::from_pixel(8, 4, Rgba([255, 255, 255, 255]));
        let tensor = pre.preprocess(&image).unwrap();
        assert_eq!(tensor.shape(), &[1, 2, 4, 3]);
        assert!(tensor.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn two_channel_matte_uses_foreground_score() {
        // background/foreground pairs per pixel
        let matte = [0.9, 0.1, 0.0, 1.0];
        let mask = Preprocessor::matte_to_mask(&matte, 2, 1, 2, (0.0, 1.0), 2, 1).unwrap();
        assert_eq!(mask.alpha().get_pixel(0, 0)[0], 25);
        assert_eq!(mask.alpha().get_pixel(1, 0)[0], 255);
    }

    #[test]
    fn short_matte_is_an_error() {
        assert!(Preprocessor::matte_to_mask(&[0.5], 2, 2, 1, (0.0, 1.0), 2, 2).is_err());
    }
}
