use super::preprocess::{Preprocessor, TensorLayout};
use super::types::{SegmentationMask, SegmentationModel};
use anyhow::{bail, Context, Result};
use image::RgbaImage;
use ort::session::Session;
use ort::value::Tensor;

/// Single-input selfie segmentation model (MediaPipe family)
///
/// Takes one NHWC frame and returns a per-pixel foreground score, either as
/// one channel or as background/foreground pairs.
pub struct SelfieSegmentation {
    session: Session,
    preprocessor: Preprocessor,
    width: u32,
    height: u32,
    output_size: (u32, u32),
}

impl SelfieSegmentation {
    /// Wrap a loaded session
    ///
    /// # Arguments
    /// * `input_size` - (width, height) the model was exported for
    /// * `output_size` - (width, height) of the mask handed back
    /// * `range` - Value range the model expects its input in
    pub fn new(
        session: Session,
        input_size: (u32, u32),
        output_size: (u32, u32),
        range: (f32, f32),
    ) -> Self {
        let (width, height) = input_size;
        Self {
            session,
            preprocessor: Preprocessor::new(width, height, range, TensorLayout::Nhwc),
            width,
            height,
            output_size,
        }
    }
}

impl SegmentationModel for SelfieSegmentation {
    fn segment(&mut self, frame: &RgbaImage) -> Result<SegmentationMask> {
        let _span = tracing::debug_span!("selfie_segment").entered();

        let input = self.preprocessor.preprocess(frame)?;
        let (n, h, w, c) = input.dim();
        let (data, _) = input.into_raw_vec_and_offset();
        let input = Tensor::from_array(([n, h, w, c], data))?;

        let _infer_span = tracing::debug_span!("inference").entered();
        let outputs = self
            .session
            .run(ort::inputs![input])
            .context("Failed to run inference")?;
        drop(_infer_span);

        let (shape, matte) = outputs[0].try_extract_tensor::<f32>()?;
        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();

        // [1, H, W, C] with C the score pairs, or [1, C, H, W] planar
        let (matte_w, matte_h, values, stride) = match dims.as_slice() {
            [_, h, w, c] if (1..=2).contains(c) => (*w, *h, matte, *c),
            [_, c, h, w] if (1..=2).contains(c) => {
                let plane = h * w;
                let start = ((c - 1) * plane).min(matte.len());
                let end = (start + plane).min(matte.len());
                (*w, *h, &matte[start..end], 1)
            }
            [_, h, w] => (*w, *h, matte, 1),
            other => bail!("unexpected selfie segmentation output shape {:?}", other),
        };

        let (out_w, out_h) = self.output_size;
        Preprocessor::matte_to_mask(
            values,
            matte_w as u32,
            matte_h as u32,
            stride,
            (0.0, 1.0),
            out_w,
            out_h,
        )
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn output_size(&self) -> (u32, u32) {
        self.output_size
    }

    fn name(&self) -> &'static str {
        "selfie-segmentation"
    }
}
