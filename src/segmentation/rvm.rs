use super::preprocess::{Preprocessor, TensorLayout};
use super::types::{SegmentationMask, SegmentationModel};
use anyhow::{ensure, Context, Result};
use image::RgbaImage;
use ort::session::Session;
use ort::value::Tensor;

/// Hidden state channel counts for r1..r4
const STATE_CHANNELS: [usize; 4] = [16, 20, 24, 28];

/// One recurrent state tensor, kept flat between frames
struct HiddenState {
    shape: [usize; 4],
    data: Vec<f32>,
}

impl HiddenState {
    fn zeros(shape: [usize; 4]) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.iter().product()],
        }
    }
}

/// Recurrent matting network (RVM export with `src, r1i..r4i` inputs).
///
/// The four recurrent tensors returned with each matte are fed into the next
/// call. `reset_state` drops them, e.g. when the stream size changes.
pub struct RobustVideoMatting {
    session: Session,
    preprocessor: Preprocessor,
    width: u32,
    height: u32,
    output_size: (u32, u32),

    /// `None` until the first frame, and after a reset.
    states: Option<[HiddenState; 4]>,
    downsample_ratio: f32,
}

impl RobustVideoMatting {
    /// Wrap a loaded session. States start at a quarter of the input size.
    pub fn new(
        session: Session,
        input_size: (u32, u32),
        output_size: (u32, u32),
        range: (f32, f32),
    ) -> Self {
        let (width, height) = input_size;
        Self {
            session,
            preprocessor: Preprocessor::new(width, height, range, TensorLayout::Nchw),
            width,
            height,
            output_size,
            states: None,
            downsample_ratio: 0.25,
        }
    }

    fn zeroed_states(&self) -> [HiddenState; 4] {
        let h = ((self.height as f32 * self.downsample_ratio) as usize).max(8);
        let w = ((self.width as f32 * self.downsample_ratio) as usize).max(8);

        tracing::debug!("Fresh recurrent state at {}x{}", w, h);

        [
            HiddenState::zeros([1, STATE_CHANNELS[0], h, w]),
            HiddenState::zeros([1, STATE_CHANNELS[1], h / 2, w / 2]),
            HiddenState::zeros([1, STATE_CHANNELS[2], h / 4, w / 4]),
            HiddenState::zeros([1, STATE_CHANNELS[3], h / 8, w / 8]),
        ]
    }
}

fn state_tensor(state: &HiddenState) -> Result<Tensor<f32>> {
    Ok(Tensor::from_array((state.shape, state.data.clone()))?)
}

impl SegmentationModel for RobustVideoMatting {
    fn segment(&mut self, frame: &RgbaImage) -> Result<SegmentationMask> {
        let _span = tracing::debug_span!("rvm_segment").entered();
        let states = match self.states.take() {
            Some(states) => states,
            None => self.zeroed_states(),
        };

        let input = self.preprocessor.preprocess(frame)?;
        let (n, c, h, w) = input.dim();
        let (data, _) = input.into_raw_vec_and_offset();
        let src = Tensor::from_array(([n, c, h, w], data))?;

        // Newer exports take the downsample ratio as a sixth input
        let [r1, r2, r3, r4] = &states;
        let r1 = state_tensor(r1)?;
        let r2 = state_tensor(r2)?;
        let r3 = state_tensor(r3)?;
        let r4 = state_tensor(r4)?;

        let _infer_span = tracing::debug_span!("inference").entered();
        let outputs = if self.session.inputs.len() > 5 {
            let ratio = Tensor::from_array(([1usize], vec![self.downsample_ratio]))?;
            self.session
                .run(ort::inputs![src, r1, r2, r3, r4, ratio])
                .context("Failed to run inference")?
        } else {
            self.session
                .run(ort::inputs![src, r1, r2, r3, r4])
                .context("Failed to run inference")?
        };
        drop(_infer_span);

        ensure!(outputs.len() >= 6, "RVM returned {} outputs, expected 6", outputs.len());

        // Outputs are fgr, pha, r1o..r4o. fgr is unused.
        let mut next = Vec::with_capacity(4);
        for index in 2..6 {
            let (shape, values) = outputs[index].try_extract_tensor::<f32>()?;
            ensure!(shape.len() == 4, "hidden state {} has rank {}", index - 1, shape.len());
            let dims = [
                shape[0] as usize,
                shape[1] as usize,
                shape[2] as usize,
                shape[3] as usize,
            ];
            next.push(HiddenState {
                shape: dims,
                data: values.to_vec(),
            });
        }
        if let Ok(updated) = <[HiddenState; 4]>::try_from(next) {
            self.states = Some(updated);
        }

        // Alpha matte is the second output, shape [1, 1, H, W]
        let (shape, pha) = outputs[1].try_extract_tensor::<f32>()?;
        ensure!(shape.len() == 4, "alpha matte has rank {}", shape.len());
        let matte_height = shape[2] as u32;
        let matte_width = shape[3] as u32;

        let (out_w, out_h) = self.output_size;
        Preprocessor::matte_to_mask(pha, matte_width, matte_height, 1, (0.0, 1.0), out_w, out_h)
    }

    fn reset_state(&mut self) {
        tracing::debug!("Dropping recurrent state");
        self.states = None;
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn output_size(&self) -> (u32, u32) {
        self.output_size
    }

    fn name(&self) -> &'static str {
        "robust-video-matting"
    }
}
