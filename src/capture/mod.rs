mod still;
mod v4l_capture;

pub use still::StillImageCapture;
pub use v4l_capture::WebcamCapture;

use crate::frame::{StreamParameters, VideoFrame};
use anyhow::Result;

/// Where the pipeline pulls its frames from.
///
/// Every frame a source hands out already matches `stream_parameters()`.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<VideoFrame>;

    fn stream_parameters(&self) -> StreamParameters;
}
