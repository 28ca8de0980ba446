mod loopback;

pub use loopback::{pack_yuyv, LoopbackOutput};

use crate::frame::VideoFrame;
use anyhow::Result;

/// Where processed frames go.
pub trait FrameSink {
    /// Emit `frame`. Returns `false` when the frame had no surface to emit.
    fn present(&mut self, frame: &VideoFrame) -> Result<bool>;

    fn dimensions(&self) -> (u32, u32);
}
