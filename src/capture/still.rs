use super::FrameSource;
use crate::frame::{StreamParameters, VideoFrame, DEFAULT_CHANNELS};
use anyhow::{Context, Result};
use image::{imageops, RgbaImage};
use std::path::Path;

/// Replays one still image as a video source. Useful without a camera.
pub struct StillImageCapture {
    frame: RgbaImage,
    framerate: u32,
}

impl StillImageCapture {
    /// Load `path` and scale it to `width`x`height`
    pub fn open<P: AsRef<Path>>(path: P, width: u32, height: u32, framerate: u32) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Using still image {} as input", path.display());

        let image = image::open(path)
            .with_context(|| format!("Failed to open still image {}", path.display()))?
            .to_rgba8();

        Ok(Self::from_image(image, width, height, framerate))
    }

    pub fn from_image(image: RgbaImage, width: u32, height: u32, framerate: u32) -> Self {
        let frame = if image.dimensions() == (width, height) {
            image
        } else {
            imageops::resize(&image, width, height, imageops::FilterType::Triangle)
        };
        Self { frame, framerate }
    }
}

impl FrameSource for StillImageCapture {
    fn next_frame(&mut self) -> Result<VideoFrame> {
        Ok(VideoFrame::new(self.frame.clone(), self.framerate))
    }

    fn stream_parameters(&self) -> StreamParameters {
        let (width, height) = self.frame.dimensions();
        StreamParameters {
            width,
            height,
            framerate: self.framerate,
            channels: DEFAULT_CHANNELS,
        }
    }
}
