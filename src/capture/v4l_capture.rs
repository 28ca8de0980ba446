use super::FrameSource;
use crate::frame::{StreamParameters, VideoFrame, DEFAULT_CHANNELS};
use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use nokhwa::pixel_format::RgbAFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;

/// A V4L2 camera delivering frames at the requested stream size.
///
/// The driver picks the closest mode it has. Frames from a mode of another
/// size are scaled before they leave the source.
pub struct WebcamCapture {
    camera: Camera,
    params: StreamParameters,
    native: (u32, u32),
}

impl WebcamCapture {
    pub fn open(device_index: u32, width: u32, height: u32, framerate: u32) -> Result<Self> {
        tracing::info!(
            "Opening camera {} for {}x{} at {} fps",
            device_index,
            width,
            height,
            framerate
        );

        let wanted = CameraFormat::new(Resolution::new(width, height), FrameFormat::MJPEG, framerate);
        let requested = RequestedFormat::new::<RgbAFormat>(RequestedFormatType::Closest(wanted));
        let mut camera = Camera::new(CameraIndex::Index(device_index), requested)
            .with_context(|| format!("Failed to open camera {}", device_index))?;
        camera
            .open_stream()
            .context("Failed to start camera stream")?;

        let resolution = camera.resolution();
        let native = (resolution.width(), resolution.height());
        let delivered_fps = camera.frame_rate();
        if native != (width, height) {
            tracing::warn!(
                "Camera runs at {}x{}, frames will be scaled to {}x{}",
                native.0,
                native.1,
                width,
                height
            );
        }
        tracing::info!("Camera mode {}x{} @ {} fps", native.0, native.1, delivered_fps);

        Ok(Self {
            camera,
            params: StreamParameters {
                width,
                height,
                framerate: if delivered_fps > 0 { delivered_fps } else { framerate },
                channels: DEFAULT_CHANNELS,
            },
            native,
        })
    }
}

impl FrameSource for WebcamCapture {
    fn next_frame(&mut self) -> Result<VideoFrame> {
        let buffer = self.camera.frame().context("Camera returned no frame")?;
        let mut image = buffer
            .decode_image::<RgbAFormat>()
            .context("Failed to decode camera frame")?;

        let (width, height) = self.params.dimensions();
        if image.dimensions() != (width, height) {
            if image.dimensions() != self.native {
                tracing::debug!("Camera frame size changed to {:?}", image.dimensions());
                self.native = image.dimensions();
            }
            image = imageops::resize(&image, width, height, FilterType::Triangle);
        }
        Ok(VideoFrame::new(image, self.params.framerate))
    }

    fn stream_parameters(&self) -> StreamParameters {
        self.params
    }
}
