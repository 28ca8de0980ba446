use image::RgbaImage;

pub const DEFAULT_STREAM_WIDTH: u32 = 1280;
pub const DEFAULT_STREAM_HEIGHT: u32 = 720;
pub const DEFAULT_FRAMERATE: u32 = 15;
pub const DEFAULT_CHANNELS: u32 = 4;

/// Dimensions of the stream currently flowing through the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParameters {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub channels: u32,
}

impl StreamParameters {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// A drawable frame exchanged with the surrounding frame pipeline.
///
/// The surface is `None` once the frame has been disposed.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    surface: Option<RgbaImage>,
    framerate: u32,
}

impl VideoFrame {
    pub fn new(surface: RgbaImage, framerate: u32) -> Self {
        Self {
            surface: Some(surface),
            framerate,
        }
    }

    pub fn blank(width: u32, height: u32, framerate: u32) -> Self {
        Self::new(RgbaImage::new(width, height), framerate)
    }

    pub fn width(&self) -> u32 {
        self.surface.as_ref().map_or(0, |s| s.width())
    }

    pub fn height(&self) -> u32 {
        self.surface.as_ref().map_or(0, |s| s.height())
    }

    pub fn framerate(&self) -> u32 {
        self.framerate
    }

    pub fn set_framerate(&mut self, framerate: u32) {
        self.framerate = framerate;
    }

    pub fn surface(&self) -> Option<&RgbaImage> {
        self.surface.as_ref()
    }

    pub fn surface_mut(&mut self) -> Option<&mut RgbaImage> {
        self.surface.as_mut()
    }

    /// Replace the backing surface with a blank one of the given size.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.surface = Some(RgbaImage::new(width, height));
    }

    /// Release the surface. Later accessors see an empty frame.
    pub fn dispose(&mut self) {
        self.surface = None;
    }

    pub fn is_disposed(&self) -> bool {
        self.surface.is_none()
    }
}
