use super::FrameSink;
use crate::frame::VideoFrame;
use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use v4l::video::Output;
use v4l::{Device, Format, FourCC};

/// A v4l2loopback device fed with packed YUYV frames.
pub struct LoopbackOutput<W: Write = File> {
    writer: W,
    width: u32,
    height: u32,
    packed: Vec<u8>,
    frames_written: u64,
}

impl LoopbackOutput<File> {
    pub fn open<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!(
            "Opening loopback device {} for {}x{} YUYV",
            path.display(),
            width,
            height
        );

        if let Err(e) = negotiate_format(path, width, height) {
            tracing::warn!("Could not set YUYV format on {}: {:#}", path.display(), e);
        }

        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open loopback device {}", path.display()))?;
        Ok(Self::with_writer(file, width, height))
    }
}

impl<W: Write> LoopbackOutput<W> {
    pub fn with_writer(writer: W, width: u32, height: u32) -> Self {
        Self {
            writer,
            width,
            height,
            packed: Vec::with_capacity(yuyv_len(width, height)),
            frames_written: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

fn negotiate_format(path: &Path, width: u32, height: u32) -> Result<()> {
    let device = Device::with_path(path)
        .with_context(|| format!("Failed to open {} for format negotiation", path.display()))?;
    let requested = Format::new(width, height, FourCC::new(b"YUYV"));
    let actual = Output::set_format(&device, &requested).context("VIDIOC_S_FMT failed")?;
    if (actual.width, actual.height) != (width, height) {
        tracing::warn!(
            "Loopback accepted {}x{} instead of {}x{}",
            actual.width,
            actual.height,
            width,
            height
        );
    }
    Ok(())
}

fn yuyv_len(width: u32, height: u32) -> usize {
    (width.div_ceil(2) * 4 * height) as usize
}

/// Pack an RGBA image as YUYV 4:2:2 into `out`, replacing its contents.
///
/// Uses BT.601 studio-range coefficients. Alpha is dropped. An odd last
/// column is paired with itself.
pub fn pack_yuyv(image: &RgbaImage, out: &mut Vec<u8>) {
    let (width, height) = image.dimensions();
    out.clear();
    out.reserve(yuyv_len(width, height));

    for row in image.rows() {
        let pixels: Vec<_> = row.collect();
        for pair in pixels.chunks(2) {
            let left = pair[0];
            let right = pair.get(1).copied().unwrap_or(left);
            let y0 = luma(left.0);
            let y1 = luma(right.0);
            let (u0, v0) = chroma(left.0);
            let (u1, v1) = chroma(right.0);
            out.extend_from_slice(&[
                y0,
                ((u0 + u1 + 1) / 2) as u8,
                y1,
                ((v0 + v1 + 1) / 2) as u8,
            ]);
        }
    }
}

fn luma([r, g, b, _]: [u8; 4]) -> u8 {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8
}

fn chroma([r, g, b, _]: [u8; 4]) -> (i32, i32) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let u = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128).clamp(0, 255);
    let v = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128).clamp(0, 255);
    (u, v)
}

impl<W: Write> FrameSink for LoopbackOutput<W> {
    fn present(&mut self, frame: &VideoFrame) -> Result<bool> {
        let Some(surface) = frame.surface() else {
            return Ok(false);
        };

        if surface.dimensions() == (self.width, self.height) {
            pack_yuyv(surface, &mut self.packed);
        } else {
            let scaled = imageops::resize(surface, self.width, self.height, FilterType::Triangle);
            pack_yuyv(&scaled, &mut self.packed);
        }

        self.writer
            .write_all(&self.packed)
            .context("Failed to write frame to loopback device")?;
        self.frames_written += 1;
        Ok(true)
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
