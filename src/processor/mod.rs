//! Per-frame entry points handed to the frame pipeline.

mod effects;

pub use effects::EffectsProcessor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::frame::VideoFrame;

/// One frame in, one frame out.
pub trait VideoFrameProcessor: Send {
    /// Returns either `frame` itself or a surface owned by the processor.
    fn process<'a>(&'a mut self, frame: &'a VideoFrame) -> &'a VideoFrame;

    fn destroy(&mut self);
}

/// Hands every frame back untouched. Used when bring-up fails.
#[derive(Debug, Default)]
pub struct NoOpProcessor;

impl VideoFrameProcessor for NoOpProcessor {
    fn process<'a>(&'a mut self, frame: &'a VideoFrame) -> &'a VideoFrame {
        frame
    }

    fn destroy(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Uninitialized,
    /// Waiting for worker initialization and model load.
    Loading,
    Ready,
    Destroyed,
}

/// Marks a processor destroyed from another thread.
///
/// A `process` call blocked on inference sees the flag once the result
/// arrives and returns its input without touching any surface.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    destroyed: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub(crate) fn new(destroyed: Arc<AtomicBool>) -> Self {
        Self { destroyed }
    }

    pub fn shutdown(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}
