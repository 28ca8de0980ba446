//! Real-time background blur and replacement for live video.
//!
//! Frames flow through a [`VideoFrameProcessor`]. The effects processor
//! downsamples each frame, asks an inference worker thread for a person
//! mask (as often as the throttle allows) and composites the frame over a
//! blurred or replaced background.

pub mod capture;
pub mod clock;
pub mod compositor;
pub mod config;
pub mod deferred;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod output;
pub mod pipeline;
pub mod processor;
pub mod segmentation;
pub mod throttle;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BlurMethod, BlurStrength, Capabilities, EffectConfiguration, ProcessorOptions,
    ThrottleStrategy, TransferMode,
};
pub use error::{ConfigError, ProcessError, ProcessorError, WorkerError};
pub use frame::VideoFrame;
pub use metrics::{CpuUtilizationHighEvent, FilterDurationHighEvent, FilterObserver};
pub use processor::{EffectsProcessor, NoOpProcessor, ProcessorState, ShutdownHandle, VideoFrameProcessor};
