//! Frame region shared between the processor and the inference worker.
//!
//! One cycle runs writer → signal → reader:
//!
//! 1. the processor writes the downsampled frame and calls [`submit`]
//!    (`Writable` → `Submitted`),
//! 2. the worker reads the input, writes the mask and calls [`complete`]
//!    (`Submitted` → `Completed`), then posts `predictSharedMemory`,
//! 3. after that message arrives the processor takes a [`ArenaView`].
//!
//! Every access checks the phase first, so neither side can touch a region
//! the other one currently owns.
//!
//! [`submit`]: SharedFrameArena::submit
//! [`complete`]: SharedFrameArena::complete

use std::sync::atomic::{AtomicU8, Ordering};

use image::{ImageBuffer, Rgba};
use parking_lot::{Mutex, MutexGuard};

use crate::error::WorkerError;

const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// The processor may write the input.
    Writable = 0,
    /// The worker owns both regions.
    Submitted = 1,
    /// The output holds a finished result for the processor to read.
    Completed = 2,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Phase::Submitted,
            2 => Phase::Completed,
            _ => Phase::Writable,
        }
    }
}

/// Paired input/output regions at fixed model resolution.
///
/// The output region is RGBA: alpha carries the mask, RGB carries the
/// model-blurred background when one was requested.
#[derive(Debug)]
pub struct SharedFrameArena {
    phase: AtomicU8,
    input_size: (u32, u32),
    output_size: (u32, u32),
    input: Mutex<Box<[u8]>>,
    output: Mutex<Box<[u8]>>,
}

impl SharedFrameArena {
    pub fn new(input_size: (u32, u32), output_size: (u32, u32)) -> Self {
        let input_len = input_size.0 as usize * input_size.1 as usize * BYTES_PER_PIXEL;
        let output_len = output_size.0 as usize * output_size.1 as usize * BYTES_PER_PIXEL;
        Self {
            phase: AtomicU8::new(Phase::Writable as u8),
            input_size,
            output_size,
            input: Mutex::new(vec![0; input_len].into_boxed_slice()),
            output: Mutex::new(vec![0; output_len].into_boxed_slice()),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    pub fn output_size(&self) -> (u32, u32) {
        self.output_size
    }

    fn transition(&self, from: Phase, to: Phase) -> Result<(), WorkerError> {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| WorkerError::SharedRegion {
                expected: from,
                actual: Phase::from_u8(actual),
            })
    }

    /// Copy the next input frame in. Starts a new cycle when the previous
    /// result has been read.
    pub fn write_input(&self, pixels: &[u8]) -> Result<(), WorkerError> {
        if self.phase() == Phase::Completed {
            self.transition(Phase::Completed, Phase::Writable)?;
        }
        let actual = self.phase();
        if actual != Phase::Writable {
            return Err(WorkerError::SharedRegion {
                expected: Phase::Writable,
                actual,
            });
        }

        let mut input = self.input.lock();
        if input.len() != pixels.len() {
            return Err(WorkerError::SharedRegionSize {
                expected: pixels.len(),
                actual: input.len(),
            });
        }
        input.copy_from_slice(pixels);
        Ok(())
    }

    /// Hand both regions to the worker.
    pub fn submit(&self) -> Result<(), WorkerError> {
        self.transition(Phase::Writable, Phase::Submitted)
    }

    /// Worker side: run `f` over the input and output regions.
    pub fn with_worker_access<R>(
        &self,
        f: impl FnOnce(&[u8], &mut [u8]) -> R,
    ) -> Result<R, WorkerError> {
        let actual = self.phase();
        if actual != Phase::Submitted {
            return Err(WorkerError::SharedRegion {
                expected: Phase::Submitted,
                actual,
            });
        }
        let input = self.input.lock();
        let mut output = self.output.lock();
        Ok(f(&input, &mut output))
    }

    /// Worker side: publish the output.
    pub fn complete(&self) -> Result<(), WorkerError> {
        self.transition(Phase::Submitted, Phase::Completed)
    }

    /// Worker side: give the regions back without a result.
    pub fn abandon(&self) -> Result<(), WorkerError> {
        self.transition(Phase::Submitted, Phase::Writable)
    }

    /// Read-only view over the finished output.
    pub fn read_view(&self) -> Result<ArenaView<'_>, WorkerError> {
        let actual = self.phase();
        if actual != Phase::Completed {
            return Err(WorkerError::SharedRegion {
                expected: Phase::Completed,
                actual,
            });
        }
        Ok(ArenaView {
            size: self.output_size,
            output: self.output.lock(),
        })
    }
}

pub struct ArenaView<'a> {
    size: (u32, u32),
    output: MutexGuard<'a, Box<[u8]>>,
}

impl ArenaView<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        &self.output
    }

    pub fn as_image(&self) -> Option<ImageBuffer<Rgba<u8>, &[u8]>> {
        ImageBuffer::from_raw(self.size.0, self.size.1, &self.output[..])
    }
}
