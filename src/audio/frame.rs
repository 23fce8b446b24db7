//! Fixed-size audio frames
//!
//! The device callback delivers buffers of whatever size the backend picks.
//! [`FrameAssembler`] re-cuts that stream into frames of exactly
//! `frame_size` samples so every frame sent downstream has the same length.

use std::time::Instant;

/// A fixed-length batch of normalized samples from the capture device.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sequence: u64,
    sample_rate: u32,
    captured_at: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sequence: u64, sample_rate: u32) -> Self {
        Self {
            samples,
            sequence,
            sample_rate,
            captured_at: Instant::now(),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Position of this frame within its capture session, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Duration of this frame in milliseconds
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }
}

/// PCM16 samples derived one-to-one from an [`AudioFrame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame {
    samples: Vec<i16>,
    sequence: u64,
}

impl PcmFrame {
    pub fn new(samples: Vec<i16>, sequence: u64) -> Self {
        Self { samples, sequence }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Wire payload: little-endian samples, no header.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }

    /// Consume the frame into its wire payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.to_le_bytes()
    }
}

/// Accumulates callback buffers and emits frames of a constant size.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    next_sequence: u64,
}

impl FrameAssembler {
    /// A zero `frame_size` is bumped to 1 so that every frame is non-empty.
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            sample_rate,
            pending: Vec::with_capacity(frame_size * 2),
            next_sequence: 0,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Number of samples waiting for the next frame to fill up
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Push mono samples, calling `emit` once per completed frame, in order.
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(AudioFrame)) {
        self.pending.extend_from_slice(samples);

        while self.pending.len() >= self.frame_size {
            let frame: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            emit(AudioFrame::new(frame, sequence, self.sample_rate));
        }
    }

    /// Drop any partial frame. The sequence counter keeps running.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
