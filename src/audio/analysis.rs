//! Analysis tap: the live time-domain window read by the waveform renderer
//!
//! The capture callback writes into the window, the renderer copies it out.
//! Reading never consumes samples, so the frame path is unaffected by how
//! often (or whether) the renderer looks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Samples kept in the window (matches a 2048-point analyser's time-domain view)
pub const DEFAULT_WINDOW: usize = 1024;

/// Shared handle to the most recent `capacity` samples.
#[derive(Debug, Clone)]
pub struct AnalysisTap {
    window: Arc<Mutex<VecDeque<f32>>>,
    capacity: usize,
}

impl AnalysisTap {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add samples, evicting the oldest once the window is full.
    pub fn push_samples(&self, samples: &[f32]) {
        let Ok(mut window) = self.window.lock() else {
            return;
        };
        let len = samples.len();

        // Incoming block alone fills the window: keep its tail
        if len >= self.capacity {
            window.clear();
            window.extend(&samples[len - self.capacity..]);
            return;
        }

        let to_remove = (window.len() + len).saturating_sub(self.capacity);
        if to_remove > 0 {
            window.drain(0..to_remove);
        }
        window.extend(samples);
    }

    /// Copy the current window into `out` (oldest first), replacing its contents.
    pub fn snapshot_into(&self, out: &mut Vec<f32>) {
        out.clear();
        if let Ok(window) = self.window.lock() {
            out.extend(window.iter().copied());
        }
    }

    pub fn snapshot(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.capacity);
        self.snapshot_into(&mut out);
        out
    }

    pub fn len(&self) -> usize {
        self.window.lock().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut window) = self.window.lock() {
            window.clear();
        }
    }
}

impl Default for AnalysisTap {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
