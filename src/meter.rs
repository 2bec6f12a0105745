//! Perceptual loudness per chunk plus the bounded rolling history that
//! drives the amplitude visualization.

use std::collections::VecDeque;

/// Default gain inside the log compression, before microphone sensitivity.
const COMPRESSION_GAIN: f32 = 10.0;

/// RMS of a 16-bit chunk mapped through `1 + 0.2 * ln(1 + gain * rms)`.
/// Silence lands exactly at 1.0 and loudness grows sub-linearly, which keeps
/// the visualization readable. `sensitivity` scales the gain term.
pub fn rms_amplitude(chunk: &[i16], sensitivity: f32) -> f32 {
    if chunk.is_empty() {
        return 1.0;
    }
    let sum_squared: f64 = chunk
        .iter()
        .map(|&s| {
            let normalized = f64::from(s) / 32_768.0;
            normalized * normalized
        })
        .sum();
    let rms = (sum_squared / chunk.len() as f64).sqrt() as f32;
    1.0 + 0.2 * (1.0 + COMPRESSION_GAIN * sensitivity * rms).ln()
}

/// Bounded FIFO of amplitude values, oldest first. Push past capacity evicts
/// the oldest entry in O(1).
#[derive(Debug, Clone)]
pub struct AmplitudeHistory {
    values: VecDeque<f32>,
    capacity: usize,
}

impl AmplitudeHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, value: f32) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Chronological copy for the per-chunk emission.
    pub fn snapshot(&self) -> Vec<f32> {
        self.values.iter().copied().collect()
    }
}

/// Owns the history and the sensitivity knob; one instance per capture
/// session, mutated only by the capture loop thread.
#[derive(Debug)]
pub struct AmplitudeTracker {
    history: AmplitudeHistory,
    sensitivity: f32,
}

impl AmplitudeTracker {
    pub fn new(capacity: usize, sensitivity: f32) -> Self {
        Self {
            history: AmplitudeHistory::new(capacity),
            sensitivity,
        }
    }

    /// Compute the chunk's loudness, record it, and return the updated
    /// chronological snapshot.
    pub fn observe(&mut self, chunk: &[i16]) -> Vec<f32> {
        let amplitude = rms_amplitude(chunk, self.sensitivity);
        self.history.push(amplitude);
        self.history.snapshot()
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}
