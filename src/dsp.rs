//! Pure signal-processing building blocks for the MFCC pipeline.
//!
//! Every function here is stateless and deterministic: it reads only its
//! arguments, performs no I/O, and is safe to call from any thread without
//! synchronization. The chain is pre-emphasis -> framing -> Hamming window
//! -> power spectrum (real FFT) -> mel filterbank -> DCT-II -> whole-vector
//! normalization.

use rustfft::num_complex::Complex;
use rustfft::Fft;
use std::f32::consts::PI;
use std::sync::Arc;

/// Full-scale divisor for 16-bit PCM normalization.
const PCM_SCALE: f32 = 32_768.0;

/// Convert signed 16-bit samples to [-1, 1] floats and apply a first-order
/// pre-emphasis filter `y[i] = x[i] - coeff * x[i-1]`, `y[0] = x[0]`.
///
/// The recurrence runs from the last index down to 1 so each step reads the
/// previous sample before it has been overwritten; a forward in-place pass
/// would feed filtered values back into the filter.
pub fn pre_emphasize(samples: &[i16], coeff: f32) -> Vec<f32> {
    let mut out: Vec<f32> = samples.iter().map(|&s| s as f32 / PCM_SCALE).collect();
    for i in (1..out.len()).rev() {
        out[i] -= coeff * out[i - 1];
    }
    out
}

/// Number of frames produced by [`frame_signal`] for a signal of `len`
/// samples: `ceil(|len - frame_len| / stride) + 1`, except that a signal
/// shorter than one frame yields exactly one zero-padded frame.
pub fn frame_count(len: usize, frame_len: usize, stride: usize) -> usize {
    if len <= frame_len {
        return 1;
    }
    let span = len - frame_len;
    span.div_ceil(stride) + 1
}

/// Split a signal into overlapping frames of `frame_len` samples, advancing
/// by `stride` each time. Tail frames are zero-padded to full length.
pub fn frame_signal(signal: &[f32], frame_len: usize, stride: usize) -> Vec<Vec<f32>> {
    let num_frames = frame_count(signal.len(), frame_len, stride);
    let mut frames = Vec::with_capacity(num_frames);
    for i in 0..num_frames {
        let start = i * stride;
        let end = (start + frame_len).min(signal.len());
        let mut frame = vec![0.0f32; frame_len];
        if start < end {
            frame[..end - start].copy_from_slice(&signal[start..end]);
        }
        frames.push(frame);
    }
    frames
}

/// Precompute a Hamming window of length `n`:
/// `w[i] = 0.54 - 0.46 * cos(2*pi*i / (n-1))`. A length-1 window is the
/// degenerate identity.
pub fn hamming_window(n: usize) -> Vec<f32> {
    if n <= 1 {
        return vec![1.0; n];
    }
    (0..n)
        .map(|i| 0.54 - 0.46 * (2.0 * PI * i as f32 / (n - 1) as f32).cos())
        .collect()
}

/// Taper a frame in place by the precomputed window.
pub fn apply_window(frame: &mut [f32], window: &[f32]) {
    for (sample, w) in frame.iter_mut().zip(window) {
        *sample *= w;
    }
}

/// Forward-transform one windowed frame and return the squared magnitudes of
/// the first `fft_size/2 + 1` bins. The caller supplies a planned FFT whose
/// length matches the frame.
pub fn power_spectrum(frame: &[f32], fft: &Arc<dyn Fft<f32>>) -> Vec<f32> {
    let mut buffer: Vec<Complex<f32>> = frame.iter().map(|&s| Complex::new(s, 0.0)).collect();
    fft.process(&mut buffer);
    buffer[..frame.len() / 2 + 1]
        .iter()
        .map(|c| c.re * c.re + c.im * c.im)
        .collect()
}

/// Perceptual pitch scale conversion.
pub fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

/// Inverse of [`hz_to_mel`].
pub fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

/// Build a bank of `num_filters` triangular filters over the power spectrum
/// of an `fft_size`-point transform. Filter edges are `num_filters + 2`
/// points evenly spaced in mel between `low_hz` and `high_hz`, converted back
/// to Hz and then to FFT bin indices. Each row has `fft_size/2 + 1` weights
/// in [0, 1]; filter `i` rises from bin `i` to bin `i+1` and falls to bin
/// `i+2`.
pub fn mel_filterbank(
    fft_size: usize,
    sample_rate: u32,
    num_filters: usize,
    low_hz: f32,
    high_hz: f32,
) -> Vec<Vec<f32>> {
    let low_mel = hz_to_mel(low_hz);
    let high_mel = hz_to_mel(high_hz);

    // Edge points in mel space, back to Hz, down to integer bin indices.
    let bins: Vec<f32> = (0..num_filters + 2)
        .map(|i| {
            let mel = low_mel + i as f32 * (high_mel - low_mel) / (num_filters + 1) as f32;
            (fft_size as f32 * mel_to_hz(mel) / sample_rate as f32).floor()
        })
        .collect();

    let spectrum_len = fft_size / 2 + 1;
    let mut bank = Vec::with_capacity(num_filters);
    for i in 0..num_filters {
        let mut row = vec![0.0f32; spectrum_len];
        let rise = bins[i + 1] - bins[i];
        let fall = bins[i + 2] - bins[i + 1];
        for (j, weight) in row.iter_mut().enumerate() {
            let j = j as f32;
            if j > bins[i] && j < bins[i + 1] && rise > 0.0 {
                *weight = (j - bins[i]) / rise;
            } else if j >= bins[i + 1] && j < bins[i + 2] && fall > 0.0 {
                *weight = (bins[i + 2] - j) / fall;
            }
        }
        bank.push(row);
    }
    bank
}

/// Weighted sum of power-spectrum bins per filter, followed by natural log.
/// Non-positive sums map to 0 since log is undefined there.
pub fn apply_filterbank(power: &[f32], bank: &[Vec<f32>]) -> Vec<f32> {
    bank.iter()
        .map(|row| {
            let sum: f32 = row.iter().zip(power).map(|(w, p)| w * p).sum();
            if sum > 0.0 {
                sum.ln()
            } else {
                0.0
            }
        })
        .collect()
}

/// DCT-II of one frame of log-mel energies:
/// `mfcc[j] = sum_k mel[k] * cos(pi * j * (k + 0.5) / num_filters)`.
pub fn cepstral_transform(mel_frame: &[f32], num_coeff: usize) -> Vec<f32> {
    let num_filters = mel_frame.len();
    (0..num_coeff)
        .map(|j| {
            mel_frame
                .iter()
                .enumerate()
                .map(|(k, &m)| m * (PI * j as f32 * (k as f32 + 0.5) / num_filters as f32).cos())
                .sum()
        })
        .collect()
}

/// Zero-mean/unit-variance normalization across the whole flat vector.
/// The standard deviation is floored at sqrt(1e-10), so a constant input
/// maps to all zeros instead of dividing by zero.
pub fn normalize(features: &mut [f32]) {
    if features.is_empty() {
        return;
    }
    let count = features.len() as f64;
    let mut sum = 0.0f64;
    let mut sum_squared = 0.0f64;
    for &value in features.iter() {
        sum += f64::from(value);
        sum_squared += f64::from(value) * f64::from(value);
    }
    let mean = sum / count;
    let variance = sum_squared / count - mean * mean;
    let std_dev = variance.max(1e-10).sqrt() as f32;
    let mean = mean as f32;
    for value in features.iter_mut() {
        *value = (*value - mean) / std_dev;
    }
}
