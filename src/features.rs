//! Runs the full MFCC chain on one audio chunk and owns the precomputed
//! pieces: the planned FFT, the Hamming window, and the lazily built mel
//! filterbank (configuration-only, cached for the extractor's lifetime).

use crate::config::FeatureConfig;
use crate::dsp;
use crate::log_debug;
use anyhow::{ensure, Result};
use rustfft::{Fft, FftPlanner};
use std::sync::{Arc, OnceLock};

pub struct FeatureExtractor {
    cfg: FeatureConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    // Depends only on configuration, never on input audio; built once on
    // first use and read-only afterwards, so extraction calls share it
    // without locking.
    filterbank: OnceLock<Vec<Vec<f32>>>,
}

impl FeatureExtractor {
    pub fn new(cfg: FeatureConfig) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(cfg.fft_size);
        let window = dsp::hamming_window(cfg.frame_size);
        Self {
            cfg,
            fft,
            window,
            filterbank: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.cfg
    }

    /// Frames the chain will produce for a chunk of `samples` samples.
    pub fn expected_frame_count(&self, samples: usize) -> usize {
        dsp::frame_count(samples, self.cfg.frame_size, self.cfg.frame_stride)
    }

    /// Output length contract: `num_coefficients * expected_frame_count`,
    /// honored on both the success and the fail-soft path.
    pub fn expected_len(&self, samples: usize) -> usize {
        self.cfg.num_coefficients * self.expected_frame_count(samples)
    }

    /// Run the transform chain on one chunk. Never fails: any internal
    /// fault is logged and degrades to a zero-filled vector of the expected
    /// length so the capture cadence is never broken by one bad chunk.
    pub fn extract(&self, chunk: &[i16]) -> Vec<f32> {
        match self.try_extract(chunk) {
            Ok(features) => features,
            Err(err) => {
                log_debug(&format!("feature extraction fault, emitting zeros: {err:#}"));
                vec![0.0; self.expected_len(chunk.len())]
            }
        }
    }

    fn try_extract(&self, chunk: &[i16]) -> Result<Vec<f32>> {
        ensure!(
            self.cfg.frame_size == self.cfg.fft_size,
            "frame size {} does not match FFT size {}",
            self.cfg.frame_size,
            self.cfg.fft_size
        );

        let emphasized = dsp::pre_emphasize(chunk, self.cfg.preemphasis_coeff);
        let mut frames = dsp::frame_signal(&emphasized, self.cfg.frame_size, self.cfg.frame_stride);

        let bank = self.filterbank();
        ensure!(!bank.is_empty(), "filterbank has no filters");
        let mut features = Vec::with_capacity(frames.len() * self.cfg.num_coefficients);
        for frame in &mut frames {
            dsp::apply_window(frame, &self.window);
            let power = dsp::power_spectrum(frame, &self.fft);
            ensure!(
                power.len() == bank[0].len(),
                "power spectrum length {} does not match filterbank width {}",
                power.len(),
                bank[0].len()
            );
            let mel = dsp::apply_filterbank(&power, bank);
            features.extend(dsp::cepstral_transform(&mel, self.cfg.num_coefficients));
        }

        ensure!(
            features.iter().all(|v| v.is_finite()),
            "non-finite value in feature vector"
        );
        dsp::normalize(&mut features);
        Ok(features)
    }

    fn filterbank(&self) -> &Vec<Vec<f32>> {
        self.filterbank.get_or_init(|| {
            dsp::mel_filterbank(
                self.cfg.fft_size,
                self.cfg.sample_rate,
                self.cfg.num_filters,
                self.cfg.low_hz,
                self.cfg.high_hz,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(FeatureConfig::default())
    }

    fn tone_chunk(len: usize, freq: f32) -> Vec<i16> {
        (0..len)
            .map(|i| ((2.0 * PI * freq * i as f32 / 16_000.0).sin() * 20_000.0) as i16)
            .collect()
    }

    #[test]
    fn output_length_matches_contract_for_default_chunk() {
        let extractor = extractor();
        let features = extractor.extract(&tone_chunk(512, 440.0));
        assert_eq!(features.len(), extractor.expected_len(512));
        assert_eq!(features.len(), 13); // one frame at 512/256
    }

    #[test]
    fn output_length_matches_contract_for_longer_buffers() {
        let extractor = extractor();
        let per_frame = extractor.config().num_coefficients;
        for len in [512usize, 768, 1024, 4096] {
            let features = extractor.extract(&tone_chunk(len, 440.0));
            let frames = extractor.expected_frame_count(len);
            assert_eq!(features.len(), per_frame * frames, "chunk of {len} samples");
        }
    }

    #[test]
    fn silent_chunk_degenerates_to_zeros() {
        // All-zero input hits the zero-variance floor and normalizes to
        // all zeros without faulting.
        let extractor = extractor();
        let features = extractor.extract(&[0i16; 512]);
        assert_eq!(features.len(), 13);
        assert!(features.iter().all(|&v| v.abs() < 1e-3));
    }

    #[test]
    fn full_scale_chunk_produces_normalized_features() {
        let extractor = extractor();
        let features = extractor.extract(&[32_767i16; 512]);
        assert_eq!(features.len(), extractor.expected_len(512));
        assert!(features.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn tonal_input_yields_non_constant_features() {
        let extractor = extractor();
        let features = extractor.extract(&tone_chunk(1024, 1000.0));
        let spread = features
            .iter()
            .fold(0.0f32, |acc, &v| acc.max(v.abs()));
        assert!(spread > 0.1, "normalized features look constant: {spread}");
    }

    #[test]
    fn shape_fault_degrades_to_zero_vector() {
        // Mismatched frame/FFT sizes trip the internal shape check; the
        // extractor must still honor the output length contract.
        let cfg = FeatureConfig {
            fft_size: 256,
            ..FeatureConfig::default()
        };
        let extractor = FeatureExtractor::new(cfg);
        let features = extractor.extract(&tone_chunk(512, 440.0));
        assert_eq!(features.len(), extractor.expected_len(512));
        assert!(features.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn short_chunk_still_produces_one_frame() {
        let extractor = extractor();
        let features = extractor.extract(&tone_chunk(100, 440.0));
        assert_eq!(extractor.expected_frame_count(100), 1);
        assert_eq!(features.len(), 13);
    }
}
