//! Command-line parsing, validation, and the typed configuration snapshots
//! handed to each pipeline component at construction.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SAMPLE_RATE: u32 = 16_000;
const DEFAULT_FRAME_SIZE: usize = 512;
const DEFAULT_FRAME_STRIDE: usize = 256;
const DEFAULT_NUM_MFCC: usize = 13;
const DEFAULT_NUM_FILTERS: usize = 26;
const DEFAULT_LOW_HZ: f32 = 20.0;
const DEFAULT_HIGH_HZ: f32 = 8000.0;
const DEFAULT_PREEMPHASIS: f32 = 0.97;
const DEFAULT_HISTORY_CAPACITY: usize = 50;
const DEFAULT_LOOP_SLEEP_MS: u64 = 10;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_MAX_SEQ_LENGTH: usize = 100;
const DEFAULT_INPUT_FEATURE_SIZE: usize = 13;
const DEFAULT_OUTPUT_SIZE: usize = 128;

/// CLI options for the speechpipe binary. Validated values keep the DSP
/// chain's shape contracts intact before anything touches the device.
#[derive(Debug, Parser, Clone)]
#[command(about = "Live microphone transcription pipeline", author, version)]
pub struct AppConfig {
    /// Preferred audio input device name
    #[arg(long)]
    pub input_device: Option<String>,

    /// Print detected audio input devices and exit
    #[arg(long = "list-input-devices", default_value_t = false)]
    pub list_input_devices: bool,

    /// Capture duration in seconds for the live session
    #[arg(long, default_value_t = 5)]
    pub seconds: u64,

    /// Capture sample rate (Hz)
    #[arg(long = "sample-rate", default_value_t = DEFAULT_SAMPLE_RATE)]
    pub sample_rate: u32,

    /// Samples per audio chunk / analysis frame
    #[arg(long = "frame-size", default_value_t = DEFAULT_FRAME_SIZE)]
    pub frame_size: usize,

    /// Hop between successive analysis frames (samples)
    #[arg(long = "frame-stride", default_value_t = DEFAULT_FRAME_STRIDE)]
    pub frame_stride: usize,

    /// Cepstral coefficients kept per frame
    #[arg(long = "num-mfcc", default_value_t = DEFAULT_NUM_MFCC)]
    pub num_mfcc: usize,

    /// Triangular mel filters in the filterbank
    #[arg(long = "num-filters", default_value_t = DEFAULT_NUM_FILTERS)]
    pub num_filters: usize,

    /// Lower edge of the mel filterbank (Hz)
    #[arg(long = "low-hz", default_value_t = DEFAULT_LOW_HZ)]
    pub low_hz: f32,

    /// Upper edge of the mel filterbank (Hz)
    #[arg(long = "high-hz", default_value_t = DEFAULT_HIGH_HZ)]
    pub high_hz: f32,

    /// Pre-emphasis filter coefficient
    #[arg(long, default_value_t = DEFAULT_PREEMPHASIS)]
    pub preemphasis: f32,

    /// Rolling amplitude values kept for visualization
    #[arg(long = "history-capacity", default_value_t = DEFAULT_HISTORY_CAPACITY)]
    pub history_capacity: usize,

    /// Sleep between capture iterations (milliseconds)
    #[arg(long = "loop-sleep-ms", default_value_t = DEFAULT_LOOP_SLEEP_MS)]
    pub loop_sleep_ms: u64,

    /// Chunk queue capacity between the device callback and the capture loop
    #[arg(long = "channel-capacity", default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    pub channel_capacity: usize,

    /// Path to a JSON settings file from the persistence collaborator
    #[arg(long)]
    pub settings: Option<PathBuf>,
}

impl AppConfig {
    /// Check CLI values against the pipeline's shape and range contracts.
    pub fn validate(&mut self) -> Result<()> {
        if !(8_000..=48_000).contains(&self.sample_rate) {
            bail!(
                "--sample-rate must be between 8000 and 48000 Hz, got {}",
                self.sample_rate
            );
        }
        if !self.frame_size.is_power_of_two() || !(64..=8192).contains(&self.frame_size) {
            bail!(
                "--frame-size must be a power of two between 64 and 8192, got {}",
                self.frame_size
            );
        }
        if self.frame_stride == 0 || self.frame_stride > self.frame_size {
            bail!(
                "--frame-stride must be between 1 and --frame-size ({}), got {}",
                self.frame_size,
                self.frame_stride
            );
        }
        if self.num_mfcc == 0 || self.num_mfcc > self.num_filters {
            bail!(
                "--num-mfcc must be between 1 and --num-filters ({}), got {}",
                self.num_filters,
                self.num_mfcc
            );
        }
        if self.num_filters > 128 {
            bail!("--num-filters must be at most 128, got {}", self.num_filters);
        }
        let nyquist = self.sample_rate as f32 / 2.0;
        if self.low_hz < 0.0 || self.low_hz >= self.high_hz || self.high_hz > nyquist {
            bail!(
                "filterbank bounds must satisfy 0 <= --low-hz < --high-hz <= {nyquist} Hz, \
                 got {} and {}",
                self.low_hz,
                self.high_hz
            );
        }
        if !(0.0..1.0).contains(&self.preemphasis) {
            bail!(
                "--preemphasis must be in [0.0, 1.0), got {}",
                self.preemphasis
            );
        }
        if self.history_capacity == 0 || self.history_capacity > 1000 {
            bail!(
                "--history-capacity must be between 1 and 1000, got {}",
                self.history_capacity
            );
        }
        if self.loop_sleep_ms > 100 {
            bail!(
                "--loop-sleep-ms must be at most 100, got {}",
                self.loop_sleep_ms
            );
        }
        if !(8..=1024).contains(&self.channel_capacity) {
            bail!(
                "--channel-capacity must be between 8 and 1024, got {}",
                self.channel_capacity
            );
        }
        if self.seconds == 0 || self.seconds > 600 {
            bail!("--seconds must be between 1 and 600, got {}", self.seconds);
        }
        Ok(())
    }

    /// Snapshot of everything the feature extractor needs. The settings file
    /// may nudge the pre-emphasis coefficient via recognition sensitivity.
    pub fn feature_config(&self, settings: &RecognizerSettings) -> FeatureConfig {
        let coeff = (self.preemphasis * settings.recognition_sensitivity).clamp(0.0, 0.999);
        FeatureConfig {
            sample_rate: self.sample_rate,
            frame_size: self.frame_size,
            frame_stride: self.frame_stride,
            fft_size: self.frame_size,
            num_coefficients: self.num_mfcc,
            num_filters: self.num_filters,
            low_hz: self.low_hz,
            high_hz: self.high_hz,
            preemphasis_coeff: coeff,
        }
    }

    /// Snapshot of the capture loop tunables.
    pub fn capture_config(&self, settings: &RecognizerSettings) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.sample_rate,
            frame_size: self.frame_size,
            channel_capacity: self.channel_capacity,
            loop_sleep: Duration::from_millis(self.loop_sleep_ms),
            history_capacity: self.history_capacity,
            preferred_device: self.input_device.clone(),
            microphone_sensitivity: settings.microphone_sensitivity,
        }
    }

    /// Snapshot of the inference tensor contract.
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            max_seq_length: DEFAULT_MAX_SEQ_LENGTH,
            input_feature_size: DEFAULT_INPUT_FEATURE_SIZE,
            output_size: DEFAULT_OUTPUT_SIZE,
        }
    }
}

/// Immutable parameters for the MFCC transform chain.
#[derive(Debug, Clone)]
pub struct FeatureConfig {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub frame_stride: usize,
    pub fft_size: usize,
    pub num_coefficients: usize,
    pub num_filters: usize,
    pub low_hz: f32,
    pub high_hz: f32,
    pub preemphasis_coeff: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_size: DEFAULT_FRAME_SIZE,
            frame_stride: DEFAULT_FRAME_STRIDE,
            fft_size: DEFAULT_FRAME_SIZE,
            num_coefficients: DEFAULT_NUM_MFCC,
            num_filters: DEFAULT_NUM_FILTERS,
            low_hz: DEFAULT_LOW_HZ,
            high_hz: DEFAULT_HIGH_HZ,
            preemphasis_coeff: DEFAULT_PREEMPHASIS,
        }
    }
}

/// Immutable parameters for the capture loop and amplitude tracker.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub channel_capacity: usize,
    pub loop_sleep: Duration,
    pub history_capacity: usize,
    pub preferred_device: Option<String>,
    pub microphone_sensitivity: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_size: DEFAULT_FRAME_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            loop_sleep: Duration::from_millis(DEFAULT_LOOP_SLEEP_MS),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            preferred_device: None,
            microphone_sensitivity: 1.0,
        }
    }
}

/// Fixed tensor contract against the opaque recognizer model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub max_seq_length: usize,
    pub input_feature_size: usize,
    pub output_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            max_seq_length: DEFAULT_MAX_SEQ_LENGTH,
            input_feature_size: DEFAULT_INPUT_FEATURE_SIZE,
            output_size: DEFAULT_OUTPUT_SIZE,
        }
    }
}

/// Tunables persisted by the settings collaborator. The core only reads
/// these; storage belongs to the external record store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognizerSettings {
    pub high_accuracy_mode: bool,
    pub recognition_sensitivity: f32,
    pub use_gpu_acceleration: bool,
    pub noise_suppression_enabled: bool,
    pub microphone_sensitivity: f32,
}

impl Default for RecognizerSettings {
    fn default() -> Self {
        Self {
            high_accuracy_mode: false,
            recognition_sensitivity: 1.0,
            use_gpu_acceleration: false,
            noise_suppression_enabled: false,
            microphone_sensitivity: 1.0,
        }
    }
}

impl RecognizerSettings {
    /// Load settings exported by the persistence collaborator, clamping the
    /// sensitivity knobs into their working ranges.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
        let mut settings: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse settings file '{}'", path.display()))?;
        settings.recognition_sensitivity = settings.recognition_sensitivity.clamp(0.5, 1.5);
        settings.microphone_sensitivity = settings.microphone_sensitivity.clamp(0.1, 4.0);
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn accepts_valid_defaults() {
        let mut cfg = AppConfig::parse_from(["test-app"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_frame_size() {
        let mut cfg = AppConfig::parse_from(["test-app", "--frame-size", "500"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_stride_exceeding_frame() {
        let mut cfg = AppConfig::parse_from(["test-app", "--frame-stride", "1024"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_filterbank_bounds_past_nyquist() {
        let mut cfg = AppConfig::parse_from(["test-app", "--high-hz", "9000"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_more_coefficients_than_filters() {
        let mut cfg = AppConfig::parse_from(["test-app", "--num-mfcc", "30"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn settings_nudge_preemphasis_and_gain() {
        let cfg = AppConfig::parse_from(["test-app"]);
        let settings = RecognizerSettings {
            recognition_sensitivity: 0.5,
            microphone_sensitivity: 2.0,
            ..RecognizerSettings::default()
        };
        let features = cfg.feature_config(&settings);
        assert!((features.preemphasis_coeff - 0.485).abs() < 1e-6);
        let capture = cfg.capture_config(&settings);
        assert!((capture.microphone_sensitivity - 2.0).abs() < 1e-6);
    }

    #[test]
    fn settings_parse_from_json_with_defaults() {
        let json = r#"{ "microphone_sensitivity": 1.5 }"#;
        let settings: RecognizerSettings = serde_json::from_str(json).unwrap();
        assert!((settings.microphone_sensitivity - 1.5).abs() < 1e-6);
        assert!(!settings.high_accuracy_mode);
        assert!((settings.recognition_sensitivity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn settings_carry_engine_flags() {
        let json = r#"{
            "high_accuracy_mode": true,
            "use_gpu_acceleration": true,
            "noise_suppression_enabled": true
        }"#;
        let settings: RecognizerSettings = serde_json::from_str(json).unwrap();
        assert!(settings.high_accuracy_mode);
        assert!(settings.use_gpu_acceleration);
        assert!(settings.noise_suppression_enabled);
    }
}
