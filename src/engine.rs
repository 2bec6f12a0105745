//! Fixed-contract boundary to the opaque recognizer model: encode a feature
//! vector into the model's tensor layout, run the engine, decode the output
//! into text. Recognition failures degrade to an empty string; they are
//! never fatal to capture.

use crate::config::ModelConfig;
use crate::log_debug;
use anyhow::{ensure, Result};

/// The opaque model. Implementations accept a row-major
/// `max_seq_length * input_feature_size` float tensor and return a
/// fixed-size output vector. A deterministic fake stands in for the real
/// engine in tests.
pub trait InferenceEngine: Send + Sync {
    fn run(&self, input: &[f32]) -> Result<Vec<f32>>;

    fn name(&self) -> &'static str {
        "inference_engine"
    }
}

/// Decoding strategy for the model's raw output. The concrete algorithm is
/// owned by whichever model is integrated; the default is a character
/// lookup over the argmax.
pub trait TranscriptDecoder: Send + Sync {
    fn decode(&self, output: &[f32]) -> String;
}

/// Pad or truncate a feature vector to the model's row-major input shape.
pub fn encode_features(features: &[f32], cfg: &ModelConfig) -> Vec<f32> {
    let len = cfg.max_seq_length * cfg.input_feature_size;
    let mut input = vec![0.0f32; len];
    let copy = features.len().min(len);
    input[..copy].copy_from_slice(&features[..copy]);
    input
}

/// Maps the argmax of the output vector through the printable ASCII range.
/// Indices outside it decode to nothing, which keeps silence silent.
#[derive(Debug, Default)]
pub struct CharLookupDecoder;

impl TranscriptDecoder for CharLookupDecoder {
    fn decode(&self, output: &[f32]) -> String {
        let Some((index, &score)) = output
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            return String::new();
        };
        if score <= 0.0 {
            return String::new();
        }
        let ch = index as u8 as char;
        if ch.is_ascii_graphic() || ch == ' ' {
            ch.to_string()
        } else {
            String::new()
        }
    }
}

/// Deterministic engine that always returns the same output vector. Useful
/// when no model artifact is packaged and as a test double.
#[derive(Debug, Clone)]
pub struct FixedOutputEngine {
    output: Vec<f32>,
}

impl FixedOutputEngine {
    pub fn new(output: Vec<f32>) -> Self {
        Self { output }
    }

    /// An all-zero output of the configured size; decodes to nothing.
    pub fn silent(cfg: &ModelConfig) -> Self {
        Self {
            output: vec![0.0; cfg.output_size],
        }
    }
}

impl InferenceEngine for FixedOutputEngine {
    fn run(&self, _input: &[f32]) -> Result<Vec<f32>> {
        Ok(self.output.clone())
    }

    fn name(&self) -> &'static str {
        "fixed_output_engine"
    }
}

/// Ties the engine and decoder together behind the
/// `recognize(features) -> String` contract.
pub struct Recognizer {
    engine: Box<dyn InferenceEngine>,
    decoder: Box<dyn TranscriptDecoder>,
    cfg: ModelConfig,
}

impl Recognizer {
    pub fn new(
        engine: Box<dyn InferenceEngine>,
        decoder: Box<dyn TranscriptDecoder>,
        cfg: ModelConfig,
    ) -> Self {
        Self {
            engine,
            decoder,
            cfg,
        }
    }

    /// Encode, run, decode. Any adapter fault returns an empty string and a
    /// log line rather than propagating.
    pub fn recognize(&self, features: &[f32]) -> String {
        match self.try_recognize(features) {
            Ok(text) => text,
            Err(err) => {
                log_debug(&format!(
                    "inference fault in {}: {err:#}",
                    self.engine.name()
                ));
                String::new()
            }
        }
    }

    fn try_recognize(&self, features: &[f32]) -> Result<String> {
        let input = encode_features(features, &self.cfg);
        let output = self.engine.run(&input)?;
        ensure!(
            output.len() == self.cfg.output_size,
            "engine returned {} floats, expected {}",
            output.len(),
            self.cfg.output_size
        );
        Ok(self.decoder.decode(&output))
    }
}
