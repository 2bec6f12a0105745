//! Wires the capture loop, feature extractor, and recognizer together and
//! emits one `RecognitionResult` per chunk to the caller. The heavy work
//! (extraction + inference) happens inside the capture callback, so the
//! back-pressure contract of the loop applies to the whole pipeline.

use crate::capture::{CaptureError, CaptureLoop};
use crate::engine::Recognizer;
use crate::features::FeatureExtractor;
use std::sync::mpsc;
use std::sync::Arc;

/// Recognized text (possibly empty) plus the amplitude history snapshot
/// that produced it, emitted atomically per chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    pub text: String,
    pub amplitudes: Vec<f32>,
}

/// Handle the caller polls for per-chunk results. Dropping the receiver
/// does not stop capture; call `stop`.
pub struct TranscriptionJob {
    pub receiver: mpsc::Receiver<RecognitionResult>,
    capture: Arc<CaptureLoop>,
}

impl TranscriptionJob {
    /// Flag the capture loop to exit and wait for the device release.
    pub fn stop(&self) {
        self.capture.stop();
        self.capture.join();
    }
}

/// Start a live transcription session. Each captured chunk flows through
/// feature extraction and recognition before the next chunk is read.
pub fn start_transcription(
    capture: Arc<CaptureLoop>,
    extractor: Arc<FeatureExtractor>,
    recognizer: Arc<Recognizer>,
) -> Result<TranscriptionJob, CaptureError> {
    let (tx, rx) = mpsc::channel();
    capture.start(move |chunk, amplitudes| {
        let result = process_chunk(&extractor, &recognizer, chunk, amplitudes);
        // A departed caller is not a capture fault; the loop keeps its
        // cadence until stopped.
        let _ = tx.send(result);
    })?;
    Ok(TranscriptionJob {
        receiver: rx,
        capture,
    })
}

/// One pipeline step: extract features, recognize, pair the text with the
/// amplitude snapshot. Both stages are fail-soft, so this always yields a
/// result.
pub fn process_chunk(
    extractor: &FeatureExtractor,
    recognizer: &Recognizer,
    chunk: &[i16],
    amplitudes: &[f32],
) -> RecognitionResult {
    let features = extractor.extract(chunk);
    let text = recognizer.recognize(&features);
    RecognitionResult {
        text,
        amplitudes: amplitudes.to_vec(),
    }
}

/// Running transcript built from per-chunk segments, non-empty segments
/// joined with single spaces.
#[derive(Debug, Default)]
pub struct Transcript {
    text: String,
}

impl Transcript {
    pub fn push_segment(&mut self, segment: &str) {
        let segment = segment.trim();
        if segment.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(segment);
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureConfig, ModelConfig};
    use crate::engine::{CharLookupDecoder, FixedOutputEngine, Recognizer};

    fn recognizer_saying(ch: char) -> Recognizer {
        let cfg = ModelConfig::default();
        let mut output = vec![0.0f32; cfg.output_size];
        output[ch as usize] = 1.0;
        Recognizer::new(
            Box::new(FixedOutputEngine::new(output)),
            Box::new(CharLookupDecoder),
            cfg,
        )
    }

    fn silent_recognizer() -> Recognizer {
        let cfg = ModelConfig::default();
        Recognizer::new(
            Box::new(FixedOutputEngine::silent(&cfg)),
            Box::new(CharLookupDecoder),
            cfg,
        )
    }

    #[test]
    fn process_chunk_pairs_text_with_amplitudes() {
        let extractor = FeatureExtractor::new(FeatureConfig::default());
        let recognizer = recognizer_saying('a');
        let amplitudes = vec![1.0, 1.2, 1.1];
        let result = process_chunk(&extractor, &recognizer, &[100i16; 512], &amplitudes);
        assert_eq!(result.text, "a");
        assert_eq!(result.amplitudes, amplitudes);
    }

    #[test]
    fn silent_chunk_produces_empty_text_and_unity_amplitude() {
        // End-to-end degenerate path: all-zero chunk, zero-variance
        // features, empty recognition, no fault anywhere.
        let extractor = FeatureExtractor::new(FeatureConfig::default());
        let recognizer = silent_recognizer();
        let amplitudes = vec![1.0];
        let result = process_chunk(&extractor, &recognizer, &[0i16; 512], &amplitudes);
        assert_eq!(result.text, "");
        assert!((result.amplitudes[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn transcript_joins_segments_with_spaces() {
        let mut transcript = Transcript::default();
        transcript.push_segment("hello");
        transcript.push_segment("");
        transcript.push_segment("  world  ");
        assert_eq!(transcript.as_str(), "hello world");
    }

    #[test]
    fn transcript_clear_resets_accumulation() {
        let mut transcript = Transcript::default();
        transcript.push_segment("one");
        transcript.clear();
        transcript.push_segment("two");
        assert_eq!(transcript.as_str(), "two");
    }
}
