pub mod capture;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod features;
pub mod meter;
pub mod pipeline;

pub use capture::{CaptureError, CaptureLoop};
pub use engine::{InferenceEngine, Recognizer, TranscriptDecoder};
pub use features::FeatureExtractor;
pub use meter::AmplitudeHistory;
pub use pipeline::{RecognitionResult, TranscriptionJob};

use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Path to the temp log file we rotate between runs.
pub fn log_file_path() -> PathBuf {
    std::env::temp_dir().join("speechpipe.log")
}

/// Write debug messages to a temp file so per-chunk faults leave a trace
/// without ever interrupting the capture cadence.
pub fn log_debug(msg: &str) {
    use std::fs::OpenOptions;

    let log_path = log_file_path();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(log_path) {
        let _ = writeln!(file, "[{timestamp}] {msg}");
    }
}

/// Remove the log file if it grows past 5 MB between runs.
pub fn init_debug_log_file() {
    let log_path = log_file_path();
    if let Ok(metadata) = std::fs::metadata(&log_path) {
        const MAX_BYTES: u64 = 5 * 1024 * 1024;
        if metadata.len() > MAX_BYTES {
            let _ = std::fs::remove_file(&log_path);
        }
    }
}
