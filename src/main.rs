use anyhow::Result;
use clap::Parser;
use speechpipe::config::{AppConfig, RecognizerSettings};
use speechpipe::engine::{CharLookupDecoder, FixedOutputEngine, Recognizer};
use speechpipe::pipeline::{self, Transcript};
use speechpipe::{
    capture::CaptureLoop, features::FeatureExtractor, init_debug_log_file, log_debug,
    log_file_path,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() -> Result<()> {
    run_with_args(std::env::args_os())
}

fn run_with_args<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let mut config = AppConfig::parse_from(args);

    if config.list_input_devices {
        let names = CaptureLoop::list_devices()?;
        if names.is_empty() {
            println!("No audio input devices detected.");
        } else {
            for name in names {
                println!("{name}");
            }
        }
        return Ok(());
    }

    config.validate()?;
    init_debug_log_file();
    log_debug("=== speechpipe session started ===");
    log_debug(&format!("Log file: {:?}", log_file_path()));

    let settings = match &config.settings {
        Some(path) => RecognizerSettings::load(path)?,
        None => RecognizerSettings::default(),
    };
    log_debug(&format!(
        "settings: high_accuracy={} gpu={} noise_suppression={} recog_sens={} mic_sens={}",
        settings.high_accuracy_mode,
        settings.use_gpu_acceleration,
        settings.noise_suppression_enabled,
        settings.recognition_sensitivity,
        settings.microphone_sensitivity
    ));

    let capture = Arc::new(CaptureLoop::new(config.capture_config(&settings)));
    let extractor = Arc::new(FeatureExtractor::new(config.feature_config(&settings)));
    let model_cfg = config.model_config();
    // No model artifact ships with the CLI; the silent engine exercises the
    // full pipeline and real engines plug in through the same trait.
    let recognizer = Arc::new(Recognizer::new(
        Box::new(FixedOutputEngine::silent(&model_cfg)),
        Box::new(CharLookupDecoder),
        model_cfg,
    ));

    println!(
        "Capturing for {}s at {} Hz (frame size {})... speak now.",
        config.seconds, config.sample_rate, config.frame_size
    );

    let job = pipeline::start_transcription(capture.clone(), extractor, recognizer)?;
    let deadline = Instant::now() + Duration::from_secs(config.seconds);
    let mut transcript = Transcript::default();

    while Instant::now() < deadline {
        match job.receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(result) => {
                transcript.push_segment(&result.text);
                print_meter(result.amplitudes.last().copied().unwrap_or(1.0));
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    job.stop();
    println!();
    if capture.dropped_chunks() > 0 {
        log_debug(&format!(
            "dropped {} chunks during capture",
            capture.dropped_chunks()
        ));
    }

    if transcript.as_str().is_empty() {
        println!("No speech recognized.");
    } else {
        println!("Transcript: {}", transcript.as_str());
    }
    log_debug("=== speechpipe session finished ===");
    Ok(())
}

/// One-line text meter driven by the amplitude history's newest value.
/// Values start at 1.0 for silence, so the bar length tracks loudness.
fn print_meter(amplitude: f32) {
    let bars = (((amplitude - 1.0) * 60.0).round().clamp(0.0, 40.0)) as usize;
    print!("\r[{:<40}]", "#".repeat(bars));
    use std::io::Write;
    let _ = std::io::stdout().flush();
}
