//! Owns the audio input device and runs the blocking read/publish cycle.
//!
//! cpal delivers samples on its own callback thread; a bounded channel of
//! frame-sized i16 chunks decouples that thread from the capture loop, which
//! does the blocking receive, updates the amplitude history, and invokes the
//! consumer callback synchronously. Chunk N+1 is never taken before the
//! callback for chunk N returns, so a slow consumer throttles capture
//! instead of growing an unbounded buffer (overflow shows up as a dropped
//! chunk count instead).

use crate::config::CaptureConfig;
use crate::log_debug;
use crate::meter::AmplitudeTracker;
use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, StreamConfig, SupportedBufferSize};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Only device acquisition is reported to the caller of `start`; every
/// per-chunk fault is contained inside the loop.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("audio input device unavailable: {0}")]
    DeviceUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Recording,
}

struct Shared {
    state: SessionState,
    // Run flag of the current session; a fresh Arc per start so a stale
    // loop thread can never be revived by a later session.
    run_flag: Arc<AtomicBool>,
}

/// Single-session capture owner: `start` is idempotent while Recording,
/// `stop` is idempotent while Idle, and the Idle/Recording transition is
/// guarded by one mutex.
pub struct CaptureLoop {
    cfg: CaptureConfig,
    shared: Arc<Mutex<Shared>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    dropped: Arc<AtomicUsize>,
}

impl CaptureLoop {
    pub fn new(cfg: CaptureConfig) -> Self {
        Self {
            cfg,
            shared: Arc::new(Mutex::new(Shared {
                state: SessionState::Idle,
                run_flag: Arc::new(AtomicBool::new(false)),
            })),
            handle: Mutex::new(None),
            dropped: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// List microphone names so the CLI can expose a selector.
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices().context("no input devices available")?;
        let mut names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Begin capturing on a dedicated thread. `on_chunk` receives each
    /// frame-sized chunk together with the chronological amplitude snapshot
    /// and is invoked synchronously before the next read is issued.
    ///
    /// A second `start` while Recording is a silent no-op; failure to open
    /// the device at the configured rate reports `DeviceUnavailable` and
    /// leaves the loop Idle.
    pub fn start<F>(&self, on_chunk: F) -> Result<(), CaptureError>
    where
        F: FnMut(&[i16], &[f32]) + Send + 'static,
    {
        let Some(run_flag) = self.try_begin() else {
            return Ok(());
        };

        let (setup_tx, setup_rx) = mpsc::channel();
        let cfg = self.cfg.clone();
        let shared = self.shared.clone();
        let dropped = self.dropped.clone();
        let flag = run_flag.clone();
        let handle = thread::spawn(move || {
            run_session(cfg, shared, flag, dropped, on_chunk, setup_tx);
        });

        match setup_rx.recv() {
            Ok(Ok(())) => {
                *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                Ok(())
            }
            Ok(Err(msg)) => {
                let _ = handle.join();
                Err(CaptureError::DeviceUnavailable(msg))
            }
            Err(_) => {
                let _ = handle.join();
                Err(CaptureError::DeviceUnavailable(
                    "capture thread exited during setup".to_string(),
                ))
            }
        }
    }

    /// Flag the loop to exit at its next iteration boundary. Safe to call
    /// repeatedly and from any thread; the device itself is released by the
    /// loop thread, not synchronously with this returning.
    pub fn stop(&self) {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.run_flag.store(false, Ordering::Relaxed);
        shared.state = SessionState::Idle;
    }

    /// Block until the loop thread has wound down and the device is
    /// released. Used after `stop` when teardown must be observed.
    pub fn join(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn is_recording(&self) -> bool {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).state == SessionState::Recording
    }

    /// Chunks discarded because the consumer could not keep up with the
    /// device callback.
    pub fn dropped_chunks(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Check-and-set under the session mutex: at most one concurrent
    /// `start` wins and receives the fresh run flag.
    fn try_begin(&self) -> Option<Arc<AtomicBool>> {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        if shared.state == SessionState::Recording {
            return None;
        }
        let flag = Arc::new(AtomicBool::new(true));
        shared.state = SessionState::Recording;
        shared.run_flag = flag.clone();
        Some(flag)
    }
}

/// Runs on the dedicated capture thread. The cpal stream lives on this
/// stack frame, so the device is released on every exit path.
fn run_session<F>(
    cfg: CaptureConfig,
    shared: Arc<Mutex<Shared>>,
    flag: Arc<AtomicBool>,
    dropped: Arc<AtomicUsize>,
    mut on_chunk: F,
    setup_tx: mpsc::Sender<std::result::Result<(), String>>,
) where
    F: FnMut(&[i16], &[f32]) + Send,
{
    let (stream, chunks) = match open_stream(&cfg, dropped) {
        Ok(pair) => pair,
        Err(err) => {
            let _ = setup_tx.send(Err(format!("{err:#}")));
            end_session(&shared, &flag);
            return;
        }
    };

    if let Err(err) = stream.play() {
        let _ = setup_tx.send(Err(format!("failed to start audio stream: {err}")));
        end_session(&shared, &flag);
        return;
    }
    let _ = setup_tx.send(Ok(()));

    let mut tracker = AmplitudeTracker::new(cfg.history_capacity, cfg.microphone_sensitivity);
    run_chunk_loop(&chunks, &flag, &mut tracker, &mut on_chunk, cfg.loop_sleep);

    if let Err(err) = stream.pause() {
        log_debug(&format!("failed to pause audio stream: {err}"));
    }
    drop(stream);
    end_session(&shared, &flag);
}

/// The blocking read/publish cycle. One chunk per iteration: receive,
/// skip empty reads, update the amplitude history, invoke the callback,
/// then sleep briefly to bound CPU usage. Exits when the run flag clears
/// or the device side disconnects.
fn run_chunk_loop<F>(
    chunks: &Receiver<Vec<i16>>,
    flag: &AtomicBool,
    tracker: &mut AmplitudeTracker,
    on_chunk: &mut F,
    sleep: Duration,
) where
    F: FnMut(&[i16], &[f32]) + Send,
{
    let wait = Duration::from_millis(20);
    while flag.load(Ordering::Relaxed) {
        match chunks.recv_timeout(wait) {
            Ok(chunk) => {
                if chunk.is_empty() {
                    // Short read at stream end; tolerated, no callback.
                    continue;
                }
                let snapshot = tracker.observe(&chunk);
                on_chunk(&chunk, &snapshot);
                if !sleep.is_zero() {
                    thread::sleep(sleep);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                log_debug("audio stream disconnected");
                break;
            }
        }
    }
}

fn end_session(shared: &Arc<Mutex<Shared>>, flag: &Arc<AtomicBool>) {
    flag.store(false, Ordering::Relaxed);
    let mut shared = shared.lock().unwrap_or_else(|e| e.into_inner());
    // A newer session may already own the state; only this session's flag
    // resets it.
    if Arc::ptr_eq(&shared.run_flag, flag) {
        shared.state = SessionState::Idle;
    }
}

/// Open the configured device at the configured rate and wire its callback
/// into a bounded chunk channel. Every failure here maps to
/// `DeviceUnavailable` at the `start` boundary.
fn open_stream(
    cfg: &CaptureConfig,
    dropped: Arc<AtomicUsize>,
) -> Result<(cpal::Stream, Receiver<Vec<i16>>)> {
    let host = cpal::default_host();
    let device = match cfg.preferred_device.as_deref() {
        Some(name) => {
            let mut devices = host.input_devices().context("no input devices available")?;
            devices
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| anyhow!("input device '{name}' not found"))?
        }
        None => host
            .default_input_device()
            .context("no default input device available")?,
    };

    let supported = device
        .supported_input_configs()
        .context("failed to query input configurations")?
        .find(|range| {
            range.min_sample_rate().0 <= cfg.sample_rate
                && cfg.sample_rate <= range.max_sample_rate().0
        })
        .ok_or_else(|| anyhow!("device does not support {} Hz input", cfg.sample_rate))?
        .with_sample_rate(SampleRate(cfg.sample_rate));

    let format = supported.sample_format();
    let channels = usize::from(supported.channels().max(1));
    // Device buffer of at least two chunks, clamped to what the hardware
    // reports it can do.
    let buffer_size = match supported.buffer_size() {
        SupportedBufferSize::Range { min, max } => {
            let wanted = (cfg.frame_size as u32 * 2).max(*min).min(*max);
            BufferSize::Fixed(wanted)
        }
        SupportedBufferSize::Unknown => BufferSize::Default,
    };
    let stream_config = StreamConfig {
        channels: supported.channels(),
        sample_rate: SampleRate(cfg.sample_rate),
        buffer_size,
    };

    let (sender, receiver) = bounded::<Vec<i16>>(cfg.channel_capacity.max(1));
    let dispatcher = Arc::new(Mutex::new(ChunkDispatcher::new(
        cfg.frame_size,
        sender,
        dropped,
    )));

    let err_fn = |err| log_debug(&format!("audio_stream_error: {err}"));
    let stream = match format {
        SampleFormat::F32 => {
            let dispatcher = dispatcher.clone();
            device.build_input_stream(
                &stream_config,
                move |data: &[f32], _| {
                    if let Ok(mut pump) = dispatcher.lock() {
                        pump.push(data, channels, |sample| sample);
                    }
                },
                err_fn,
                None,
            )?
        }
        SampleFormat::I16 => {
            let dispatcher = dispatcher.clone();
            device.build_input_stream(
                &stream_config,
                move |data: &[i16], _| {
                    if let Ok(mut pump) = dispatcher.lock() {
                        pump.push(data, channels, |sample| sample as f32 / 32_768.0);
                    }
                },
                err_fn,
                None,
            )?
        }
        SampleFormat::U16 => {
            let dispatcher = dispatcher.clone();
            device.build_input_stream(
                &stream_config,
                move |data: &[u16], _| {
                    if let Ok(mut pump) = dispatcher.lock() {
                        pump.push(data, channels, |sample| {
                            (sample as f32 - 32_768.0) / 32_768.0
                        });
                    }
                },
                err_fn,
                None,
            )?
        }
        other => return Err(anyhow!("unsupported sample format: {other:?}")),
    };

    Ok((stream, receiver))
}

/// Accumulates mono i16 samples on the cpal callback thread and flushes
/// frame-sized chunks into the bounded channel. A full channel increments
/// the dropped counter instead of blocking the audio callback.
struct ChunkDispatcher {
    chunk_samples: usize,
    pending: Vec<i16>,
    scratch: Vec<f32>,
    sender: Sender<Vec<i16>>,
    dropped: Arc<AtomicUsize>,
}

impl ChunkDispatcher {
    fn new(chunk_samples: usize, sender: Sender<Vec<i16>>, dropped: Arc<AtomicUsize>) -> Self {
        Self {
            chunk_samples: chunk_samples.max(1),
            pending: Vec::with_capacity(chunk_samples),
            scratch: Vec::new(),
            sender,
            dropped,
        }
    }

    fn push<T, F>(&mut self, data: &[T], channels: usize, convert: F)
    where
        T: Copy,
        F: FnMut(T) -> f32,
    {
        self.scratch.clear();
        downmix_into(&mut self.scratch, data, channels, convert);
        self.pending.extend(
            self.scratch
                .iter()
                .map(|&s| (s.clamp(-1.0, 1.0) * 32_767.0) as i16),
        );

        while self.pending.len() >= self.chunk_samples {
            let chunk: Vec<i16> = self.pending.drain(..self.chunk_samples).collect();
            if let Err(err) = self.sender.try_send(chunk) {
                match err {
                    TrySendError::Full(_) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    TrySendError::Disconnected(_) => break,
                }
            }
        }
    }
}

/// Average interleaved channels down to mono while applying the sample
/// converter, so the rest of the pipeline sees one channel regardless of
/// the microphone layout.
fn downmix_into<T, F>(buf: &mut Vec<f32>, data: &[T], channels: usize, mut convert: F)
where
    T: Copy,
    F: FnMut(T) -> f32,
{
    if channels <= 1 {
        buf.extend(data.iter().copied().map(&mut convert));
        return;
    }

    let mut acc = 0.0f32;
    let mut count = 0usize;
    for sample in data.iter().copied() {
        acc += convert(sample);
        count += 1;
        if count == channels {
            buf.push(acc / channels as f32);
            acc = 0.0;
            count = 0;
        }
    }
    if count > 0 {
        buf.push(acc / count as f32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn test_cfg() -> CaptureConfig {
        CaptureConfig::default()
    }

    #[test]
    fn second_begin_is_rejected_while_recording() {
        let capture = CaptureLoop::new(test_cfg());
        let first = capture.try_begin();
        assert!(first.is_some());
        assert!(capture.try_begin().is_none());
        assert!(capture.is_recording());
    }

    #[test]
    fn stop_when_idle_is_a_no_op() {
        let capture = CaptureLoop::new(test_cfg());
        capture.stop();
        capture.stop();
        assert!(!capture.is_recording());
    }

    #[test]
    fn stop_clears_the_session_flag() {
        let capture = CaptureLoop::new(test_cfg());
        let flag = capture.try_begin().expect("first begin should win");
        assert!(flag.load(Ordering::Relaxed));
        capture.stop();
        assert!(!flag.load(Ordering::Relaxed));
        assert!(!capture.is_recording());
    }

    #[test]
    fn start_after_stop_uses_a_fresh_flag() {
        let capture = CaptureLoop::new(test_cfg());
        let old_flag = capture.try_begin().expect("first begin");
        capture.stop();
        let new_flag = capture.try_begin().expect("begin after stop");
        assert!(!Arc::ptr_eq(&old_flag, &new_flag));
        // The stale session's teardown must not clobber the new one.
        end_session(&capture.shared, &old_flag);
        assert!(capture.is_recording());
    }

    #[test]
    fn chunk_loop_observes_back_pressure_order() {
        let (tx, rx) = bounded::<Vec<i16>>(8);
        let flag = AtomicBool::new(true);
        let mut tracker = AmplitudeTracker::new(10, 1.0);
        let mut seen: Vec<(usize, usize)> = Vec::new();

        tx.send(vec![0i16; 4]).unwrap();
        tx.send(Vec::new()).unwrap(); // short read, must be skipped
        tx.send(vec![1000i16; 4]).unwrap();
        tx.send(vec![2000i16; 4]).unwrap();
        drop(tx);

        run_chunk_loop(
            &rx,
            &flag,
            &mut tracker,
            &mut |chunk, amps| seen.push((chunk.len(), amps.len())),
            Duration::ZERO,
        );

        // Three non-empty chunks, history growing by one per callback.
        assert_eq!(seen, vec![(4, 1), (4, 2), (4, 3)]);
    }

    #[test]
    fn chunk_loop_exits_when_flag_clears() {
        let (tx, rx) = bounded::<Vec<i16>>(8);
        let flag = AtomicBool::new(true);
        let mut tracker = AmplitudeTracker::new(10, 1.0);
        let mut calls = 0usize;

        tx.send(vec![1i16; 4]).unwrap();
        run_chunk_loop(
            &rx,
            &flag,
            &mut tracker,
            &mut |_, _| {
                calls += 1;
                flag.store(false, Ordering::Relaxed);
            },
            Duration::ZERO,
        );
        assert_eq!(calls, 1);
        // The sender is still alive; the loop left because of the flag.
        drop(tx);
    }

    #[test]
    fn dispatcher_emits_fixed_size_chunks() {
        let (tx, rx) = bounded::<Vec<i16>>(8);
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = ChunkDispatcher::new(4, tx, dropped.clone());

        dispatcher.push(&[0.5f32; 10], 1, |s| s);
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 4);
        assert!(rx.try_recv().is_err(), "2 samples should still be pending");
        assert_eq!(dropped.load(Ordering::Relaxed), 0);
        assert_eq!(first[0], (0.5f32 * 32_767.0) as i16);
    }

    #[test]
    fn dispatcher_counts_drops_when_channel_is_full() {
        let (tx, rx) = bounded::<Vec<i16>>(1);
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = ChunkDispatcher::new(2, tx, dropped.clone());

        dispatcher.push(&[0.1f32; 6], 1, |s| s);
        assert_eq!(dropped.load(Ordering::Relaxed), 2);
        assert_eq!(rx.try_recv().unwrap().len(), 2);
    }

    #[test]
    fn downmix_averages_interleaved_channels() {
        let mut buf = Vec::new();
        downmix_into(&mut buf, &[1.0f32, -1.0, 0.5, 0.5], 2, |s| s);
        assert_eq!(buf, vec![0.0, 0.5]);
    }

    #[test]
    fn downmix_preserves_mono_input() {
        let mut buf = Vec::new();
        downmix_into(&mut buf, &[0.1f32, 0.2, 0.3], 1, |s| s);
        assert_eq!(buf, vec![0.1, 0.2, 0.3]);
    }
}
