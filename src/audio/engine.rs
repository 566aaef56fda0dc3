//! Keep-alive playback graph and one-shot tone playback
//!
//! `PlaybackGraph` owns the continuous keep-alive path: looped pink buffer
//! -> analysis tap -> smoothed gain -> output stream. `ToneGraph` owns the
//! independent one-shot path for self-test tones; the two never share a
//! stream, so a tone can start or finish without disturbing the keep-alive
//! signal.

use cpal::traits::{DeviceTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::buffer::{TapBuffer, TapConsumer};
use super::device::{get_default_output_device, get_supported_config, AudioConfig};
use super::signals;
use super::spectrum::{SpectrumAnalyzer, NUM_BANDS};
use super::volume;

/// Tap capacity in samples - a little over two FFT windows of headroom at
/// typical callback sizes.
const TAP_CAPACITY: usize = 4096;

/// Called (at most once per live graph) when the platform reports the
/// stream dead. This is the liveness leg of disconnect detection: on most
/// native hosts, unplugging the wired output surfaces as a stream error
/// rather than a change the device list shows immediately.
pub type InterruptCallback = Arc<dyn Fn() + Send + Sync>;

/// Helper to store f32 in AtomicU32
#[inline]
fn f32_to_u32(f: f32) -> u32 {
    f.to_bits()
}

/// Helper to load f32 from AtomicU32
#[inline]
fn u32_to_f32(u: u32) -> f32 {
    f32::from_bits(u)
}

/// State shared with the audio callback
struct GraphShared {
    target_gain: AtomicU32,
    interrupted: AtomicBool,
}

/// The live keep-alive graph. At most one exists; dropping it releases the
/// stream synchronously.
struct LiveGraph {
    _stream: cpal::Stream,
    shared: Arc<GraphShared>,
    tap: TapConsumer,
    analyzer: SpectrumAnalyzer,
    scratch: Vec<f32>,
}

pub struct PlaybackGraph {
    config: AudioConfig,
    on_interrupt: InterruptCallback,
    live: Option<LiveGraph>,
}

impl PlaybackGraph {
    pub fn new(config: AudioConfig, on_interrupt: InterruptCallback) -> Self {
        Self {
            config,
            on_interrupt,
            live: None,
        }
    }

    /// Build and start a fresh graph at the given power level. Any prior
    /// graph is torn down first. Returns once the stream is playing.
    pub fn start(&mut self, level: u8) -> Result<(), String> {
        self.stop();

        let device = get_default_output_device()?;
        let stream_config = get_supported_config(&device, &self.config)?;
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;

        log::info!(
            "Starting keep-alive graph: {} Hz, {} channels, level {}",
            sample_rate,
            channels,
            level
        );

        let buffer = signals::keepalive_buffer(sample_rate);
        let (mut tap_tx, tap_rx) = TapBuffer::new(TAP_CAPACITY).split();

        let shared = Arc::new(GraphShared {
            target_gain: AtomicU32::new(f32_to_u32(volume::gain_for_level(level))),
            interrupted: AtomicBool::new(false),
        });

        let callback_shared = Arc::clone(&shared);
        let error_shared = Arc::clone(&shared);
        let on_interrupt = Arc::clone(&self.on_interrupt);
        let ramp = volume::smoothing_coefficient(volume::VOLUME_RAMP_SECS, sample_rate);
        let mut position = 0usize;
        // Ramp in from silence rather than stepping to the target.
        let mut current_gain = 0.0f32;

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        let sample = buffer[position];
                        position += 1;
                        if position >= buffer.len() {
                            position = 0;
                        }

                        // Tap is pre-gain, like the analyser node it replaces.
                        tap_tx.push(sample);

                        let target =
                            u32_to_f32(callback_shared.target_gain.load(Ordering::Relaxed));
                        current_gain += (target - current_gain) * ramp;

                        let out = sample * current_gain;
                        for slot in frame.iter_mut() {
                            *slot = out;
                        }
                    }
                },
                move |err| {
                    log::error!("Keep-alive stream error: {}", err);
                    if !error_shared.interrupted.swap(true, Ordering::SeqCst) {
                        (on_interrupt)();
                    }
                },
                None,
            )
            .map_err(|e| format!("Failed to build output stream: {}", e))?;

        stream
            .play()
            .map_err(|e| format!("Failed to start stream: {}", e))?;

        self.live = Some(LiveGraph {
            _stream: stream,
            shared,
            tap: tap_rx,
            analyzer: SpectrumAnalyzer::new(sample_rate),
            scratch: vec![0.0; 2048],
        });

        Ok(())
    }

    /// Retarget the live gain; the callback ramps over ~0.1 s so level
    /// changes never click. No-op when not live.
    pub fn update_volume(&mut self, level: u8) {
        if let Some(live) = &self.live {
            let gain = volume::gain_for_level(level);
            live.shared
                .target_gain
                .store(f32_to_u32(gain), Ordering::Relaxed);
            log::debug!("Keep-alive gain target -> {} (level {})", gain, level);
        }
    }

    /// Tear down the graph and release the stream. Safe to call when
    /// already stopped.
    pub fn stop(&mut self) {
        if self.live.take().is_some() {
            log::info!("Keep-alive graph stopped");
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Frequency-magnitude snapshot from the analysis tap. `None` when the
    /// graph is not live.
    pub fn spectrum(&mut self) -> Option<[f32; NUM_BANDS]> {
        let live = self.live.as_mut()?;
        loop {
            let drained = live.tap.pop_slice(&mut live.scratch);
            if drained == 0 {
                break;
            }
            live.analyzer.push_samples(&live.scratch[..drained]);
            if drained < live.scratch.len() {
                break;
            }
        }
        live.analyzer.analyze();
        Some(live.analyzer.magnitudes())
    }
}

/// One-shot tone playback, isolated from the keep-alive graph.
///
/// The stream lives entirely on a worker thread (cpal streams do not cross
/// threads); the caller blocks only until the stream is confirmed playing
/// or failed, not for the tone's duration. Strictly single-voice: a second
/// request while a tone is sounding is rejected.
pub struct ToneGraph {
    config: AudioConfig,
    playing: Arc<AtomicBool>,
}

impl ToneGraph {
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            playing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn play_test_tone(&self) -> Result<(), String> {
        if self.playing.swap(true, Ordering::SeqCst) {
            return Err("a tone is already playing".to_string());
        }

        let (ready_tx, ready_rx) = mpsc::channel();
        let config = self.config.clone();
        let playing = Arc::clone(&self.playing);

        thread::spawn(move || {
            run_tone_worker(&config, ready_tx);
            playing.store(false, Ordering::SeqCst);
        });

        match ready_rx.recv() {
            Ok(result) => result,
            Err(_) => Err("tone worker exited before reporting".to_string()),
        }
    }
}

/// Build, play and release the tone stream. Reports acquisition outcome on
/// `ready` before the tone rings out.
fn run_tone_worker(config: &AudioConfig, ready: mpsc::Sender<Result<(), String>>) {
    let built = (|| -> Result<cpal::Stream, String> {
        let device = get_default_output_device()?;
        let stream_config = get_supported_config(&device, config)?;
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;

        log::info!("Playing test tone: {} Hz", signals::TEST_TONE_FREQ_HZ);

        let buffer = signals::test_tone_buffer(sample_rate);
        let mut position = 0usize;

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        let sample = if position < buffer.len() {
                            let s = buffer[position];
                            position += 1;
                            s
                        } else {
                            0.0
                        };
                        for slot in frame.iter_mut() {
                            *slot = sample;
                        }
                    }
                },
                |err| log::error!("Test tone stream error: {}", err),
                None,
            )
            .map_err(|e| format!("Failed to build tone stream: {}", e))?;

        stream
            .play()
            .map_err(|e| format!("Failed to start tone stream: {}", e))?;

        Ok(stream)
    })();

    match built {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            // Let the buffer ring out, then release the stream.
            thread::sleep(Duration::from_millis(
                (signals::TEST_TONE_SECS * 1000.0) as u64 + 100,
            ));
            drop(stream);
            log::info!("Test tone complete");
        }
        Err(e) => {
            log::warn!("Test tone failed: {}", e);
            let _ = ready.send(Err(e));
        }
    }
}
