//! Disconnect siren
//!
//! A 1000 Hz square wave pulsed at ~1.5 Hz by flipping a smoothed gain
//! target between full scale and silence. The pulse runs on its own thread
//! behind a bounded stop channel, so `stop()` tears down the timer and the
//! stream deterministically - no pending pulse survives a stop.

use cpal::traits::{DeviceTrait, StreamTrait};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::device::{get_default_output_device, get_supported_config, AudioConfig};
use super::signals::{SquareOscillator, ALARM_FREQ_HZ};
use super::volume;

/// Gain target flip period.
pub const ALARM_PULSE_MS: u64 = 333;

/// Pulse edge smoothing time constant, in seconds. Short enough to sound
/// like a hard on/off, long enough to avoid full-scale clicks.
pub const ALARM_PULSE_RAMP_SECS: f32 = 0.01;

struct AlarmShared {
    target_gain: AtomicU32,
}

struct LiveAlarm {
    _stream: cpal::Stream,
    stop_tx: mpsc::SyncSender<()>,
    pulse_thread: Option<JoinHandle<()>>,
}

pub struct AlarmEngine {
    config: AudioConfig,
    live: Option<LiveAlarm>,
}

impl AlarmEngine {
    pub fn new(config: AudioConfig) -> Self {
        Self { config, live: None }
    }

    /// Start the siren at full gain and begin pulsing. Stop-first, so a
    /// repeated start never stacks oscillators.
    pub fn start(&mut self) -> Result<(), String> {
        self.stop();

        let device = get_default_output_device()?;
        let stream_config = get_supported_config(&device, &self.config)?;
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;

        log::info!("Starting alarm: {} Hz square, {} Hz out", ALARM_FREQ_HZ, sample_rate);

        let shared = Arc::new(AlarmShared {
            target_gain: AtomicU32::new(1.0f32.to_bits()),
        });

        let callback_shared = Arc::clone(&shared);
        let ramp = volume::smoothing_coefficient(ALARM_PULSE_RAMP_SECS, sample_rate);
        let mut osc = SquareOscillator::new(ALARM_FREQ_HZ, sample_rate);
        let mut current_gain = 0.0f32;

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        let target =
                            f32::from_bits(callback_shared.target_gain.load(Ordering::Relaxed));
                        current_gain += (target - current_gain) * ramp;
                        let out = osc.next_sample() * current_gain;
                        for slot in frame.iter_mut() {
                            *slot = out;
                        }
                    }
                },
                |err| log::error!("Alarm stream error: {}", err),
                None,
            )
            .map_err(|e| format!("Failed to build alarm stream: {}", e))?;

        stream
            .play()
            .map_err(|e| format!("Failed to start alarm stream: {}", e))?;

        let (stop_tx, stop_rx) = mpsc::sync_channel::<()>(1);
        let pulse_shared = Arc::clone(&shared);
        let pulse_thread = thread::spawn(move || {
            let mut is_high = true;
            loop {
                match stop_rx.recv_timeout(Duration::from_millis(ALARM_PULSE_MS)) {
                    Err(RecvTimeoutError::Timeout) => {
                        is_high = !is_high;
                        let target = if is_high { 1.0f32 } else { 0.0f32 };
                        pulse_shared
                            .target_gain
                            .store(target.to_bits(), Ordering::Relaxed);
                    }
                    // Stop requested or engine gone.
                    _ => break,
                }
            }
        });

        self.live = Some(LiveAlarm {
            _stream: stream,
            stop_tx,
            pulse_thread: Some(pulse_thread),
        });

        Ok(())
    }

    /// Cancel the pulse, join its thread and release the stream. Safe to
    /// call when already stopped.
    pub fn stop(&mut self) {
        if let Some(mut live) = self.live.take() {
            let _ = live.stop_tx.send(());
            if let Some(handle) = live.pulse_thread.take() {
                let _ = handle.join();
            }
            log::info!("Alarm stopped");
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }
}

impl Drop for AlarmEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
