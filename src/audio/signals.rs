//! Signal generation for the keep-alive engine
//!
//! Three sources, all single-channel:
//! - a looped pink-noise buffer that keeps the output route awake
//! - a short sine burst for user-triggered output self-tests
//! - a square-wave oscillator driving the disconnect siren
//!
//! Buffer rendering is pure (no audio side effects) so the spectral and
//! amplitude properties can be tested in isolation.

use rand::Rng;
use std::f32::consts::PI;

/// Length of the looped keep-alive buffer, in seconds.
pub const KEEPALIVE_BUFFER_SECS: u32 = 2;

/// Self-test tone parameters.
pub const TEST_TONE_FREQ_HZ: f32 = 800.0;
pub const TEST_TONE_SECS: f32 = 1.0;
pub const TEST_TONE_AMPLITUDE: f32 = 0.3;

/// Siren oscillator frequency.
pub const ALARM_FREQ_HZ: f32 = 1000.0;

/// Six-pole pink-noise filter (Paul Kellet's economy recurrence).
///
/// Feeding uniform white noise through `next` yields noise whose power
/// density falls off ~3 dB per octave - broadband enough to register as
/// program material to output hardware, perceptually soft at low gain.
#[derive(Debug, Clone, Default)]
pub struct PinkNoise {
    b0: f32,
    b1: f32,
    b2: f32,
    b3: f32,
    b4: f32,
    b5: f32,
    b6: f32,
}

impl PinkNoise {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter one white-noise sample (expected range -1..1) into pink.
    pub fn next(&mut self, white: f32) -> f32 {
        self.b0 = 0.99886 * self.b0 + white * 0.0555179;
        self.b1 = 0.99332 * self.b1 + white * 0.0750759;
        self.b2 = 0.96900 * self.b2 + white * 0.1538520;
        self.b3 = 0.86650 * self.b3 + white * 0.3104856;
        self.b4 = 0.55000 * self.b4 + white * 0.5329522;
        self.b5 = -0.7616 * self.b5 - white * 0.0168980;
        let sample =
            (self.b0 + self.b1 + self.b2 + self.b3 + self.b4 + self.b5 + self.b6 + white * 0.5362)
                * 0.11;
        self.b6 = white * 0.115926;
        sample
    }
}

/// Render the looped keep-alive buffer: 2 seconds of mono pink noise at the
/// given sample rate. The loop seam is not crossfaded; at keep-alive gain
/// levels the discontinuity is orders of magnitude below audibility.
pub fn keepalive_buffer(sample_rate: u32) -> Vec<f32> {
    let len = (sample_rate * KEEPALIVE_BUFFER_SECS) as usize;
    let mut rng = rand::thread_rng();
    let mut pink = PinkNoise::new();
    let mut buffer = Vec::with_capacity(len);
    for _ in 0..len {
        let white: f32 = rng.gen_range(-1.0..1.0);
        buffer.push(pink.next(white));
    }
    buffer
}

/// Render the self-test burst: 800 Hz sine, 1 second, fixed amplitude.
pub fn test_tone_buffer(sample_rate: u32) -> Vec<f32> {
    let len = (sample_rate as f32 * TEST_TONE_SECS) as usize;
    let mut buffer = Vec::with_capacity(len);
    for i in 0..len {
        let t = i as f32 / sample_rate as f32;
        buffer.push((2.0 * PI * TEST_TONE_FREQ_HZ * t).sin() * TEST_TONE_AMPLITUDE);
    }
    buffer
}

/// Full-scale square-wave oscillator for the siren.
///
/// Unlike a preview signal there is no softening here - the alarm is meant
/// to be heard across a room.
pub struct SquareOscillator {
    phase: f32,
    increment: f32,
}

impl SquareOscillator {
    pub fn new(frequency: f32, sample_rate: u32) -> Self {
        Self {
            phase: 0.0,
            increment: frequency / sample_rate as f32,
        }
    }

    pub fn next_sample(&mut self) -> f32 {
        let sample = if self.phase < 0.5 { 1.0 } else { -1.0 };
        self.phase += self.increment;
        if self.phase >= 1.0 {
            self.phase -= 1.0;
        }
        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_buffer_duration() {
        let buffer = keepalive_buffer(44100);
        assert_eq!(buffer.len(), 44100 * 2);
    }

    #[test]
    fn keepalive_buffer_bounded_and_centered() {
        let buffer = keepalive_buffer(44100);
        let mut sum = 0.0f64;
        for &sample in &buffer {
            assert!(sample.abs() <= 1.2, "sample {} out of range", sample);
            sum += sample as f64;
        }
        let mean = sum / buffer.len() as f64;
        assert!(mean.abs() < 0.05, "mean {} too far from zero", mean);
    }

    #[test]
    fn pink_filter_attenuates_toward_high_frequencies() {
        // Crude spectral check without an FFT: for equal-power signals,
        // adjacent-sample difference variance is ~2x the variance for white
        // noise but much lower for pink, whose energy sits in slow
        // components.
        let buffer = keepalive_buffer(44100);
        let mean = buffer.iter().sum::<f32>() / buffer.len() as f32;
        let variance: f32 =
            buffer.iter().map(|s| (s - mean) * (s - mean)).sum::<f32>() / buffer.len() as f32;
        let diff_variance: f32 = buffer
            .windows(2)
            .map(|w| (w[1] - w[0]) * (w[1] - w[0]))
            .sum::<f32>()
            / (buffer.len() - 1) as f32;
        assert!(
            diff_variance < 1.5 * variance,
            "difference variance {} vs variance {} looks white, not pink",
            diff_variance,
            variance
        );
    }

    #[test]
    fn test_tone_duration_and_amplitude() {
        let buffer = test_tone_buffer(48000);
        assert_eq!(buffer.len(), 48000);
        let peak = buffer.iter().fold(0.0f32, |max, s| max.max(s.abs()));
        assert!(peak <= TEST_TONE_AMPLITUDE + 1e-6);
        assert!(peak > TEST_TONE_AMPLITUDE * 0.99);
    }

    #[test]
    fn test_tone_frequency() {
        let buffer = test_tone_buffer(48000);
        let crossings = buffer
            .windows(2)
            .filter(|w| (w[0] < 0.0) != (w[1] < 0.0))
            .count();
        // An 800 Hz sine crosses zero 1600 times per second.
        assert!(
            (crossings as i64 - 1600).abs() <= 2,
            "unexpected crossing count {}",
            crossings
        );
    }

    #[test]
    fn square_oscillator_is_full_scale() {
        let mut osc = SquareOscillator::new(ALARM_FREQ_HZ, 44100);
        let mut highs = 0usize;
        let mut lows = 0usize;
        for _ in 0..44100 {
            let sample = osc.next_sample();
            assert!(sample == 1.0 || sample == -1.0);
            if sample > 0.0 {
                highs += 1;
            } else {
                lows += 1;
            }
        }
        // Duty cycle close to 50%.
        let ratio = highs as f32 / (highs + lows) as f32;
        assert!((ratio - 0.5).abs() < 0.02, "duty cycle {}", ratio);
    }
}
