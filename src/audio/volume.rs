//! Power-level to gain mapping for the keep-alive signal
//!
//! The user-facing "power" level is an integer in 1-100; the physical gain
//! follows an exponential curve spanning roughly 1e-5 to 1e-2 so the signal
//! stays below audibility at low settings while never reaching true silence
//! (hardware sleep detection keys on silence, not loudness).

/// Lowest gain on the curve, reached at level 1.
const GAIN_FLOOR: f32 = 0.00001;

/// Curve span: level 100 maps to `GAIN_FLOOR * 1000` = 0.01.
const GAIN_SPAN: f32 = 1000.0;

/// Smoothing time constant for live volume changes, in seconds.
pub const VOLUME_RAMP_SECS: f32 = 0.1;

/// Convert a power level to a physical gain value.
///
/// Levels outside 0-100 are clamped before evaluation. Level 0 maps to
/// exactly 0.0; levels 1-100 follow `GAIN_FLOOR * GAIN_SPAN^(level/100)`,
/// which is strictly increasing.
pub fn gain_for_level(level: u8) -> f32 {
    let level = level.min(100);
    if level == 0 {
        return 0.0;
    }
    GAIN_FLOOR * GAIN_SPAN.powf(level as f32 / 100.0)
}

/// Per-sample coefficient for a one-pole ramp toward a gain target.
///
/// `current += (target - current) * coeff` each sample approaches the target
/// exponentially with the given time constant, matching the ramp behavior
/// the front end expects from volume changes.
pub fn smoothing_coefficient(time_constant_secs: f32, sample_rate: u32) -> f32 {
    if time_constant_secs <= 0.0 || sample_rate == 0 {
        return 1.0;
    }
    1.0 - (-1.0 / (time_constant_secs * sample_rate as f32)).exp()
}
