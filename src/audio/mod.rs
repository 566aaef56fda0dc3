//! Audio engine for the keep-alive session
//!
//! Provides the signal path that holds a wired output route open:
//! - Pink-noise keep-alive generation with exponential volume mapping
//! - Independent one-shot test tones and the pulsing disconnect siren
//! - Output route watching (device enumeration + stream liveness)
//! - Spectrum analysis for the signal visualizer

pub mod alarm;
pub mod buffer;
pub mod device;
pub mod engine;
pub mod route;
pub mod signals;
pub mod spectrum;
pub mod volume;
