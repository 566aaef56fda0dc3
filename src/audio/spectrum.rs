//! Spectrum analysis for the signal visualizer
//!
//! A small fixed-size FFT over the most recent tap samples, folded into
//! log-spaced bands. Sized for a UI meter, not for measurement: 256-point
//! window, 32 bands, magnitudes normalized to 0..1.

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use std::f32::consts::PI;
use std::sync::Arc;

/// FFT window length in samples.
pub const FFT_SIZE: usize = 256;

/// Number of log-spaced output bands.
pub const NUM_BANDS: usize = 32;

pub struct SpectrumAnalyzer {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    history: Vec<f32>,
    input: Vec<f32>,
    output: Vec<Complex<f32>>,
    band_edges: Vec<usize>,
    bands: [f32; NUM_BANDS],
}

impl SpectrumAnalyzer {
    pub fn new(_sample_rate: u32) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        let input = fft.make_input_vec();
        let output = fft.make_output_vec();

        // Hann window
        let window: Vec<f32> = (0..FFT_SIZE)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / (FFT_SIZE - 1) as f32).cos()))
            .collect();

        // Log-spaced band edges over bins 1..=FFT_SIZE/2, at least one bin
        // per band.
        let max_bin = FFT_SIZE / 2;
        let mut band_edges = Vec::with_capacity(NUM_BANDS + 1);
        band_edges.push(1usize);
        for band in 1..=NUM_BANDS {
            let edge = (max_bin as f32).powf(band as f32 / NUM_BANDS as f32).round() as usize;
            let previous = *band_edges.last().unwrap_or(&1);
            band_edges.push(edge.max(previous + 1).min(max_bin + 1));
        }

        Self {
            fft,
            window,
            history: vec![0.0; FFT_SIZE],
            input,
            output,
            band_edges,
            bands: [0.0; NUM_BANDS],
        }
    }

    /// Append tap samples, keeping the most recent window.
    pub fn push_samples(&mut self, samples: &[f32]) {
        if samples.len() >= FFT_SIZE {
            self.history
                .copy_from_slice(&samples[samples.len() - FFT_SIZE..]);
            return;
        }
        let keep = FFT_SIZE - samples.len();
        self.history.copy_within(samples.len().., 0);
        self.history[keep..].copy_from_slice(samples);
    }

    /// Run the FFT over the current window and refresh the band magnitudes.
    pub fn analyze(&mut self) {
        for (dst, (&sample, &win)) in self
            .input
            .iter_mut()
            .zip(self.history.iter().zip(self.window.iter()))
        {
            *dst = sample * win;
        }

        if self.fft.process(&mut self.input, &mut self.output).is_err() {
            // Lengths are fixed at construction; this cannot happen live.
            return;
        }

        // Hann coherent gain is 0.5, so a full-scale sine peaks at
        // FFT_SIZE/4 in bin magnitude.
        let norm = 4.0 / FFT_SIZE as f32;
        for band in 0..NUM_BANDS {
            let lo = self.band_edges[band];
            let hi = self.band_edges[band + 1];
            let mut peak = 0.0f32;
            for bin in lo..hi {
                peak = peak.max(self.output[bin].norm());
            }
            self.bands[band] = (peak * norm).clamp(0.0, 1.0);
        }
    }

    /// Band magnitudes from the last `analyze` call (0.0 - 1.0)
    pub fn magnitudes(&self) -> [f32; NUM_BANDS] {
        self.bands
    }

    /// Band index a given FFT bin falls into.
    #[cfg(test)]
    fn band_for_bin(&self, bin: usize) -> usize {
        for band in 0..NUM_BANDS {
            if bin < self.band_edges[band + 1] {
                return band;
            }
        }
        NUM_BANDS - 1
    }
}
