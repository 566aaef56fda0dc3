//! Lock-free ring buffer for the analysis tap
//!
//! The keep-alive callback pushes its pre-gain mono samples here; the
//! control thread drains them on demand to feed the spectrum analyzer.
//! Pushes are best-effort: if nobody is polling the visualizer, samples are
//! dropped rather than blocking the audio thread.

use ringbuf::{traits::*, HeapRb};

/// Tap ring buffer, split into producer/consumer halves for the audio
/// callback and the control thread.
pub struct TapBuffer {
    producer: ringbuf::HeapProd<f32>,
    consumer: ringbuf::HeapCons<f32>,
}

impl TapBuffer {
    /// Create a new tap with the given capacity (in samples)
    pub fn new(capacity: usize) -> Self {
        let rb = HeapRb::new(capacity);
        let (producer, consumer) = rb.split();
        Self { producer, consumer }
    }

    pub fn split(self) -> (TapProducer, TapConsumer) {
        (
            TapProducer {
                inner: self.producer,
            },
            TapConsumer {
                inner: self.consumer,
            },
        )
    }
}

/// Producer side - owned by the audio callback
pub struct TapProducer {
    inner: ringbuf::HeapProd<f32>,
}

impl TapProducer {
    /// Push a sample, returns true if there was room
    pub fn push(&mut self, sample: f32) -> bool {
        self.inner.try_push(sample).is_ok()
    }

    /// Push multiple samples, returns number pushed
    pub fn push_slice(&mut self, samples: &[f32]) -> usize {
        self.inner.push_slice(samples)
    }
}

/// Consumer side - owned by the control thread
pub struct TapConsumer {
    inner: ringbuf::HeapCons<f32>,
}

impl TapConsumer {
    /// Pop up to `output.len()` samples, returns number popped
    pub fn pop_slice(&mut self, output: &mut [f32]) -> usize {
        self.inner.pop_slice(output)
    }

    /// Number of samples waiting to be read
    pub fn available(&self) -> usize {
        self.inner.occupied_len()
    }
}
