//! Per-track effects: FIR low-pass and feedback delay

mod delay;
mod filter;

pub use delay::DelayLine;
pub use filter::{FilterTaps, FirFilter, FirState, MAX_FIR_TAPS};

/// Trait for audio effects
pub trait Effect: Send {
    /// Process audio samples in place (interleaved)
    fn process(&mut self, samples: &mut [f32]);

    /// Reset effect state
    fn reset(&mut self);
}
