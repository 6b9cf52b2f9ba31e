//! Time stretching for source playback.
//!
//! Two read modes share one calling convention (fill a block from a source
//! channel at a rate, continuing from a cursor):
//!
//! - **Phase vocoder** keeps pitch while the rate changes. See [`phase`].
//! - **Varispeed** reads with linear interpolation, so pitch follows rate the
//!   way tape does.
//!
//! # Usage
//!
//! ```rust,ignore
//! use looper_audio::timestretcher::PhaseVocoder;
//!
//! let mut pv = PhaseVocoder::new(2048, 4, 1e-3);
//! let mut state = pv.new_state();
//! state.seek(0.0);
//! pv.render(&mut state, &samples, 1.25, &mut block);
//! ```

mod phase;
mod stft;

pub use phase::{wrap_phase, PhaseVocoder, PhaseVocoderState};
pub use stft::{bin_omegas, hann_window, Stft};

/// Linear-interpolation reader. Rate changes shift pitch.
#[derive(Debug, Clone, Default)]
pub struct Varispeed {
    position: f64,
}

impl Varispeed {
    pub fn seek(&mut self, position: f64) {
        self.position = position;
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    /// Fill `out` from `samples` starting at the cursor, stepping by `rate`.
    /// Reads outside the data are silence.
    pub fn render(&mut self, samples: &[f32], rate: f64, out: &mut [f32]) {
        let len = samples.len() as i64;
        for y in out.iter_mut() {
            let base = self.position.floor();
            let frac = (self.position - base) as f32;
            let i = base as i64;
            let at = |idx: i64| {
                if idx >= 0 && idx < len {
                    samples[idx as usize]
                } else {
                    0.0
                }
            };
            let a = at(i);
            let b = at(i + 1);
            *y = a + (b - a) * frac;
            self.position += rate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varispeed_unity_is_copy() {
        let samples: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let mut vs = Varispeed::default();
        vs.seek(3.0);
        let mut out = [0.0; 4];
        vs.render(&samples, 1.0, &mut out);
        assert_eq!(out, [3.0, 4.0, 5.0, 6.0]);
        assert_eq!(vs.position(), 7.0);
    }

    #[test]
    fn test_varispeed_interpolates() {
        let samples = [0.0, 1.0, 2.0, 3.0];
        let mut vs = Varispeed::default();
        let mut out = [0.0; 4];
        vs.render(&samples, 0.5, &mut out);
        assert_eq!(out, [0.0, 0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_varispeed_past_end_is_silent() {
        let samples = [1.0; 4];
        let mut vs = Varispeed::default();
        vs.seek(10.0);
        let mut out = [9.0; 3];
        vs.render(&samples, 2.0, &mut out);
        assert_eq!(out, [0.0; 3]);
    }
}
