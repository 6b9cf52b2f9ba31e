//! FIR filtering: fixed-capacity tap sets, per-channel history and a
//! windowed-sinc low-pass designer.

use super::Effect;
use std::f32::consts::PI;

/// Upper bound on taps, so tap sets are `Copy` and never allocate
pub const MAX_FIR_TAPS: usize = 64;

/// Filter coefficients, stored inline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterTaps {
    coeffs: [f32; MAX_FIR_TAPS],
    len: usize,
}

impl Default for FilterTaps {
    fn default() -> Self {
        Self::identity()
    }
}

impl FilterTaps {
    /// Single unit tap: output equals input
    pub fn identity() -> Self {
        let mut coeffs = [0.0; MAX_FIR_TAPS];
        coeffs[0] = 1.0;
        Self { coeffs, len: 1 }
    }

    /// Copy taps from a slice. Returns `None` if empty, too long or non-finite.
    pub fn new(taps: &[f32]) -> Option<Self> {
        if taps.is_empty() || taps.len() > MAX_FIR_TAPS || !taps.iter().all(|t| t.is_finite()) {
            return None;
        }
        let mut coeffs = [0.0; MAX_FIR_TAPS];
        coeffs[..taps.len()].copy_from_slice(taps);
        Some(Self {
            coeffs,
            len: taps.len(),
        })
    }

    /// Design a linear-phase low-pass.
    ///
    /// `cutoff` is normalised to Nyquist. A cutoff of 1.0 or above gives
    /// [`FilterTaps::identity`]. Taps are Hamming-windowed sinc normalised to
    /// unity DC gain.
    pub fn lowpass(cutoff: f32, taps: usize) -> Self {
        let taps = taps.clamp(1, MAX_FIR_TAPS);
        if cutoff >= 1.0 || taps == 1 {
            return Self::identity();
        }
        let cutoff = cutoff.max(1e-4);
        let centre = (taps - 1) as f32 / 2.0;

        let mut coeffs = [0.0; MAX_FIR_TAPS];
        let mut sum = 0.0;
        for (n, c) in coeffs.iter_mut().take(taps).enumerate() {
            let x = n as f32 - centre;
            let sinc = if x.abs() < 1e-6 {
                1.0
            } else {
                (PI * cutoff * x).sin() / (PI * cutoff * x)
            };
            let window = 0.54 - 0.46 * (2.0 * PI * n as f32 / (taps - 1) as f32).cos();
            *c = cutoff * sinc * window;
            sum += *c;
        }
        if sum.abs() > 1e-9 {
            for c in coeffs.iter_mut().take(taps) {
                *c /= sum;
            }
        }
        Self { coeffs, len: taps }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.coeffs[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_identity(&self) -> bool {
        self.len == 1 && self.coeffs[0] == 1.0
    }
}

/// Single-channel FIR history
#[derive(Debug, Clone)]
pub struct FirState {
    history: [f32; MAX_FIR_TAPS],
    pos: usize,
}

impl Default for FirState {
    fn default() -> Self {
        Self {
            history: [0.0; MAX_FIR_TAPS],
            pos: 0,
        }
    }
}

impl FirState {
    /// Push one sample and return the filtered output
    #[inline]
    pub fn process(&mut self, taps: &FilterTaps, input: f32) -> f32 {
        self.history[self.pos] = input;
        let mut acc = 0.0;
        let mut idx = self.pos;
        for &c in taps.as_slice() {
            acc += c * self.history[idx];
            idx = if idx == 0 { MAX_FIR_TAPS - 1 } else { idx - 1 };
        }
        self.pos = (self.pos + 1) % MAX_FIR_TAPS;
        acc
    }

    pub fn reset(&mut self) {
        self.history = [0.0; MAX_FIR_TAPS];
        self.pos = 0;
    }
}

/// Multi-channel FIR over interleaved audio
pub struct FirFilter {
    taps: FilterTaps,
    states: Vec<FirState>,
}

impl FirFilter {
    pub fn new(channels: usize) -> Self {
        Self {
            taps: FilterTaps::identity(),
            states: vec![FirState::default(); channels.max(1)],
        }
    }

    /// Replace coefficients, keeping history so the change is continuous
    pub fn set_taps(&mut self, taps: FilterTaps) {
        self.taps = taps;
    }

    pub fn taps(&self) -> &FilterTaps {
        &self.taps
    }
}

impl Effect for FirFilter {
    fn process(&mut self, samples: &mut [f32]) {
        // History still has to follow the input so a later cutoff change is smooth
        let bypass = self.taps.is_identity();
        let ch_count = self.states.len();
        for frame in samples.chunks_exact_mut(ch_count) {
            for (sample, state) in frame.iter_mut().zip(self.states.iter_mut()) {
                let y = state.process(&self.taps, *sample);
                if !bypass {
                    *sample = y;
                }
            }
        }
    }

    fn reset(&mut self) {
        for state in &mut self.states {
            state.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn test_identity_passes_through() {
        let taps = FilterTaps::identity();
        let mut state = FirState::default();
        for x in [0.5, -0.25, 1.0] {
            assert_eq!(state.process(&taps, x), x);
        }
    }

    #[test]
    fn test_cutoff_one_bypasses() {
        assert!(FilterTaps::lowpass(1.0, 33).is_identity());
    }

    #[test]
    fn test_lowpass_unity_dc_gain() {
        let taps = FilterTaps::lowpass(0.25, 33);
        assert_eq!(taps.len(), 33);
        let sum: f32 = taps.as_slice().iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_lowpass_attenuates_high_frequencies() {
        let taps = FilterTaps::lowpass(0.1, 63);
        let mut low = FirState::default();
        let mut high = FirState::default();

        // 0.02 and 0.5 of Nyquist at 44.1k
        let low_in = sine(441.0, 44100.0, 4096);
        let high_in = sine(11025.0, 44100.0, 4096);
        let low_out: Vec<f32> = low_in.iter().map(|&x| low.process(&taps, x)).collect();
        let high_out: Vec<f32> = high_in.iter().map(|&x| high.process(&taps, x)).collect();

        assert!(rms(&low_out[256..]) > 0.6);
        assert!(rms(&high_out[256..]) < 0.05);
    }

    #[test]
    fn test_rejects_invalid_taps() {
        assert!(FilterTaps::new(&[]).is_none());
        assert!(FilterTaps::new(&[0.0; MAX_FIR_TAPS + 1]).is_none());
        assert!(FilterTaps::new(&[f32::NAN]).is_none());
        assert_eq!(FilterTaps::new(&[0.5, 0.5]).map(|t| t.len()), Some(2));
    }

    #[test]
    fn test_interleaved_filter_keeps_channels_apart() {
        let mut filter = FirFilter::new(2);
        filter.set_taps(FilterTaps::new(&[0.5, 0.5]).unwrap());
        let mut samples = [1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        filter.process(&mut samples);
        assert_eq!(samples, [0.5, 0.0, 1.0, 0.0, 1.0, 0.0]);
    }
}
