//! Phase vocoder: pitch-preserving random-access time stretching.
//!
//! Analysis frames sit on a fixed grid of hop `H` in source time, anchored at
//! the position the voice was last seeked to. Each synthesis hop reads the
//! grid at `position / H`, interpolates magnitude and instantaneous frequency
//! between the surrounding frames, advances a per-bin synthesis phase and
//! overlap-adds the result. `position` then moves by `rate * H`, so rate > 1
//! plays faster at the same pitch.
//!
//! The heavy parts (FFT plans, window, scratch) live in [`PhaseVocoder`], which
//! the render thread owns once. Everything that must persist between calls for
//! one playing voice lives in [`PhaseVocoderState`].

use super::stft::Stft;
use crate::ringbuffer::RingBuffer;
use rustfft::num_complex::Complex32;
use std::f32::consts::PI;

const TWO_PI: f32 = 2.0 * PI;

/// Per (voice, channel) vocoder memory
pub struct PhaseVocoderState {
    last: Vec<Complex32>,
    current: Vec<Complex32>,
    next: Vec<Complex32>,
    /// Synthesis phase per bin
    phase: Vec<f32>,
    /// Overlap-add accumulator, one window long
    overlap: Vec<f32>,
    /// Synthesised samples not yet handed out
    output: RingBuffer,
    /// Source position of analysis grid frame 0
    origin: f64,
    /// Source position of the next synthesis hop
    position: f64,
    /// Grid index held in `current`
    frame: Option<i64>,
    /// False until the first hop after a seek has set the phases
    tracking: bool,
    needs_prime: bool,
}

impl PhaseVocoderState {
    pub fn new(window: usize, hop: usize) -> Self {
        let bins = window / 2 + 1;
        Self {
            last: vec![Complex32::new(0.0, 0.0); bins],
            current: vec![Complex32::new(0.0, 0.0); bins],
            next: vec![Complex32::new(0.0, 0.0); bins],
            phase: vec![0.0; bins],
            overlap: vec![0.0; window],
            output: RingBuffer::new(1, hop),
            origin: 0.0,
            position: 0.0,
            frame: None,
            tracking: false,
            needs_prime: true,
        }
    }

    /// Jump to `position`. The next render starts cold from there.
    pub fn seek(&mut self, position: f64) {
        self.position = position;
        self.origin = position;
        self.frame = None;
        self.tracking = false;
        self.needs_prime = true;
        self.overlap.fill(0.0);
        self.output.clear();
    }

    /// Source position of the next synthesis hop
    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn window_size(&self) -> usize {
        self.overlap.len()
    }
}

/// Shared vocoder processor: FFT plans, windows and scratch
pub struct PhaseVocoder {
    stft: Stft,
    /// Magnitude below which a bin's phase is not tracked
    abstol: f32,
    synth: Vec<Complex32>,
}

impl PhaseVocoder {
    pub fn new(window: usize, overlap: usize, abstol: f32) -> Self {
        let stft = Stft::new(window, overlap);
        let bins = stft.num_bins();
        Self {
            stft,
            abstol,
            synth: vec![Complex32::new(0.0, 0.0); bins],
        }
    }

    pub fn window_size(&self) -> usize {
        self.stft.size()
    }

    pub fn hop_size(&self) -> usize {
        self.stft.hop_size()
    }

    pub fn overlap(&self) -> usize {
        self.stft.size() / self.stft.hop_size()
    }

    /// Fresh state sized for this vocoder
    pub fn new_state(&self) -> PhaseVocoderState {
        PhaseVocoderState::new(self.stft.size(), self.stft.hop_size())
    }

    /// Fill `out` with samples of `samples` played at `rate`, continuing from
    /// where `state` left off.
    pub fn render(
        &mut self,
        state: &mut PhaseVocoderState,
        samples: &[f32],
        rate: f64,
        out: &mut [f32],
    ) {
        if state.needs_prime {
            self.prime(state, samples, rate);
        }

        let mut written = 0;
        while written < out.len() {
            if state.output.is_empty() {
                self.synthesize_hop(state, samples, rate);
            }
            written += state.output.read(&mut out[written..]);
        }
    }

    /// Run the hops that lead up to the seek position so the first audible
    /// hop is fully overlapped.
    fn prime(&mut self, state: &mut PhaseVocoderState, samples: &[f32], rate: f64) {
        let lead = (self.overlap() - 1) as f64 * self.hop_size() as f64 * rate;
        state.position -= lead;
        state.origin = state.position;
        for _ in 1..self.overlap() {
            self.synthesize_hop(state, samples, rate);
        }
        state.output.clear();
        state.needs_prime = false;
    }

    fn synthesize_hop(&mut self, state: &mut PhaseVocoderState, samples: &[f32], rate: f64) {
        let hop = self.hop_size();
        let rel = (state.position - state.origin) / hop as f64;
        let j = rel.floor() as i64;
        let frac = (rel - j as f64) as f32;

        self.load_frames(state, samples, j);

        let omega = self.stft.omega();
        for k in 0..self.synth.len() {
            let cur = state.current[k];
            let next = state.next[k];
            let cur_mag = cur.norm();
            let mag = cur_mag + (next.norm() - cur_mag) * frac;

            if !state.tracking || mag < self.abstol {
                state.phase[k] = cur.arg();
            } else {
                let cur_arg = cur.arg();
                let d_prev = omega[k] + wrap_phase(cur_arg - state.last[k].arg() - omega[k]);
                let d_next = omega[k] + wrap_phase(next.arg() - cur_arg - omega[k]);
                let delta = d_prev + (d_next - d_prev) * frac;
                state.phase[k] = wrap_phase(state.phase[k] + delta);
            }
            self.synth[k] = Complex32::from_polar(mag, state.phase[k]);
        }

        self.stft.synthesize(&self.synth, &mut state.overlap);

        state.output.write(&state.overlap[..hop]);
        state.overlap.copy_within(hop.., 0);
        let window = state.overlap.len();
        state.overlap[window - hop..].fill(0.0);

        state.position += rate * hop as f64;
        state.tracking = true;
    }

    /// Make `last`, `current` and `next` hold grid frames j-1, j and j+1
    fn load_frames(&mut self, state: &mut PhaseVocoderState, samples: &[f32], j: i64) {
        let hop = self.hop_size() as f64;
        let start = |index: i64| (state.origin + index as f64 * hop).round() as i64;

        match state.frame {
            Some(f) if f == j => {}
            Some(f) if f + 1 == j => {
                std::mem::swap(&mut state.last, &mut state.current);
                std::mem::swap(&mut state.current, &mut state.next);
                let at = start(j + 1);
                self.stft.analyze(samples, at, &mut state.next);
            }
            _ => {
                let (a, b, c) = (start(j - 1), start(j), start(j + 1));
                self.stft.analyze(samples, a, &mut state.last);
                self.stft.analyze(samples, b, &mut state.current);
                self.stft.analyze(samples, c, &mut state.next);
            }
        }
        state.frame = Some(j);
    }
}

/// Wrap phase to [-π, π]
#[inline(always)]
pub fn wrap_phase(phase: f32) -> f32 {
    let p = phase - TWO_PI * (phase / TWO_PI).round();
    p.clamp(-PI, PI)
}
