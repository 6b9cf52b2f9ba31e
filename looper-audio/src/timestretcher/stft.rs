//! Windowed FFT analysis and overlap-add synthesis on top of rustfft.
//!
//! All buffers and FFT plans are created up front. `analyze` and `synthesize`
//! never allocate.

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

/// Periodic Hann window of `size` samples
pub fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / size as f32).cos())
        .collect()
}

/// Expected phase advance per hop for each bin: `2π k H / W`
pub fn bin_omegas(size: usize, hop: usize) -> Vec<f32> {
    (0..=size / 2)
        .map(|k| 2.0 * PI * k as f32 * hop as f32 / size as f32)
        .collect()
}

/// Short-Time Fourier Transform processor
pub struct Stft {
    size: usize,
    hop: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    /// Analysis and synthesis window (same Hann for both)
    window: Vec<f32>,
    /// Bin advance per hop
    omega: Vec<f32>,
    work: Vec<Complex32>,
    scratch: Vec<Complex32>,
    /// 1 / (W · Σ w²) so a rate-1 round trip has unity gain
    synth_scale: f32,
}

impl Stft {
    /// Create processor for window `size` (power of two) and `overlap` frames per window
    pub fn new(size: usize, overlap: usize) -> Self {
        let hop = (size / overlap.max(1)).max(1);
        let mut planner = FftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        let window = hann_window(size);
        let ola_gain: f32 = (0..size)
            .step_by(hop)
            .map(|n| window[n] * window[n])
            .sum();

        Self {
            size,
            hop,
            forward,
            inverse,
            omega: bin_omegas(size, hop),
            window,
            work: vec![Complex32::new(0.0, 0.0); size],
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
            synth_scale: 1.0 / (size as f32 * ola_gain.max(1e-6)),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn hop_size(&self) -> usize {
        self.hop
    }

    /// Number of positive frequency bins (size/2 + 1)
    #[inline]
    pub fn num_bins(&self) -> usize {
        self.size / 2 + 1
    }

    #[inline]
    pub fn omega(&self) -> &[f32] {
        &self.omega
    }

    /// Window `samples[start..start + W]` and transform it into `output`.
    ///
    /// Indices outside `samples` read as silence, so frames may hang over
    /// either end of the data.
    pub fn analyze(&mut self, samples: &[f32], start: i64, output: &mut [Complex32]) {
        debug_assert!(output.len() >= self.num_bins());

        for (i, slot) in self.work.iter_mut().enumerate() {
            let idx = start + i as i64;
            let x = if idx >= 0 && (idx as usize) < samples.len() {
                samples[idx as usize]
            } else {
                0.0
            };
            *slot = Complex32::new(x * self.window[i], 0.0);
        }

        self.forward
            .process_with_scratch(&mut self.work, &mut self.scratch);

        let bins = self.num_bins();
        output[..bins].copy_from_slice(&self.work[..bins]);
    }

    /// Inverse transform `input` and overlap-add the windowed frame into `accum`
    pub fn synthesize(&mut self, input: &[Complex32], accum: &mut [f32]) {
        debug_assert!(input.len() >= self.num_bins());
        debug_assert!(accum.len() >= self.size);

        // Reconstruct full spectrum from positive frequencies (Hermitian symmetry)
        let bins = self.num_bins();
        self.work[..bins].copy_from_slice(&input[..bins]);
        for i in 1..self.size / 2 {
            self.work[self.size - i] = input[i].conj();
        }

        self.inverse
            .process_with_scratch(&mut self.work, &mut self.scratch);

        for ((acc, w), bin) in accum.iter_mut().zip(&self.window).zip(&self.work) {
            *acc += bin.re * w * self.synth_scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hann_overlap_gain() {
        let stft = Stft::new(1024, 4);
        assert_eq!(stft.hop_size(), 256);
        // Σ w² over four hops of a periodic Hann is 1.5
        assert!((stft.synth_scale * 1024.0 * 1.5 - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_analyze_finds_bin() {
        let size = 1024;
        let mut stft = Stft::new(size, 4);
        // Exactly bin 32
        let samples: Vec<f32> = (0..size)
            .map(|i| (2.0 * PI * 32.0 * i as f32 / size as f32).sin())
            .collect();
        let mut spectrum = vec![Complex32::new(0.0, 0.0); stft.num_bins()];
        stft.analyze(&samples, 0, &mut spectrum);

        let peak = spectrum
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.norm().total_cmp(&b.1.norm()))
            .map(|(k, _)| k);
        assert_eq!(peak, Some(32));
    }

    #[test]
    fn test_out_of_range_reads_silence() {
        let mut stft = Stft::new(64, 4);
        let mut spectrum = vec![Complex32::new(1.0, 1.0); stft.num_bins()];
        stft.analyze(&[1.0; 8], 100, &mut spectrum);
        assert!(spectrum.iter().all(|c| c.norm() == 0.0));
    }

    #[test]
    fn test_overlap_add_reconstructs() {
        let size = 256;
        let hop = 64;
        let mut stft = Stft::new(size, 4);
        let samples: Vec<f32> = (0..4096).map(|i| (i as f32 * 0.05).sin()).collect();
        let mut spectrum = vec![Complex32::new(0.0, 0.0); stft.num_bins()];
        let mut accum = vec![0.0; samples.len() + size];

        let mut start = 0;
        while start + size <= accum.len() {
            stft.analyze(&samples, start as i64, &mut spectrum);
            stft.synthesize(&spectrum, &mut accum[start..start + size]);
            start += hop;
        }

        // Fully overlapped region
        for i in size..samples.len() - size {
            assert!((accum[i] - samples[i]).abs() < 1e-3, "sample {i}");
        }
    }
}
