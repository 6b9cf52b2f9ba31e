//! Global transport and master bus

use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Global transport state, owned by the render side
#[derive(Debug, Clone, PartialEq)]
pub struct Playback {
    /// Seconds of transport time rendered while playing
    pub time: f64,
    pub playing: bool,
    /// Frames per render tick
    pub period: usize,
    /// Master volume
    pub volume: f32,
    /// Peak absolute output since the host last read it
    pub max_level: f32,
    /// Loop cycle length. Non-aperiodic tracks stretch each chunk to fit it.
    pub cycle_frames: Option<usize>,
}

impl Playback {
    pub fn new(period: usize) -> Self {
        Self {
            time: 0.0,
            playing: true,
            period,
            volume: 1.0,
            max_level: 0.0,
            cycle_frames: None,
        }
    }

    pub fn apply(&mut self, update: &TransportUpdate) {
        if let Some(playing) = update.playing {
            self.playing = playing;
        }
        if let Some(volume) = update.volume {
            self.volume = volume;
        }
        if let Some(cycle) = update.cycle_frames {
            self.cycle_frames = cycle;
        }
    }
}

/// Partial transport change. `None` fields are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportUpdate {
    pub playing: Option<bool>,
    pub volume: Option<f32>,
    /// `Some(None)` clears the cycle
    pub cycle_frames: Option<Option<usize>>,
    /// Route the preview bus into the main output
    pub previewing: Option<bool>,
}

/// Transport telemetry published by the render side
#[derive(Debug, Default)]
pub struct TransportShared {
    time: AtomicU64,
    ticks: AtomicU64,
    peak: AtomicU32,
    playing: AtomicBool,
}

impl TransportShared {
    pub fn publish(&self, playback: &Playback, ticks: u64) {
        self.time.store(playback.time.to_bits(), Ordering::Relaxed);
        self.ticks.store(ticks, Ordering::Release);
        self.playing.store(playback.playing, Ordering::Relaxed);
    }

    /// Raise the stored peak to `level` if higher
    pub fn raise_peak(&self, level: f32) {
        // Non-negative floats order the same as their bit patterns
        self.peak.fetch_max(level.max(0.0).to_bits(), Ordering::Relaxed);
    }

    pub fn time(&self) -> f64 {
        f64::from_bits(self.time.load(Ordering::Relaxed))
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    /// Read and reset the peak meter
    pub fn take_peak(&self) -> f32 {
        f32::from_bits(self.peak.swap(0, Ordering::Relaxed))
    }
}

/// Raised-cosine fade-in of `len` samples.
///
/// `taper[i] + taper[len - 1 - i] == 1`, so a fade-out built from the same
/// table mirrors it exactly.
pub fn crossfade_taper(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| 0.5 - 0.5 * (PI * (i as f32 + 0.5) / len as f32).cos())
        .collect()
}

/// Master volume, optional soft clipper and peak meter
pub struct MasterBus {
    volume: f32,
    smoothed_volume: f32,
    clip: bool,
}

impl MasterBus {
    /// Volume smoothing coefficient
    const VOLUME_SMOOTH_COEFF: f32 = 0.999;

    pub fn new(volume: f32, clip: bool) -> Self {
        Self {
            volume,
            smoothed_volume: volume,
            clip,
        }
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
    }

    /// Apply gain, and clipping when enabled, in place. Returns the block's peak.
    pub fn process(&mut self, samples: &mut [f32], channels: usize) -> f32 {
        let mut peak = 0.0f32;
        for frame in samples.chunks_exact_mut(channels.max(1)) {
            self.smoothed_volume = Self::VOLUME_SMOOTH_COEFF * self.smoothed_volume
                + (1.0 - Self::VOLUME_SMOOTH_COEFF) * self.volume;
            for sample in frame.iter_mut() {
                *sample *= self.smoothed_volume;
                if self.clip {
                    *sample = soft_clip(*sample);
                }
                peak = peak.max(sample.abs());
            }
        }
        peak
    }
}

/// Soft clip threshold - below this, signal passes unchanged
const SOFT_CLIP_THRESHOLD: f32 = 0.75;
/// Soft clip ceiling
const SOFT_CLIP_CEILING: f32 = 0.89;

/// Gentle soft clipper for the mix bus
///
/// Transparent below the threshold, then an exponential knee that approaches
/// the ceiling asymptotically.
#[inline(always)]
pub fn soft_clip(x: f32) -> f32 {
    let abs_x = x.abs();
    if abs_x <= SOFT_CLIP_THRESHOLD {
        return x;
    }

    let sign = x.signum();
    let knee_width = SOFT_CLIP_CEILING - SOFT_CLIP_THRESHOLD;
    let ratio = (abs_x - SOFT_CLIP_THRESHOLD) / knee_width;
    let compressed = SOFT_CLIP_THRESHOLD + knee_width * (1.0 - (-ratio * 3.0).exp());
    sign * compressed.min(SOFT_CLIP_CEILING)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taper_is_complementary() {
        let taper = crossfade_taper(256);
        for i in 0..256 {
            let sum = taper[i] + taper[255 - i];
            assert!((sum - 1.0).abs() < 1e-6);
        }
        assert!(taper[0] < 0.001);
        assert!(taper[255] > 0.999);
        assert!(taper.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn test_soft_clip_transparent_below_threshold() {
        assert_eq!(soft_clip(0.5), 0.5);
        assert_eq!(soft_clip(-0.75), -0.75);
    }

    #[test]
    fn test_soft_clip_bounded() {
        assert!(soft_clip(10.0) <= SOFT_CLIP_CEILING);
        assert!(soft_clip(-10.0) >= -SOFT_CLIP_CEILING);
        assert!(soft_clip(0.8) > 0.75 && soft_clip(0.8) < 0.8);
    }

    #[test]
    fn test_master_bus_volume_ramps() {
        let mut bus = MasterBus::new(1.0, false);
        bus.set_volume(0.0);
        let mut samples = vec![0.5; 2048];
        bus.process(&mut samples, 2);
        // Smoothed: first frame barely moves, last frame close to silent
        assert!(samples[0] > 0.49);
        assert!(samples[2047] < 0.25);
    }

    #[test]
    fn test_master_bus_clips_only_when_enabled() {
        let mut plain = MasterBus::new(1.0, false);
        let mut samples = vec![0.95, -1.0];
        assert_eq!(plain.process(&mut samples, 2), 1.0);
        assert_eq!(samples, vec![0.95, -1.0]);

        let mut clipped = MasterBus::new(1.0, true);
        let mut samples = vec![0.95, -1.0];
        let peak = clipped.process(&mut samples, 2);
        assert!(peak <= SOFT_CLIP_CEILING);
        assert!(samples[0] < 0.95 && samples[1] > -1.0);
    }

    #[test]
    fn test_peak_meter() {
        let shared = TransportShared::default();
        shared.raise_peak(0.3);
        shared.raise_peak(0.7);
        shared.raise_peak(0.5);
        assert_eq!(shared.take_peak(), 0.7);
        assert_eq!(shared.take_peak(), 0.0);
    }

    #[test]
    fn test_transport_update() {
        let mut playback = Playback::new(256);
        playback.apply(&TransportUpdate {
            volume: Some(0.5),
            cycle_frames: Some(Some(44100)),
            ..Default::default()
        });
        assert_eq!(playback.volume, 0.5);
        assert_eq!(playback.cycle_frames, Some(44100));
        assert!(playback.playing);

        playback.apply(&TransportUpdate {
            cycle_frames: Some(None),
            ..Default::default()
        });
        assert_eq!(playback.cycle_frames, None);
    }
}
