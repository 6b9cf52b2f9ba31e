//! Multi-resolution min/max waveform overview

use tracing::debug;

use crate::AnalysisError;

/// Min/max envelope at one resolution
#[derive(Debug, Clone, PartialEq)]
pub struct MinMaxLevel {
    /// Source frames summarised by each point
    pub frame_size: usize,
    /// Per-point minimum, never above zero
    pub mins: Vec<f32>,
    /// Per-point maximum, never below zero
    pub maxes: Vec<f32>,
}

impl MinMaxLevel {
    pub fn len(&self) -> usize {
        self.mins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mins.is_empty()
    }

    /// Envelope over source frames `start..end`
    pub fn range(&self, start: usize, end: usize) -> (f32, f32) {
        let first = start / self.frame_size;
        let last = end.div_ceil(self.frame_size).min(self.len());
        let mut min = 0.0f32;
        let mut max = 0.0f32;
        for i in first..last {
            min = min.min(self.mins[i]);
            max = max.max(self.maxes[i]);
        }
        (min, max)
    }
}

/// Min/max envelopes at frame sizes 2, 4, 8, ... up to half the input.
///
/// Each level halves the previous one, so building costs one pass over the
/// input plus a geometric tail. The per-frame envelope is kept as well, for
/// overviews finer than two frames per point.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformPyramid {
    base: MinMaxLevel,
    levels: Vec<MinMaxLevel>,
    length: usize,
}

impl WaveformPyramid {
    /// Build the pyramid for a mono signal
    pub fn build(samples: &[f32]) -> Result<Self, AnalysisError> {
        if samples.is_empty() {
            return Err(AnalysisError::EmptyInput);
        }
        Ok(Self::from_base(MinMaxLevel {
            frame_size: 1,
            mins: samples.iter().map(|s| s.min(0.0)).collect(),
            maxes: samples.iter().map(|s| s.max(0.0)).collect(),
        }))
    }

    /// Build from one array per channel. Each frame spans the lowest and
    /// highest sample of any channel.
    pub fn build_channels(channels: &[Vec<f32>]) -> Result<Self, AnalysisError> {
        let first = channels.first().ok_or(AnalysisError::EmptyInput)?;
        if first.is_empty() {
            return Err(AnalysisError::EmptyInput);
        }
        if channels.iter().any(|c| c.len() != first.len()) {
            return Err(AnalysisError::ChannelMismatch);
        }
        let frames = 0..first.len();
        Ok(Self::from_base(MinMaxLevel {
            frame_size: 1,
            mins: frames
                .clone()
                .map(|i| channels.iter().fold(0.0f32, |acc, c| acc.min(c[i])))
                .collect(),
            maxes: frames
                .map(|i| channels.iter().fold(0.0f32, |acc, c| acc.max(c[i])))
                .collect(),
        }))
    }

    fn from_base(base: MinMaxLevel) -> Self {
        let length = base.len();
        let mut levels: Vec<MinMaxLevel> = Vec::new();

        let mut frame_size = 2;
        while frame_size < length / 2 {
            let count = length.div_ceil(frame_size);
            let prev = levels.last().unwrap_or(&base);
            let (prev_mins, prev_maxes) = (prev.mins.as_slice(), prev.maxes.as_slice());

            let mut mins = vec![0.0f32; count];
            let mut maxes = vec![0.0f32; count];
            for i in 0..count {
                let end = (2 * i + 2).min(prev_mins.len());
                for j in (2 * i).min(end)..end {
                    mins[i] = mins[i].min(prev_mins[j]);
                    maxes[i] = maxes[i].max(prev_maxes[j]);
                }
            }
            levels.push(MinMaxLevel {
                frame_size,
                mins,
                maxes,
            });
            frame_size *= 2;
        }

        debug!(length, levels = levels.len(), "Waveform pyramid built");
        Self {
            base,
            levels,
            length,
        }
    }

    /// Input length in frames
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn levels(&self) -> &[MinMaxLevel] {
        &self.levels
    }

    /// Coarsest level whose points are no wider than `frames_per_point`,
    /// falling back to the per-frame envelope
    pub fn level_for(&self, frames_per_point: usize) -> &MinMaxLevel {
        self.levels
            .iter()
            .take_while(|l| l.frame_size <= frames_per_point)
            .last()
            .unwrap_or(&self.base)
    }

    /// Envelope of `points` equal slices of the input, for drawing
    pub fn overview(&self, points: usize) -> Vec<(f32, f32)> {
        if points == 0 {
            return Vec::new();
        }
        let level = self.level_for((self.length / points).max(1));
        (0..points)
            .map(|p| {
                let start = p * self.length / points;
                let end = ((p + 1) * self.length / points).max(start + 1);
                level.range(start, end)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_halve() {
        let samples: Vec<f32> = (0..1024).map(|i| (i as f32 * 0.1).sin()).collect();
        let pyramid = WaveformPyramid::build(&samples).unwrap();
        let sizes: Vec<usize> = pyramid.levels().iter().map(|l| l.frame_size).collect();
        assert_eq!(sizes, vec![2, 4, 8, 16, 32, 64, 128, 256]);
        assert_eq!(pyramid.levels()[0].len(), 512);
        assert_eq!(pyramid.levels()[7].len(), 4);
    }

    #[test]
    fn test_min_max_values() {
        let samples = [0.5, -0.25, 0.1, 0.2, -0.8, 0.0, 0.3, 0.3, 0.0, 0.0];
        let pyramid = WaveformPyramid::build(&samples).unwrap();
        let level = &pyramid.levels()[0];
        assert_eq!(level.frame_size, 2);
        assert_eq!(level.maxes, vec![0.5, 0.2, 0.0, 0.3, 0.0]);
        assert_eq!(level.mins, vec![-0.25, 0.0, -0.8, 0.0, 0.0]);

        let level = &pyramid.levels()[1];
        assert_eq!(level.maxes, vec![0.5, 0.3, 0.0]);
        assert_eq!(level.mins, vec![-0.25, -0.8, 0.0]);
    }

    #[test]
    fn test_short_input_has_no_levels() {
        let pyramid = WaveformPyramid::build(&[0.1, 0.2, 0.3]).unwrap();
        assert!(pyramid.levels().is_empty());
        // Overview reads the per-frame envelope instead
        assert_eq!(pyramid.level_for(16).frame_size, 1);
        assert_eq!(pyramid.overview(2), vec![(0.0, 0.1), (0.0, 0.3)]);
        assert_eq!(WaveformPyramid::build(&[]), Err(AnalysisError::EmptyInput));
    }

    #[test]
    fn test_overview_tracks_envelope() {
        let mut samples = vec![0.0f32; 4096];
        for s in &mut samples[2048..2100] {
            *s = 0.9;
        }
        let pyramid = WaveformPyramid::build(&samples).unwrap();
        let overview = pyramid.overview(8);
        assert_eq!(overview.len(), 8);
        assert_eq!(overview[4], (0.0, 0.9));
        assert_eq!(overview[0], (0.0, 0.0));
    }

    #[test]
    fn test_opposite_channels_keep_both_edges() {
        let left = vec![0.9; 64];
        let right = vec![-0.9; 64];
        let pyramid = WaveformPyramid::build_channels(&[left, right]).unwrap();
        assert_eq!(pyramid.overview(4), vec![(-0.9, 0.9); 4]);
        assert_eq!(pyramid.levels()[0].range(0, 64), (-0.9, 0.9));
    }

    #[test]
    fn test_fine_overview_uses_raw_samples() {
        let samples = [0.5, -0.25, 0.1, 0.2, -0.8, 0.0, 0.3, 0.3, 0.0, 0.0];
        let pyramid = WaveformPyramid::build(&samples).unwrap();
        let overview = pyramid.overview(10);
        assert_eq!(overview[0], (0.0, 0.5));
        assert_eq!(overview[1], (-0.25, 0.0));
        assert_eq!(overview[4], (-0.8, 0.0));
    }

    #[test]
    fn test_channels_keep_widest() {
        let left = vec![0.2; 64];
        let right = vec![-0.6; 64];
        let pyramid = WaveformPyramid::build_channels(&[left, right]).unwrap();
        assert_eq!(pyramid.levels()[0].mins[0], -0.6);
        assert_eq!(pyramid.levels()[0].maxes[0], 0.2);
        assert_eq!(
            WaveformPyramid::build_channels(&[vec![0.0; 4], vec![0.0; 5]]),
            Err(AnalysisError::ChannelMismatch)
        );
    }
}
