//! Peak and RMS measurement

use crate::AnalysisError;

/// Floor used when converting silence to decibels
const MIN_DB: f32 = -120.0;

/// Peak and RMS of a block of samples
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Levels {
    pub peak: f32,
    pub rms: f32,
    pub frames: usize,
}

impl Levels {
    /// Measure interleaved samples across all channels
    pub fn measure(samples: &[f32]) -> Result<Self, AnalysisError> {
        if samples.is_empty() {
            return Err(AnalysisError::EmptyInput);
        }
        let mut peak = 0.0f32;
        let mut sum = 0.0f64;
        for &s in samples {
            peak = peak.max(s.abs());
            sum += (s as f64) * (s as f64);
        }
        Ok(Self {
            peak,
            rms: (sum / samples.len() as f64).sqrt() as f32,
            frames: samples.len(),
        })
    }

    /// Measure one array per channel
    pub fn measure_channels(channels: &[Vec<f32>]) -> Result<Self, AnalysisError> {
        let first = channels.first().ok_or(AnalysisError::EmptyInput)?;
        if channels.iter().any(|c| c.len() != first.len()) {
            return Err(AnalysisError::ChannelMismatch);
        }
        let all: Vec<f32> = channels.iter().flatten().copied().collect();
        let mut levels = Self::measure(&all)?;
        levels.frames = first.len();
        Ok(levels)
    }

    pub fn peak_db(&self) -> f32 {
        to_db(self.peak)
    }

    pub fn rms_db(&self) -> f32 {
        to_db(self.rms)
    }

    /// Peak-to-RMS ratio in dB
    pub fn crest_db(&self) -> f32 {
        self.peak_db() - self.rms_db()
    }
}

/// Linear amplitude to dBFS
pub fn to_db(amplitude: f32) -> f32 {
    if amplitude <= 0.0 {
        MIN_DB
    } else {
        (20.0 * amplitude.log10()).max(MIN_DB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sine_levels() {
        let sine: Vec<f32> = (0..48000)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / 48000.0).sin())
            .collect();
        let levels = Levels::measure(&sine).unwrap();
        assert!((levels.peak - 0.5).abs() < 1e-3);
        assert!((levels.rms - 0.5 / 2.0f32.sqrt()).abs() < 1e-3);
        // Sine crest factor is 3 dB
        assert!((levels.crest_db() - 3.01).abs() < 0.05);
    }

    #[test]
    fn test_db_conversion() {
        assert_eq!(to_db(0.0), MIN_DB);
        assert!((to_db(1.0)).abs() < 1e-6);
        assert!((to_db(0.5) + 6.02).abs() < 0.01);
    }

    #[test]
    fn test_channels() {
        let levels = Levels::measure_channels(&[vec![0.5; 10], vec![-1.0; 10]]).unwrap();
        assert_eq!(levels.peak, 1.0);
        assert_eq!(levels.frames, 10);
        assert_eq!(Levels::measure(&[]), Err(AnalysisError::EmptyInput));
    }
}
