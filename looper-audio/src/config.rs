//! Engine configuration
//!
//! Stored as a simple `key=value` text file with `#` comments. Defaults match
//! the native engine constants (44.1 kHz stereo, 2048-sample vocoder window).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::effects::MAX_FIR_TAPS;
use crate::source::MAX_SOURCE_CHANNELS;

/// Longest crossfade allowed, in periods
pub const MAX_CROSSFADE_PERIODS: usize = 16;

/// Errors raised while loading or validating an [`EngineConfig`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(String),
    #[error("line {line}: invalid value for {key}: {value}")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
    #[error("{0}")]
    Invalid(String),
}

/// Engine-wide constants, fixed for the lifetime of a stream
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Native engine rate in Hz. No sample-rate conversion happens anywhere.
    pub sample_rate: u32,
    /// Output channel count
    pub channels: usize,
    /// Frames rendered per tick
    pub period: usize,
    /// Phase-vocoder window size W (power of two)
    pub pv_window: usize,
    /// Overlap factor W / H
    pub pv_overlap: usize,
    /// Bins below this magnitude are treated as noise
    pub pv_abstol: f32,
    /// Length of the anti-click taper used for every transition
    pub crossfade_frames: usize,
    /// Run the master bus through the soft clipper
    pub master_soft_clip: bool,
    pub max_delay_secs: f32,
    /// Taps of the designed per-track low-pass
    pub fir_taps: usize,
    /// Capacity of a single record chunk
    pub record_chunk_secs: f32,
    /// Output staging capacity, in periods
    pub output_buffer_periods: usize,
    /// Bounded command and event queue size
    pub command_capacity: usize,
    pub max_sources: usize,
    pub max_tracks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            period: 256,
            pv_window: 2048,
            pv_overlap: 4,
            pv_abstol: 1e-3,
            crossfade_frames: 256,
            master_soft_clip: false,
            max_delay_secs: 10.0,
            fir_taps: 33,
            record_chunk_secs: 10.0,
            output_buffer_periods: 8,
            command_capacity: 1024,
            max_sources: 64,
            max_tracks: 64,
        }
    }
}

impl EngineConfig {
    /// Load config from the default location
    ///
    /// Falls back to defaults when the file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load and validate config from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::parse(&content)
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.serialize())
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("looper")
            .join("engine.conf")
    }

    /// Parse config from `key=value` lines. Unknown keys are ignored.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            let invalid = || ConfigError::InvalidValue {
                line: number + 1,
                key: key.to_string(),
                value: value.to_string(),
            };

            match key {
                "sample_rate" => config.sample_rate = value.parse().map_err(|_| invalid())?,
                "channels" => config.channels = value.parse().map_err(|_| invalid())?,
                "period" => config.period = value.parse().map_err(|_| invalid())?,
                "pv_window" => config.pv_window = value.parse().map_err(|_| invalid())?,
                "pv_overlap" => config.pv_overlap = value.parse().map_err(|_| invalid())?,
                "pv_abstol" => config.pv_abstol = value.parse().map_err(|_| invalid())?,
                "crossfade_frames" => {
                    config.crossfade_frames = value.parse().map_err(|_| invalid())?
                }
                "master_soft_clip" => {
                    config.master_soft_clip = value.parse().map_err(|_| invalid())?
                }
                "max_delay_secs" => config.max_delay_secs = value.parse().map_err(|_| invalid())?,
                "fir_taps" => config.fir_taps = value.parse().map_err(|_| invalid())?,
                "record_chunk_secs" => {
                    config.record_chunk_secs = value.parse().map_err(|_| invalid())?
                }
                "output_buffer_periods" => {
                    config.output_buffer_periods = value.parse().map_err(|_| invalid())?
                }
                "command_capacity" => {
                    config.command_capacity = value.parse().map_err(|_| invalid())?
                }
                "max_sources" => config.max_sources = value.parse().map_err(|_| invalid())?,
                "max_tracks" => config.max_tracks = value.parse().map_err(|_| invalid())?,
                _ => {} // Ignore unknown keys
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Serialize config to `key=value` format
    pub fn serialize(&self) -> String {
        let lines = [
            "# Looper engine configuration".to_string(),
            format!("sample_rate={}", self.sample_rate),
            format!("channels={}", self.channels),
            format!("period={}", self.period),
            format!("pv_window={}", self.pv_window),
            format!("pv_overlap={}", self.pv_overlap),
            format!("pv_abstol={}", self.pv_abstol),
            format!("crossfade_frames={}", self.crossfade_frames),
            format!("master_soft_clip={}", self.master_soft_clip),
            format!("max_delay_secs={}", self.max_delay_secs),
            format!("fir_taps={}", self.fir_taps),
            format!("record_chunk_secs={}", self.record_chunk_secs),
            format!("output_buffer_periods={}", self.output_buffer_periods),
            format!("command_capacity={}", self.command_capacity),
            format!("max_sources={}", self.max_sources),
            format!("max_tracks={}", self.max_tracks),
        ];
        lines.join("\n")
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Invalid(msg));

        if self.sample_rate == 0 {
            return fail("sample_rate must be non-zero".into());
        }
        if self.channels == 0 || self.channels > MAX_SOURCE_CHANNELS {
            return fail(format!("channels must be in 1..={MAX_SOURCE_CHANNELS}"));
        }
        if self.period == 0 {
            return fail("period must be non-zero".into());
        }
        if !self.pv_window.is_power_of_two() || self.pv_window < 16 {
            return fail(format!("pv_window {} must be a power of two >= 16", self.pv_window));
        }
        // Hann squared only sums to a constant from four overlapping frames up
        if !self.pv_overlap.is_power_of_two()
            || self.pv_overlap < 4
            || self.pv_overlap > self.pv_window
        {
            return fail(format!(
                "pv_overlap {} must be a power of two in 4..={}",
                self.pv_overlap, self.pv_window
            ));
        }
        if !(self.pv_abstol.is_finite() && self.pv_abstol >= 0.0) {
            return fail("pv_abstol must be finite and non-negative".into());
        }
        let max_crossfade = MAX_CROSSFADE_PERIODS * self.period;
        if self.crossfade_frames == 0 || self.crossfade_frames > max_crossfade {
            return fail(format!(
                "crossfade_frames must be in 1..={max_crossfade} ({MAX_CROSSFADE_PERIODS} periods)"
            ));
        }
        if !(self.max_delay_secs.is_finite() && self.max_delay_secs >= 0.0) {
            return fail("max_delay_secs must be finite and non-negative".into());
        }
        if self.fir_taps == 0 || self.fir_taps > MAX_FIR_TAPS {
            return fail(format!("fir_taps must be in 1..={MAX_FIR_TAPS}"));
        }
        if !(self.record_chunk_secs.is_finite() && self.record_chunk_secs > 0.0) {
            return fail("record_chunk_secs must be positive".into());
        }
        if self.output_buffer_periods == 0 || self.command_capacity == 0 {
            return fail("output_buffer_periods and command_capacity must be non-zero".into());
        }
        if self.max_sources == 0 || self.max_tracks == 0 {
            return fail("max_sources and max_tracks must be non-zero".into());
        }
        Ok(())
    }

    /// Analysis hop H
    pub fn pv_hop(&self) -> usize {
        self.pv_window / self.pv_overlap
    }

    pub fn max_delay_frames(&self) -> usize {
        (self.max_delay_secs * self.sample_rate as f32) as usize
    }

    pub fn record_chunk_frames(&self) -> usize {
        ((self.record_chunk_secs * self.sample_rate as f32) as usize).max(self.period)
    }

    pub fn output_capacity(&self) -> usize {
        self.period * self.output_buffer_periods
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pv_hop(), 512);
        assert_eq!(config.max_delay_frames(), 441_000);
    }

    #[test]
    fn test_parse_empty() {
        let config = EngineConfig::parse("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_parse_with_comments() {
        let content = "# Comment\nperiod=441\n\n# Another comment\nchannels = 1";
        let config = EngineConfig::parse(content).unwrap();
        assert_eq!(config.period, 441);
        assert_eq!(config.channels, 1);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = EngineConfig::parse("theme=dark\nperiod=128").unwrap();
        assert_eq!(config.period, 128);
    }

    #[test]
    fn test_bad_value_reports_line() {
        let err = EngineConfig::parse("period=128\npv_window=lots").unwrap_err();
        match err {
            ConfigError::InvalidValue { line, key, .. } => {
                assert_eq!(line, 2);
                assert_eq!(key, "pv_window");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_non_power_of_two_window() {
        assert!(EngineConfig::parse("pv_window=1000").is_err());
        assert!(EngineConfig::parse("pv_overlap=3").is_err());
        assert!(EngineConfig::parse("pv_overlap=2").is_err());
    }

    #[test]
    fn test_rejects_too_many_fir_taps() {
        assert!(EngineConfig::parse("fir_taps=65").is_err());
        assert!(EngineConfig::parse("fir_taps=64").is_ok());
    }

    #[test]
    fn test_crossfade_bounded_by_period() {
        assert!(EngineConfig::parse("crossfade_frames=0").is_err());
        assert!(EngineConfig::parse("period=16\ncrossfade_frames=256").is_ok());
        assert!(EngineConfig::parse("period=16\ncrossfade_frames=257").is_err());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = EngineConfig {
            period: 441,
            crossfade_frames: 128,
            master_soft_clip: true,
            ..Default::default()
        };
        let parsed = EngineConfig::parse(&config.serialize()).unwrap();
        assert_eq!(parsed, config);
    }
}
