//! Decoded audio assets and the voices that read them.
//!
//! A [`Source`] is immutable once loaded, apart from its per-channel FIR taps.
//! It is built on the control side, moved into the render table, and handed
//! back for release once removed. The control side keeps a [`SourceHandle`]
//! with the metadata it needs to validate track configurations.
//!
//! Each playing instance of a source owns a [`SourceVoice`], so two tracks
//! playing the same source never share vocoder state.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::effects::{FilterTaps, FirState};
use crate::error::EngineError;
use crate::lifecycle::Lifecycle;
use crate::timestretcher::{PhaseVocoder, PhaseVocoderState, Varispeed};

/// Upper bound on channels per source and per engine
pub const MAX_SOURCE_CHANNELS: usize = 8;

/// A contiguous span of source frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: usize,
    pub length: usize,
}

impl Region {
    pub fn end(&self) -> usize {
        self.start + self.length
    }
}

/// Split `0..length` at each bound
pub fn regions_from_bounds(length: usize, bounds: &[usize]) -> Vec<Region> {
    let mut regions = Vec::with_capacity(bounds.len() + 1);
    let mut start = 0;
    for &b in bounds.iter().chain(std::iter::once(&length)) {
        if b > start {
            regions.push(Region {
                start,
                length: b - start,
            });
            start = b;
        }
    }
    regions
}

fn validate_bounds(length: usize, bounds: &[usize]) -> Result<(), EngineError> {
    let mut prev = 0;
    for (i, &b) in bounds.iter().enumerate() {
        if b == 0 || b >= length {
            return Err(EngineError::InvalidBounds(format!(
                "bound {b} outside 1..{length}"
            )));
        }
        if i > 0 && b <= prev {
            return Err(EngineError::InvalidBounds(format!(
                "bound {b} does not follow {prev}"
            )));
        }
        prev = b;
    }
    Ok(())
}

pub struct Source {
    id: Arc<str>,
    channels: Vec<Vec<f32>>,
    length: usize,
    /// Region markers, strictly increasing, all inside `1..length`
    bounds: Vec<usize>,
    filters: Vec<FilterTaps>,
    lifecycle: Arc<Lifecycle>,
}

impl Source {
    /// Build a source from one sample array per channel
    pub fn new(id: impl Into<Arc<str>>, channels: Vec<Vec<f32>>) -> Result<Self, EngineError> {
        if channels.is_empty() || channels.len() > MAX_SOURCE_CHANNELS {
            return Err(EngineError::ChannelMismatch(format!(
                "{} channels, expected 1..={MAX_SOURCE_CHANNELS}",
                channels.len()
            )));
        }
        let length = channels[0].len();
        if length == 0 {
            return Err(EngineError::EmptySource);
        }
        if channels.iter().any(|c| c.len() != length) {
            return Err(EngineError::ChannelMismatch(
                "channels differ in length".to_string(),
            ));
        }

        let filters = vec![FilterTaps::identity(); channels.len()];
        Ok(Self {
            id: id.into(),
            channels,
            length,
            bounds: Vec::new(),
            filters,
            lifecycle: Arc::new(Lifecycle::new()),
        })
    }

    /// Attach region markers
    pub fn with_bounds(mut self, bounds: Vec<usize>) -> Result<Self, EngineError> {
        validate_bounds(self.length, &bounds)?;
        self.bounds = bounds;
        Ok(self)
    }

    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    /// Length in frames
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Samples of one channel
    pub fn channel(&self, channel: usize) -> &[f32] {
        &self.channels[channel % self.channels.len()]
    }

    pub fn bounds(&self) -> &[usize] {
        &self.bounds
    }

    pub fn regions(&self) -> Vec<Region> {
        regions_from_bounds(self.length, &self.bounds)
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Control-side metadata for validation
    pub fn handle(&self) -> SourceHandle {
        SourceHandle {
            id: self.id.clone(),
            channels: self.channels.len(),
            length: self.length,
            bounds: self.bounds.clone(),
            lifecycle: self.lifecycle.clone(),
        }
    }

    /// Replace one channel's taps in place. Returns `false` for a bad channel.
    pub fn set_filter(&mut self, channel: usize, taps: FilterTaps) -> bool {
        match self.filters.get_mut(channel) {
            Some(slot) => {
                *slot = taps;
                true
            }
            None => false,
        }
    }

    pub fn filter(&self, channel: usize) -> &FilterTaps {
        &self.filters[channel % self.filters.len()]
    }

    /// Produce `out.len()` samples of `channel` at `rate`, continuing from the
    /// voice channel's cursor. Reads past the data are silence.
    pub fn advance(
        &self,
        voice: &mut VoiceChannel,
        channel: usize,
        rate: f64,
        vocoder: &mut PhaseVocoder,
        out: &mut [f32],
    ) {
        let samples = self.channel(channel);
        match &mut voice.reader {
            VoiceReader::Vocoder(state) => vocoder.render(state, samples, rate, out),
            VoiceReader::Varispeed(reader) => reader.render(samples, rate, out),
        }

        let taps = self.filter(channel);
        if !taps.is_identity() {
            for y in out.iter_mut() {
                *y = voice.fir.process(taps, *y);
            }
        }
    }
}

/// What the control side remembers about a source it has published
#[derive(Debug, Clone)]
pub struct SourceHandle {
    pub id: Arc<str>,
    pub channels: usize,
    pub length: usize,
    pub bounds: Vec<usize>,
    pub lifecycle: Arc<Lifecycle>,
}

impl SourceHandle {
    pub fn regions(&self) -> Vec<Region> {
        regions_from_bounds(self.length, &self.bounds)
    }
}

enum VoiceReader {
    Vocoder(PhaseVocoderState),
    Varispeed(Varispeed),
}

/// Read cursor and filter memory for one channel of a playing source
pub struct VoiceChannel {
    reader: VoiceReader,
    fir: FirState,
}

impl VoiceChannel {
    fn seek(&mut self, position: f64) {
        match &mut self.reader {
            VoiceReader::Vocoder(state) => state.seek(position),
            VoiceReader::Varispeed(reader) => reader.seek(position),
        }
        self.fir.reset();
    }
}

/// One playing instance of a source
pub struct SourceVoice {
    channels: Vec<VoiceChannel>,
}

impl SourceVoice {
    /// Allocate a voice for a source with `channel_count` channels
    pub fn new(channel_count: usize, preserve_pitch: bool, config: &EngineConfig) -> Self {
        let channels = (0..channel_count.max(1))
            .map(|_| VoiceChannel {
                reader: if preserve_pitch {
                    VoiceReader::Vocoder(PhaseVocoderState::new(
                        config.pv_window,
                        config.pv_hop(),
                    ))
                } else {
                    VoiceReader::Varispeed(Varispeed::default())
                },
                fir: FirState::default(),
            })
            .collect();
        Self { channels }
    }

    /// Move every channel to `position`. Vocoder channels restart cold.
    pub fn seek(&mut self, position: f64) {
        for channel in &mut self.channels {
            channel.seek(position);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel_mut(&mut self, channel: usize) -> Option<&mut VoiceChannel> {
        self.channels.get_mut(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| i as f32 / len as f32).collect()
    }

    #[test]
    fn test_new_validates_channels() {
        assert!(matches!(
            Source::new("a", vec![]),
            Err(EngineError::ChannelMismatch(_))
        ));
        assert_eq!(
            Source::new("a", vec![vec![]]).err(),
            Some(EngineError::EmptySource)
        );
        assert!(matches!(
            Source::new("a", vec![vec![0.0; 4], vec![0.0; 5]]),
            Err(EngineError::ChannelMismatch(_))
        ));
    }

    #[test]
    fn test_regions_from_bounds() {
        let src = Source::new("a", vec![ramp(300)])
            .unwrap()
            .with_bounds(vec![100, 250])
            .unwrap();
        let regions = src.regions();
        assert_eq!(
            regions,
            vec![
                Region { start: 0, length: 100 },
                Region { start: 100, length: 150 },
                Region { start: 250, length: 50 },
            ]
        );
        assert_eq!(regions_from_bounds(10, &[]), vec![Region { start: 0, length: 10 }]);
    }

    #[test]
    fn test_rejects_bad_bounds() {
        let src = || Source::new("a", vec![ramp(100)]).unwrap();
        assert!(src().with_bounds(vec![50, 40]).is_err());
        assert!(src().with_bounds(vec![50, 50]).is_err());
        assert!(src().with_bounds(vec![100]).is_err());
        assert!(src().with_bounds(vec![0]).is_err());
    }

    #[test]
    fn test_channel_mapping_wraps() {
        let src = Source::new("a", vec![vec![1.0; 8]]).unwrap();
        assert_eq!(src.channel(1), src.channel(0));
    }

    #[test]
    fn test_advance_varispeed_with_filter() {
        let config = EngineConfig::default();
        let mut pv = PhaseVocoder::new(config.pv_window, config.pv_overlap, config.pv_abstol);
        let mut src = Source::new("a", vec![vec![1.0; 64]]).unwrap();
        assert!(src.set_filter(0, FilterTaps::new(&[0.5, 0.5]).unwrap()));
        assert!(!src.set_filter(3, FilterTaps::identity()));

        let mut voice = SourceVoice::new(1, false, &config);
        voice.seek(0.0);
        let mut out = [0.0; 4];
        let channel = voice.channel_mut(0).unwrap();
        src.advance(channel, 0, 1.0, &mut pv, &mut out);
        assert_eq!(out, [0.5, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_voices_are_independent() {
        let config = EngineConfig {
            pv_window: 256,
            ..Default::default()
        };
        let mut pv = PhaseVocoder::new(config.pv_window, config.pv_overlap, config.pv_abstol);
        let samples: Vec<f32> = (0..8192).map(|i| (i as f32 * 0.03).sin()).collect();
        let src = Source::new("a", vec![samples.clone()]).unwrap();

        let mut a = SourceVoice::new(1, true, &config);
        let mut b = SourceVoice::new(1, true, &config);
        a.seek(1000.0);
        b.seek(3000.0);

        let mut out_a = [0.0; 128];
        let mut out_b = [0.0; 128];
        for _ in 0..4 {
            src.advance(a.channel_mut(0).unwrap(), 0, 1.0, &mut pv, &mut out_a);
            src.advance(b.channel_mut(0).unwrap(), 0, 1.0, &mut pv, &mut out_b);
        }
        // Last block of each: 384..512 past the seek point
        for i in 0..128 {
            assert!((out_a[i] - samples[1384 + i]).abs() < 1e-3);
            assert!((out_b[i] - samples[3384 + i]).abs() < 1e-3);
        }
    }
}
