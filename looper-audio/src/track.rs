//! Mix tracks: chunk sequencing, playback swaps and crossfades.
//!
//! A [`MixTrack`] plays the sources named by its current [`MixTrackPlayback`]
//! through a pattern of chunks (regions of its timeline source). A pending
//! playback replaces the current one either at the next tick or, with
//! `next_at_chunk`, exactly at the next chunk boundary.
//!
//! Every discontinuity (chunk seam, swap, start, stop) is smoothed the same
//! way: the outgoing voices render `crossfade_frames` past the transition into
//! a tail buffer, and the incoming audio is blended over it with a
//! raised-cosine taper whose weights sum to one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::effects::{DelayLine, Effect, FilterTaps, FirFilter};
use crate::engine::{bump, EngineStats, Outbox, Retired};
use crate::error::EngineError;
use crate::lifecycle::Lifecycle;
use crate::source::{Region, Source, SourceHandle, SourceVoice};
use crate::timestretcher::PhaseVocoder;

/// Output frames of float slack allowed when finding the next chunk boundary
const BOUNDARY_EPSILON: f64 = 1e-6;

/// Per-source settings inside a playback
#[derive(Debug, Clone, PartialEq)]
pub struct MixTrackSourceConfig {
    pub volume: f32,
    /// Frames added to the track position when reading this source
    pub offset: usize,
    /// Keep the entry but stop rendering it
    pub destroy: bool,
}

impl Default for MixTrackSourceConfig {
    fn default() -> Self {
        Self {
            volume: 1.0,
            offset: 0,
            destroy: false,
        }
    }
}

/// Host-facing description of a playback, validated into a [`MixTrackPlayback`]
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackParams {
    /// Ordered; the first entry is the timeline source that defines regions
    pub sources: Vec<(String, MixTrackSourceConfig)>,
    /// Region indices to play in order
    pub chunks: Vec<usize>,
    pub chunk_index: usize,
    pub volume: f32,
    pub playing: bool,
    pub muted: bool,
    pub looping: bool,
    /// Ignore the transport cycle and never advance chunks automatically
    pub aperiodic: bool,
    pub preserve_pitch: bool,
    /// Defer the swap to this playback until the next chunk boundary
    pub next_at_chunk: bool,
    /// Resume at the stored position instead of restarting the chunk
    pub unpause: bool,
    /// Route to the preview bus instead of the main mix
    pub preview: bool,
    /// Normalised low-pass cutoff; 1.0 bypasses
    pub filter: f32,
    /// Echo delay in seconds
    pub delay: f32,
    pub delay_gain: f32,
    /// Playback rate when no transport cycle applies
    pub rate: f64,
}

impl Default for PlaybackParams {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            chunks: Vec::new(),
            chunk_index: 0,
            volume: 1.0,
            playing: false,
            muted: false,
            looping: true,
            aperiodic: false,
            preserve_pitch: true,
            next_at_chunk: false,
            unpause: false,
            preview: false,
            filter: 1.0,
            delay: 0.0,
            delay_gain: 0.0,
            rate: 1.0,
        }
    }
}

struct VoiceSlot {
    id: Arc<str>,
    config: MixTrackSourceConfig,
    voice: SourceVoice,
}

/// Validated, render-ready playback configuration
pub struct MixTrackPlayback {
    pub(crate) volume: f32,
    pub(crate) playing: bool,
    pub(crate) muted: bool,
    pub(crate) looping: bool,
    pub(crate) aperiodic: bool,
    pub(crate) next_at_chunk: bool,
    pub(crate) unpause: bool,
    pub(crate) preview: bool,
    pub(crate) rate: f64,
    pub(crate) chunks: Vec<usize>,
    pub(crate) chunk_index: usize,
    /// Incoming crossfade weight, 1.0 when no crossfade is running
    pub(crate) alpha: f32,
    slots: Vec<VoiceSlot>,
    regions: Vec<Region>,
    filter_taps: FilterTaps,
    delay_frames: usize,
    delay_gain: f32,
}

fn check_finite(name: &'static str, value: f64, ok: bool) -> Result<(), EngineError> {
    if value.is_finite() && ok {
        Ok(())
    } else {
        Err(EngineError::InvalidParameter { name, value })
    }
}

impl MixTrackPlayback {
    /// Validate `params` against the published sources and allocate voices
    pub fn build(
        params: &PlaybackParams,
        sources: &HashMap<Arc<str>, SourceHandle>,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        check_finite("volume", params.volume as f64, params.volume >= 0.0)?;
        check_finite("rate", params.rate, params.rate > 0.0)?;
        check_finite("filter", params.filter as f64, params.filter > 0.0)?;
        check_finite("delay", params.delay as f64, params.delay >= 0.0)?;
        check_finite(
            "delay_gain",
            params.delay_gain as f64,
            (0.0..1.0).contains(&params.delay_gain),
        )?;

        let delay_frames = (params.delay as f64 * config.sample_rate as f64).round() as usize;
        let max_delay = config.max_delay_frames();
        if delay_frames > max_delay {
            return Err(EngineError::DelayTooLong {
                requested: delay_frames,
                max: max_delay,
            });
        }

        let mut slots: Vec<VoiceSlot> = Vec::with_capacity(params.sources.len());
        for (id, source_config) in &params.sources {
            let handle = sources
                .get(id.as_str())
                .filter(|h| h.lifecycle.is_live())
                .ok_or_else(|| EngineError::UnknownSource(id.clone()))?;
            if slots.iter().any(|s| &*s.id == id.as_str()) {
                return Err(EngineError::DuplicateId(id.clone()));
            }
            check_finite(
                "source volume",
                source_config.volume as f64,
                source_config.volume >= 0.0,
            )?;
            slots.push(VoiceSlot {
                id: handle.id.clone(),
                config: source_config.clone(),
                voice: SourceVoice::new(handle.channels, params.preserve_pitch, config),
            });
        }

        let regions = params
            .sources
            .first()
            .and_then(|(id, _)| sources.get(id.as_str()))
            .map(|h| h.regions())
            .unwrap_or_default();
        if let Some(&index) = params.chunks.iter().find(|&&c| c >= regions.len()) {
            return Err(EngineError::InvalidChunk {
                index,
                regions: regions.len(),
            });
        }
        if params.chunks.is_empty() {
            if params.playing {
                return Err(EngineError::EmptyChunks);
            }
        } else if params.chunk_index >= params.chunks.len() {
            return Err(EngineError::InvalidChunkIndex {
                index: params.chunk_index,
                chunks: params.chunks.len(),
            });
        }

        Ok(Self {
            volume: params.volume,
            playing: params.playing,
            muted: params.muted,
            looping: params.looping,
            aperiodic: params.aperiodic,
            next_at_chunk: params.next_at_chunk,
            unpause: params.unpause,
            preview: params.preview,
            rate: params.rate,
            chunks: params.chunks.clone(),
            chunk_index: params.chunk_index,
            alpha: 1.0,
            slots,
            regions,
            filter_taps: FilterTaps::lowpass(params.filter, config.fir_taps),
            delay_frames,
            delay_gain: params.delay_gain,
        })
    }

    /// Region under the chunk cursor
    pub fn current_region(&self) -> Option<Region> {
        let chunk = *self.chunks.get(self.chunk_index)?;
        self.regions.get(chunk).copied()
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn chunk_index(&self) -> usize {
        self.chunk_index
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    fn seek_voices(&mut self, position: f64) {
        for slot in &mut self.slots {
            slot.voice.seek(position + slot.config.offset as f64);
        }
    }

    /// Rate for `region`: stretched to the cycle when one applies
    fn base_rate(&self, region: Region, cycle_frames: Option<usize>) -> f64 {
        match cycle_frames {
            Some(cycle) if !self.aperiodic => region.length as f64 / cycle as f64,
            _ => self.rate,
        }
    }
}

/// Render-side resources a track borrows for one tick
pub(crate) struct RenderContext<'a> {
    pub sources: &'a [Box<Source>],
    pub vocoder: &'a mut PhaseVocoder,
    /// Mono scratch, at least max(period, crossfade) frames
    pub scratch: &'a mut [f32],
    pub taper: &'a [f32],
    pub cycle_frames: Option<usize>,
    pub stats: &'a EngineStats,
    pub outbox: &'a mut Outbox,
}

/// Track telemetry published by the render side
#[derive(Debug, Default)]
pub struct TrackShared {
    pub(crate) lifecycle: Lifecycle,
    sample: AtomicU64,
    chunk_index: AtomicUsize,
    playing: AtomicBool,
    has_next: AtomicBool,
    alpha: AtomicU32,
    swaps: AtomicU64,
}

impl TrackShared {
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Timeline position in source frames
    pub fn sample(&self) -> f64 {
        f64::from_bits(self.sample.load(Ordering::Relaxed))
    }

    pub fn chunk_index(&self) -> usize {
        self.chunk_index.load(Ordering::Relaxed)
    }

    pub fn playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    /// A pending playback is waiting for its swap
    pub fn has_next(&self) -> bool {
        self.has_next.load(Ordering::Relaxed)
    }

    pub fn alpha(&self) -> f32 {
        f32::from_bits(self.alpha.load(Ordering::Relaxed))
    }

    /// Completed playback swaps
    pub fn swaps(&self) -> u64 {
        self.swaps.load(Ordering::Acquire)
    }
}

pub struct MixTrack {
    id: Arc<str>,
    playback: Box<MixTrackPlayback>,
    next_playback: Option<Box<MixTrackPlayback>>,
    /// Timeline position in source frames
    sample: f64,
    /// Progress through the current chunk, 0..1
    phase: f64,
    /// Frames of the current crossfade already blended
    overlap_index: usize,
    prev_rate: f64,
    tail: Vec<f32>,
    tail_next: Vec<f32>,
    block: Vec<f32>,
    filter: FirFilter,
    delay: DelayLine,
    channels: usize,
    crossfade: usize,
    shared: Arc<TrackShared>,
}

impl MixTrack {
    pub fn new(
        id: Arc<str>,
        playback: MixTrackPlayback,
        next: Option<MixTrackPlayback>,
        config: &EngineConfig,
    ) -> Self {
        let channels = config.channels;
        let crossfade = config.crossfade_frames;
        let mut track = Self {
            id,
            playback: Box::new(playback),
            next_playback: next.map(Box::new),
            sample: 0.0,
            phase: 0.0,
            overlap_index: crossfade,
            prev_rate: 1.0,
            tail: vec![0.0; crossfade * channels],
            tail_next: vec![0.0; crossfade * channels],
            block: vec![0.0; config.period * channels],
            filter: FirFilter::new(channels),
            delay: DelayLine::new(channels, config.max_delay_frames()),
            channels,
            crossfade,
            shared: Arc::new(TrackShared::default()),
        };
        track.apply_effects();
        if let Some(region) = track.playback.current_region() {
            track.sample = region.start as f64;
        }
        if track.playback.playing {
            // Fade in from silence
            track.overlap_index = 0;
            track.prev_rate = 0.0;
            let sample = track.sample;
            track.playback.seek_voices(sample);
        }
        track.publish();
        track
    }

    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    pub fn shared(&self) -> &Arc<TrackShared> {
        &self.shared
    }

    pub fn playback(&self) -> &MixTrackPlayback {
        &self.playback
    }

    pub fn sample(&self) -> f64 {
        self.sample
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }

    pub fn is_preview(&self) -> bool {
        self.playback.preview
    }

    /// Queue `next` as the pending playback, retiring any earlier one
    pub(crate) fn set_next(&mut self, next: Box<MixTrackPlayback>, outbox: &mut Outbox, stats: &EngineStats) {
        if let Some(old) = self.next_playback.replace(next) {
            outbox.retire(Retired::Playback(old), stats);
        }
        self.shared.has_next.store(true, Ordering::Relaxed);
    }

    /// Render one period and add it to `bus`
    pub(crate) fn render(&mut self, ctx: &mut RenderContext, bus: &mut [f32]) {
        let immediate = self
            .next_playback
            .as_ref()
            .is_some_and(|next| !next.next_at_chunk || !self.playback.playing);
        if immediate {
            self.swap(ctx, false);
        }

        let ch = self.channels;
        let frames = self.block.len() / ch;
        self.block.fill(0.0);

        let mut done = 0;
        while done < frames && self.playback.playing {
            let Some(region) = self.playback.current_region() else {
                bump(&ctx.stats.silent_voices);
                break;
            };
            let rate = self.current_rate(ctx, region);
            if !(rate.is_finite() && rate > 0.0) {
                bump(&ctx.stats.silent_voices);
                break;
            }

            let remaining = region.end() as f64 - self.sample;
            let to_boundary = if remaining > 0.0 {
                // Rounding noise must not add a whole frame to the chunk
                (remaining / rate - BOUNDARY_EPSILON).ceil().max(0.0) as usize
            } else {
                0
            };
            if to_boundary == 0 {
                self.chunk_boundary(ctx, rate);
                continue;
            }

            let n = (frames - done).min(to_boundary);
            Self::render_voices(
                &mut self.playback,
                ctx,
                rate,
                &mut self.block[done * ch..(done + n) * ch],
                ch,
            );
            self.blend_tail(ctx.taper, done, done + n);
            self.sample += n as f64 * rate;
            self.phase = (self.sample - region.start as f64) / region.length as f64;
            done += n;

            if n == to_boundary {
                self.chunk_boundary(ctx, rate);
            }
        }
        // A stopped track still fades out whatever tail is left
        self.blend_tail(ctx.taper, done, frames);

        self.filter.process(&mut self.block);
        self.delay.process(&mut self.block);
        for (out, &s) in bus.iter_mut().zip(&self.block) {
            *out += s;
        }
        self.publish();
    }

    /// Rate for this segment, eased from the previous rate while crossfading
    fn current_rate(&self, ctx: &RenderContext, region: Region) -> f64 {
        let base = self.playback.base_rate(region, ctx.cycle_frames);
        if self.overlap_index < self.crossfade && self.prev_rate > 0.0 {
            let a = ctx.taper[self.overlap_index] as f64;
            self.prev_rate + (base - self.prev_rate) * a
        } else {
            base
        }
    }

    /// Sum every live source of `playback` into interleaved `dst`
    fn render_voices(
        playback: &mut MixTrackPlayback,
        ctx: &mut RenderContext,
        rate: f64,
        dst: &mut [f32],
        channels: usize,
    ) {
        let frames = dst.len() / channels;
        let track_gain = if playback.muted { 0.0 } else { playback.volume };
        let sources = ctx.sources;

        for slot in playback.slots.iter_mut() {
            if slot.config.destroy {
                continue;
            }
            let Some(source) = sources
                .iter()
                .find(|s| **s.id() == *slot.id && s.lifecycle().is_live())
            else {
                bump(&ctx.stats.silent_voices);
                continue;
            };

            let gain = track_gain * slot.config.volume;
            let src_channels = source.channel_count();
            for vc in 0..src_channels.min(channels) {
                let Some(voice) = slot.voice.channel_mut(vc) else {
                    continue;
                };
                let buf = &mut ctx.scratch[..frames];
                source.advance(voice, vc, rate, ctx.vocoder, buf);
                // Output channel c takes source channel c % src_channels
                for c in (vc..channels).step_by(src_channels) {
                    for (f, &s) in buf.iter().enumerate() {
                        dst[f * channels + c] += s * gain;
                    }
                }
            }
        }
    }

    /// Blend block frames `from..to` over the outgoing tail
    fn blend_tail(&mut self, taper: &[f32], from: usize, to: usize) {
        let ch = self.channels;
        for f in from..to {
            if self.overlap_index >= self.crossfade {
                break;
            }
            let a = taper[self.overlap_index];
            let tail = &self.tail[self.overlap_index * ch..(self.overlap_index + 1) * ch];
            for (s, &t) in self.block[f * ch..(f + 1) * ch].iter_mut().zip(tail) {
                *s = *s * a + t * (1.0 - a);
            }
            self.overlap_index += 1;
        }
        self.playback.alpha = if self.overlap_index >= self.crossfade {
            1.0
        } else {
            taper[self.overlap_index]
        };
    }

    /// Render the outgoing continuation into the tail and restart the crossfade.
    ///
    /// An unfinished earlier tail is folded in so back-to-back transitions
    /// stay continuous.
    fn capture_tail(&mut self, ctx: &mut RenderContext, rate: f64) {
        let ch = self.channels;
        self.tail_next.fill(0.0);
        if self.playback.playing && rate.is_finite() && rate > 0.0 {
            Self::render_voices(&mut self.playback, ctx, rate, &mut self.tail_next, ch);
        }

        let start = self.overlap_index.min(self.crossfade);
        for i in 0..self.crossfade - start {
            let a = ctx.taper[start + i];
            let old = &self.tail[(start + i) * ch..(start + i + 1) * ch];
            for (s, &t) in self.tail_next[i * ch..(i + 1) * ch].iter_mut().zip(old) {
                *s = *s * a + t * (1.0 - a);
            }
        }

        std::mem::swap(&mut self.tail, &mut self.tail_next);
        self.overlap_index = 0;
        self.playback.alpha = ctx.taper[0];
    }

    /// Handle reaching the end of the current chunk
    fn chunk_boundary(&mut self, ctx: &mut RenderContext, rate: f64) {
        if self.next_playback.as_ref().is_some_and(|n| n.next_at_chunk) {
            self.swap(ctx, true);
            return;
        }

        let Some(finished) = self.playback.current_region() else {
            return;
        };
        let pb = &mut self.playback;
        if pb.aperiodic {
            if !pb.looping {
                self.stop(ctx, rate);
                return;
            }
        } else if pb.chunk_index + 1 < pb.chunks.len() {
            pb.chunk_index += 1;
        } else if pb.looping {
            pb.chunk_index = 0;
        } else {
            self.stop(ctx, rate);
            return;
        }

        let Some(region) = self.playback.current_region() else {
            return;
        };
        if region.start == finished.end() && !self.playback.aperiodic {
            // Contiguous regions: keep reading, no seam to hide
            return;
        }
        // Carry the overshoot past the seam so stretched chunks stay on the cycle
        let overshoot = ((self.sample - finished.end() as f64) / rate).max(0.0);
        self.capture_tail(ctx, rate);
        let next_rate = self.playback.base_rate(region, ctx.cycle_frames);
        self.sample = region.start as f64 + overshoot * next_rate;
        self.phase = (self.sample - region.start as f64) / region.length as f64;
        let sample = self.sample;
        self.playback.seek_voices(sample);
    }

    fn stop(&mut self, ctx: &mut RenderContext, rate: f64) {
        self.capture_tail(ctx, rate);
        self.playback.playing = false;
    }

    /// Replace the current playback with the pending one
    fn swap(&mut self, ctx: &mut RenderContext, at_boundary: bool) {
        let Some(mut next) = self.next_playback.take() else {
            return;
        };

        let was_playing = self.playback.playing;
        let old_region = self.playback.current_region();
        let old_rate = old_region
            .map(|r| self.current_rate(ctx, r))
            .filter(|r| r.is_finite() && *r > 0.0)
            .unwrap_or(0.0);
        self.capture_tail(ctx, old_rate);

        let new_region = next.current_region();
        let continues = !at_boundary && was_playing && old_region == new_region;
        let resumes = !was_playing && next.unpause;
        next.unpause = false;

        let old = std::mem::replace(&mut self.playback, next);
        if let Some(region) = new_region {
            let inside = self.sample >= region.start as f64 && self.sample < region.end() as f64;
            if !((continues || resumes) && inside) {
                self.sample = region.start as f64;
            }
            self.phase = (self.sample - region.start as f64) / region.length as f64;
        }
        if self.playback.playing {
            let sample = self.sample;
            self.playback.seek_voices(sample);
        }

        self.prev_rate = if was_playing { old_rate } else { 0.0 };
        if !was_playing && !resumes {
            // Fresh start: no echo or filter memory from the last run
            self.filter.reset();
            self.delay.reset();
        }
        self.apply_effects();
        ctx.outbox.retire(Retired::Playback(old), ctx.stats);
        self.shared.swaps.fetch_add(1, Ordering::Release);
    }

    fn apply_effects(&mut self) {
        self.filter.set_taps(self.playback.filter_taps);
        self.delay
            .set_params(self.playback.delay_frames, self.playback.delay_gain);
    }

    fn publish(&self) {
        let s = &self.shared;
        s.sample.store(self.sample.to_bits(), Ordering::Relaxed);
        s.chunk_index
            .store(self.playback.chunk_index, Ordering::Relaxed);
        s.playing.store(self.playback.playing, Ordering::Relaxed);
        s.has_next
            .store(self.next_playback.is_some(), Ordering::Relaxed);
        s.alpha.store(self.playback.alpha.to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handles(sources: &[Source]) -> HashMap<Arc<str>, SourceHandle> {
        sources.iter().map(|s| (s.id().clone(), s.handle())).collect()
    }

    fn params(chunks: Vec<usize>) -> PlaybackParams {
        PlaybackParams {
            sources: vec![("a".to_string(), MixTrackSourceConfig::default())],
            chunks,
            playing: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_build_checks_chunks() {
        let config = EngineConfig::default();
        let src = Source::new("a", vec![vec![0.0; 3000]])
            .unwrap()
            .with_bounds(vec![1000, 2000])
            .unwrap();
        let map = handles(&[src]);

        let pb = MixTrackPlayback::build(&params(vec![2, 0]), &map, &config).unwrap();
        assert_eq!(pb.current_region(), Some(Region { start: 2000, length: 1000 }));

        assert_eq!(
            MixTrackPlayback::build(&params(vec![]), &map, &config).err(),
            Some(EngineError::EmptyChunks)
        );
        let mut paused = params(vec![]);
        paused.playing = false;
        assert!(MixTrackPlayback::build(&paused, &map, &config).is_ok());

        let mut bad_index = params(vec![0, 1]);
        bad_index.chunk_index = 2;
        assert_eq!(
            MixTrackPlayback::build(&bad_index, &map, &config).err(),
            Some(EngineError::InvalidChunkIndex { index: 2, chunks: 2 })
        );
    }

    #[test]
    fn test_build_checks_sources_and_params() {
        let config = EngineConfig::default();
        let src = Source::new("a", vec![vec![0.0; 100]]).unwrap();
        src.lifecycle().mark_removed();
        let map = handles(&[src]);
        assert_eq!(
            MixTrackPlayback::build(&params(vec![0]), &map, &config).err(),
            Some(EngineError::UnknownSource("a".to_string()))
        );

        let map = handles(&[Source::new("a", vec![vec![0.0; 100]]).unwrap()]);
        let mut twice = params(vec![0]);
        twice.sources.push(("a".to_string(), MixTrackSourceConfig::default()));
        assert_eq!(
            MixTrackPlayback::build(&twice, &map, &config).err(),
            Some(EngineError::DuplicateId("a".to_string()))
        );

        let mut bad_rate = params(vec![0]);
        bad_rate.rate = 0.0;
        assert!(matches!(
            MixTrackPlayback::build(&bad_rate, &map, &config),
            Err(EngineError::InvalidParameter { name: "rate", .. })
        ));
        let mut bad_gain = params(vec![0]);
        bad_gain.delay_gain = 1.0;
        assert!(MixTrackPlayback::build(&bad_gain, &map, &config).is_err());
    }

    #[test]
    fn test_cycle_sets_rate() {
        let config = EngineConfig::default();
        let map = handles(&[Source::new("a", vec![vec![0.0; 1000]]).unwrap()]);
        let mut p = params(vec![0]);
        let pb = MixTrackPlayback::build(&p, &map, &config).unwrap();
        let region = Region { start: 0, length: 1000 };
        assert_eq!(pb.base_rate(region, Some(500)), 2.0);
        assert_eq!(pb.base_rate(region, None), 1.0);

        p.aperiodic = true;
        p.rate = 0.5;
        let pb = MixTrackPlayback::build(&p, &map, &config).unwrap();
        assert_eq!(pb.base_rate(region, Some(500)), 0.5);
    }
}
