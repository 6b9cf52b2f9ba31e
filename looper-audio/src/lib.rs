//! Real-time loop engine - sources, mix tracks, and the render pipeline
//!
//! This crate provides the core audio processing pipeline:
//! - Source: Decoded audio split into regions, with per-channel FIR taps
//! - Track: Chunk sequencing, playback swaps and crossfades
//! - Timestretcher: Phase vocoder for pitch-independent tempo
//! - Effects: Track low-pass and delay line
//! - Recording: Chunked capture with slice marks
//! - Engine: Control handle and render-side stream state

pub mod config;
mod effects;
mod engine;
mod error;
pub mod lifecycle;
mod mixer;
mod recording;
pub mod ringbuffer;
mod source;
pub mod timestretcher;
mod track;

pub use config::{ConfigError, EngineConfig, MAX_CROSSFADE_PERIODS};
pub use effects::{DelayLine, Effect, FilterTaps, FirFilter, FirState, MAX_FIR_TAPS};
pub use engine::{
    AudioCommand, AudioEngine, AudioEvent, EngineStats, Retired, StatsSnapshot, StreamState,
    Timing, TrackTiming,
};
pub use error::EngineError;
pub use lifecycle::{Lifecycle, LifecycleState};
pub use mixer::{crossfade_taper, soft_clip, MasterBus, Playback, TransportShared, TransportUpdate};
pub use recording::{RecordChunk, RecordMode, Recording, RecordingShared};
pub use ringbuffer::RingBuffer;
pub use source::{
    regions_from_bounds, Region, Source, SourceHandle, SourceVoice, VoiceChannel,
    MAX_SOURCE_CHANNELS,
};
pub use timestretcher::{PhaseVocoder, PhaseVocoderState, Varispeed};
pub use track::{MixTrack, MixTrackPlayback, MixTrackSourceConfig, PlaybackParams, TrackShared};
