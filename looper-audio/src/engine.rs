//! Audio engine - render-side stream state and the control-side handle
//!
//! [`AudioEngine::new`] returns a pair: the [`AudioEngine`] handle used by the
//! control thread and the [`StreamState`] that the audio callback drives via
//! [`StreamState::process`]. They talk only through bounded channels and
//! atomics:
//!
//! - commands carry fully built objects to the render side
//! - events carry every object the render side lets go back to the control
//!   side, so memory is only ever released off the audio thread
//! - [`Lifecycle`](crate::lifecycle::Lifecycle) flags request and acknowledge
//!   removals

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::effects::FilterTaps;
use crate::error::EngineError;
use crate::mixer::{crossfade_taper, MasterBus, Playback, TransportShared, TransportUpdate};
use crate::recording::{RecordChunk, RecordMode, Recording, RecordingShared};
use crate::ringbuffer::RingBuffer;
use crate::source::{Source, SourceHandle};
use crate::timestretcher::PhaseVocoder;
use crate::track::{MixTrack, MixTrackPlayback, PlaybackParams, RenderContext, TrackShared};

/// Spare record chunks kept queued while a recording runs
const SPARE_RECORD_CHUNKS: usize = 2;

/// Commands sent to the render side
pub enum AudioCommand {
    AddSource(Box<Source>),
    SetSourceFilter {
        id: Arc<str>,
        channel: usize,
        taps: FilterTaps,
    },
    AddTrack(Box<MixTrack>),
    /// Queue a pending playback on a track
    UpdateTrack {
        id: Arc<str>,
        next: Box<MixTrackPlayback>,
    },
    SetTransport(TransportUpdate),
    StartRecording(Box<Recording>),
    MarkRecording,
    Shutdown,
}

/// Objects the render side no longer uses
pub enum Retired {
    Source(Box<Source>),
    Track(Box<MixTrack>),
    Playback(Box<MixTrackPlayback>),
    Id(Arc<str>),
}

/// Events sent from the render side
pub enum AudioEvent {
    Retired(Retired),
    RecordingStopped(Box<Recording>),
}

/// Render-side diagnostics. The render path only counts; the control side
/// logs the counters from [`AudioEngine::maintain`].
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Voices rendered as silence (missing source, no chunk, bad rate)
    pub(crate) silent_voices: AtomicU64,
    pub(crate) dropped_marks: AtomicU64,
    /// Record frames lost for lack of a spare chunk
    pub(crate) truncated_frames: AtomicU64,
    /// Events parked because the event queue was full
    pub(crate) deferred_retirements: AtomicU64,
    /// Objects that had to be dropped on the render thread
    pub(crate) render_deallocations: AtomicU64,
    /// Commands addressing objects the render side doesn't have
    pub(crate) unknown_targets: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub silent_voices: u64,
    pub dropped_marks: u64,
    pub truncated_frames: u64,
    pub deferred_retirements: u64,
    pub render_deallocations: u64,
    pub unknown_targets: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            silent_voices: load(&self.silent_voices),
            dropped_marks: load(&self.dropped_marks),
            truncated_frames: load(&self.truncated_frames),
            deferred_retirements: load(&self.deferred_retirements),
            render_deallocations: load(&self.render_deallocations),
            unknown_targets: load(&self.unknown_targets),
        }
    }
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Render-side sender for events, with a pre-reserved overflow list
pub(crate) struct Outbox {
    tx: Sender<AudioEvent>,
    overflow: Vec<AudioEvent>,
}

impl Outbox {
    fn new(tx: Sender<AudioEvent>, capacity: usize) -> Self {
        Self {
            tx,
            overflow: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn retire(&mut self, item: Retired, stats: &EngineStats) {
        self.send(AudioEvent::Retired(item), stats);
    }

    pub(crate) fn send(&mut self, event: AudioEvent, stats: &EngineStats) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                bump(&stats.deferred_retirements);
                if self.overflow.len() < self.overflow.capacity() {
                    self.overflow.push(event);
                } else {
                    bump(&stats.render_deallocations);
                    drop(event);
                }
            }
            Err(TrySendError::Disconnected(event)) => {
                bump(&stats.render_deallocations);
                drop(event);
            }
        }
    }

    /// Retry parked events
    fn flush(&mut self, stats: &EngineStats) {
        while let Some(event) = self.overflow.pop() {
            match self.tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.overflow.push(event);
                    break;
                }
                Err(TrySendError::Disconnected(event)) => {
                    bump(&stats.render_deallocations);
                    drop(event);
                }
            }
        }
    }
}

/// Engine state held by the audio thread
pub struct StreamState {
    config: EngineConfig,
    commands: Receiver<AudioCommand>,
    outbox: Outbox,
    chunk_pool: Receiver<Box<RecordChunk>>,
    playback: Playback,
    master: MasterBus,
    previewing: bool,
    /// Staged output, drained by `process`
    output: RingBuffer,
    /// Cue bus, drained by `read_preview`
    preview: RingBuffer,
    /// Crossfade window shared by every track
    taper: Vec<f32>,
    vocoder: PhaseVocoder,
    sources: Vec<Box<Source>>,
    tracks: Vec<Box<MixTrack>>,
    recording: Option<Box<Recording>>,
    mix: Vec<f32>,
    cue: Vec<f32>,
    capture_buf: Vec<f32>,
    scratch: Vec<f32>,
    ticks: u64,
    /// Shared with the control handle
    shutdown: Arc<AtomicBool>,
    transport: Arc<TransportShared>,
    stats: Arc<EngineStats>,
}

impl StreamState {
    /// Fill `output` (interleaved, engine channel count) with rendered audio.
    /// Runs as many ticks as needed; never blocks.
    pub fn process(&mut self, output: &mut [f32]) {
        let ch = self.config.channels;
        let frames = output.len() / ch;
        let mut written = 0;
        while written < frames {
            if self.output.is_empty() {
                self.tick();
            }
            written += self.output.read(&mut output[written * ch..frames * ch]);
        }
        // Partial trailing frame
        output[frames * ch..].fill(0.0);
    }

    /// Drain the preview bus into `output`, padding with silence.
    /// Returns frames of real preview audio.
    pub fn read_preview(&mut self, output: &mut [f32]) -> usize {
        let ch = self.config.channels;
        let frames = self.preview.read(output);
        output[frames * ch..].fill(0.0);
        frames
    }

    /// Render one period into the output buffer
    pub fn tick(&mut self) {
        self.outbox.flush(&self.stats);
        while let Ok(cmd) = self.commands.try_recv() {
            self.handle_command(cmd);
        }

        self.mix.fill(0.0);
        self.cue.fill(0.0);

        if self.playback.playing {
            let Self {
                tracks,
                sources,
                vocoder,
                scratch,
                taper,
                outbox,
                stats,
                mix,
                cue,
                playback,
                ..
            } = self;
            let mut ctx = RenderContext {
                sources: sources.as_slice(),
                vocoder,
                scratch: scratch.as_mut_slice(),
                taper: taper.as_slice(),
                cycle_frames: playback.cycle_frames,
                stats: &**stats,
                outbox,
            };
            // Table order is insertion order, so the mix is deterministic
            for track in tracks.iter_mut() {
                if !track.shared().lifecycle().is_live() {
                    continue;
                }
                let bus = if track.is_preview() {
                    cue.as_mut_slice()
                } else {
                    mix.as_mut_slice()
                };
                track.render(&mut ctx, bus);
            }
            self.capture();
        }

        // Preview audio never reaches the recording
        self.preview.write(&self.cue);
        if self.previewing {
            for (m, &c) in self.mix.iter_mut().zip(&self.cue) {
                *m += c;
            }
        }

        let peak = self.master.process(&mut self.mix, self.config.channels);
        self.playback.max_level = self.playback.max_level.max(peak);
        self.transport.raise_peak(peak);
        self.output.try_write(&self.mix);

        if self.playback.playing {
            self.playback.time += self.playback.period as f64 / self.config.sample_rate as f64;
        }
        self.ticks += 1;
        self.transport.publish(&self.playback, self.ticks);

        self.sweep();
    }

    fn handle_command(&mut self, cmd: AudioCommand) {
        match cmd {
            AudioCommand::AddSource(source) => {
                if self.sources.len() < self.sources.capacity() {
                    self.sources.push(source);
                } else {
                    bump(&self.stats.unknown_targets);
                    self.outbox.retire(Retired::Source(source), &self.stats);
                }
            }
            AudioCommand::SetSourceFilter { id, channel, taps } => {
                let target = self
                    .sources
                    .iter_mut()
                    .find(|s| **s.id() == *id && s.lifecycle().is_live());
                match target {
                    Some(source) => {
                        if !source.set_filter(channel, taps) {
                            bump(&self.stats.unknown_targets);
                        }
                    }
                    None => {
                        bump(&self.stats.unknown_targets);
                        self.outbox.retire(Retired::Id(id), &self.stats);
                    }
                }
            }
            AudioCommand::AddTrack(track) => {
                if self.tracks.len() < self.tracks.capacity() {
                    self.tracks.push(track);
                } else {
                    bump(&self.stats.unknown_targets);
                    self.outbox.retire(Retired::Track(track), &self.stats);
                }
            }
            AudioCommand::UpdateTrack { id, next } => {
                let target = self
                    .tracks
                    .iter_mut()
                    .find(|t| **t.id() == *id && t.shared().lifecycle().is_live());
                match target {
                    Some(track) => track.set_next(next, &mut self.outbox, &self.stats),
                    None => {
                        bump(&self.stats.unknown_targets);
                        self.outbox.retire(Retired::Playback(next), &self.stats);
                        self.outbox.retire(Retired::Id(id), &self.stats);
                    }
                }
            }
            AudioCommand::SetTransport(update) => {
                self.playback.apply(&update);
                self.master.set_volume(self.playback.volume);
                if let Some(previewing) = update.previewing {
                    self.previewing = previewing;
                }
            }
            AudioCommand::StartRecording(recording) => {
                if let Some(old) = self.recording.take() {
                    self.stop_recording(old);
                }
                self.recording = Some(recording);
            }
            AudioCommand::MarkRecording => match self.recording.as_mut() {
                Some(rec) if rec.shared().lifecycle().is_live() => {
                    if !rec.mark() {
                        bump(&self.stats.dropped_marks);
                    }
                }
                _ => bump(&self.stats.dropped_marks),
            },
            AudioCommand::Shutdown => self.shutdown.store(true, Ordering::Relaxed),
        }
    }

    /// Append this tick's audio to the active recording
    fn capture(&mut self) {
        let Some(rec) = self.recording.as_mut() else {
            return;
        };
        if !rec.shared().lifecycle().is_live() {
            return;
        }

        let ch = self.config.channels;
        let live = matches!(rec.mode(), RecordMode::Live);
        if let RecordMode::Resynthesis { source_id, offset } = rec.mode() {
            let start = offset + rec.length();
            self.capture_buf.fill(0.0);
            match self
                .sources
                .iter()
                .find(|s| **s.id() == **source_id && s.lifecycle().is_live())
            {
                Some(source) => {
                    let frames = self.capture_buf.len() / ch;
                    for c in 0..ch {
                        let data = source.channel(c);
                        for f in 0..frames {
                            if let Some(&s) = data.get(start + f) {
                                self.capture_buf[f * ch + c] = s;
                            }
                        }
                    }
                }
                None => bump(&self.stats.silent_voices),
            }
        }

        let pool = &self.chunk_pool;
        let input = if live { &self.mix } else { &self.capture_buf };
        let dropped = rec.append(input, || pool.try_recv().ok());
        if dropped > 0 {
            self.stats
                .truncated_frames
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
    }

    fn stop_recording(&mut self, mut recording: Box<Recording>) {
        recording.finish();
        recording.shared().lifecycle.mark_safe();
        self.outbox
            .send(AudioEvent::RecordingStopped(recording), &self.stats);
    }

    /// Hand removed objects back and acknowledge them
    fn sweep(&mut self) {
        let mut i = 0;
        while i < self.tracks.len() {
            if self.tracks[i].shared().lifecycle().is_removed() {
                let track = self.tracks.remove(i);
                // Safe first: after this the box is only ever touched by its new owner
                track.shared().lifecycle().mark_safe();
                self.outbox.retire(Retired::Track(track), &self.stats);
            } else {
                i += 1;
            }
        }

        let mut i = 0;
        while i < self.sources.len() {
            if self.sources[i].lifecycle().is_removed() {
                let source = self.sources.remove(i);
                source.lifecycle().mark_safe();
                self.outbox.retire(Retired::Source(source), &self.stats);
            } else {
                i += 1;
            }
        }

        let stopped = self
            .recording
            .as_ref()
            .is_some_and(|r| r.shared().lifecycle().is_removed());
        if stopped {
            if let Some(recording) = self.recording.take() {
                self.stop_recording(recording);
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn playback(&self) -> &Playback {
        &self.playback
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Per-track timing as seen from the control side
#[derive(Debug, Clone, PartialEq)]
pub struct TrackTiming {
    pub id: String,
    pub sample: f64,
    pub chunk_index: usize,
    pub playing: bool,
    pub pending_swap: bool,
    pub alpha: f32,
    pub swaps: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    /// Transport seconds
    pub time: f64,
    pub ticks: u64,
    pub playing: bool,
    pub recorded_frames: Option<usize>,
    pub tracks: Vec<TrackTiming>,
}

struct TrackHandle {
    id: Arc<str>,
    shared: Arc<TrackShared>,
}

/// Handle to communicate with the audio engine
pub struct AudioEngine {
    config: EngineConfig,
    command_tx: Sender<AudioCommand>,
    event_rx: Receiver<AudioEvent>,
    chunk_tx: Sender<Box<RecordChunk>>,
    sources: HashMap<Arc<str>, SourceHandle>,
    tracks: HashMap<Arc<str>, TrackHandle>,
    recording: Option<Arc<RecordingShared>>,
    finished: VecDeque<Box<Recording>>,
    transport: Arc<TransportShared>,
    stats: Arc<EngineStats>,
    reported: StatsSnapshot,
    shutdown: Arc<AtomicBool>,
}

impl AudioEngine {
    /// Create the control handle and the render-side state it drives
    pub fn new(config: EngineConfig) -> Result<(Self, StreamState), EngineError> {
        config.validate()?;

        let capacity = config.command_capacity;
        let (command_tx, command_rx) = bounded(capacity);
        let (event_tx, event_rx) = bounded(capacity);
        let (chunk_tx, chunk_rx) = bounded(SPARE_RECORD_CHUNKS * 2);

        let transport = Arc::new(TransportShared::default());
        let stats = Arc::new(EngineStats::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let ch = config.channels;
        let block = config.period * ch;
        let playback = Playback::new(config.period);
        transport.publish(&playback, 0);

        let stream = StreamState {
            commands: command_rx,
            outbox: Outbox::new(event_tx, capacity),
            chunk_pool: chunk_rx,
            master: MasterBus::new(playback.volume, config.master_soft_clip),
            playback,
            previewing: false,
            output: RingBuffer::new(ch, config.output_capacity()),
            preview: RingBuffer::new(ch, config.output_capacity()),
            taper: crossfade_taper(config.crossfade_frames),
            vocoder: PhaseVocoder::new(config.pv_window, config.pv_overlap, config.pv_abstol),
            sources: Vec::with_capacity(config.max_sources),
            tracks: Vec::with_capacity(config.max_tracks),
            recording: None,
            mix: vec![0.0; block],
            cue: vec![0.0; block],
            capture_buf: vec![0.0; block],
            scratch: vec![0.0; config.period.max(config.crossfade_frames)],
            ticks: 0,
            shutdown: shutdown.clone(),
            transport: transport.clone(),
            stats: stats.clone(),
            config: config.clone(),
        };

        info!(
            sample_rate = config.sample_rate,
            channels = ch,
            period = config.period,
            pv_window = config.pv_window,
            "Audio engine created"
        );

        let engine = Self {
            config,
            command_tx,
            event_rx,
            chunk_tx,
            sources: HashMap::new(),
            tracks: HashMap::new(),
            recording: None,
            finished: VecDeque::new(),
            transport,
            stats,
            reported: StatsSnapshot::default(),
            shutdown,
        };
        Ok((engine, stream))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn send(&self, cmd: AudioCommand) -> Result<(), EngineError> {
        self.command_tx.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => EngineError::QueueFull,
            TrySendError::Disconnected(_) => EngineError::Disconnected,
        })
    }

    /// Publish a source
    pub fn add_source(&mut self, source: Source) -> Result<(), EngineError> {
        self.collect_garbage();
        let id = source.id().clone();
        if self.sources.contains_key(&id) {
            return Err(EngineError::DuplicateId(id.to_string()));
        }
        if self.sources.len() >= self.config.max_sources {
            return Err(EngineError::TableFull("source"));
        }

        let handle = source.handle();
        self.send(AudioCommand::AddSource(Box::new(source)))?;
        info!(
            id = %id,
            frames = handle.length,
            channels = handle.channels,
            regions = handle.bounds.len() + 1,
            "Source added"
        );
        self.sources.insert(id, handle);
        Ok(())
    }

    /// Request removal. Tracks still naming the source play silence for it.
    pub fn remove_source(&mut self, id: &str) -> Result<(), EngineError> {
        let handle = self
            .sources
            .get(id)
            .filter(|h| h.lifecycle.is_live())
            .ok_or_else(|| EngineError::UnknownSource(id.to_string()))?;
        handle.lifecycle.mark_removed();
        info!(id, "Source removal requested");
        Ok(())
    }

    /// Replace one channel's FIR taps on a source
    pub fn set_source_filter(
        &mut self,
        id: &str,
        channel: usize,
        taps: &[f32],
    ) -> Result<(), EngineError> {
        let handle = self
            .sources
            .get(id)
            .filter(|h| h.lifecycle.is_live())
            .ok_or_else(|| EngineError::UnknownSource(id.to_string()))?;
        if channel >= handle.channels {
            return Err(EngineError::ChannelMismatch(format!(
                "channel {channel} of {}-channel source",
                handle.channels
            )));
        }
        let taps = FilterTaps::new(taps).ok_or(EngineError::InvalidParameter {
            name: "taps",
            value: taps.len() as f64,
        })?;
        self.send(AudioCommand::SetSourceFilter {
            id: handle.id.clone(),
            channel,
            taps,
        })
    }

    /// Create a track playing `params`
    pub fn add_track(&mut self, id: &str, params: &PlaybackParams) -> Result<(), EngineError> {
        self.collect_garbage();
        if self.tracks.contains_key(id) {
            return Err(EngineError::DuplicateId(id.to_string()));
        }
        if self.tracks.len() >= self.config.max_tracks {
            return Err(EngineError::TableFull("track"));
        }

        let playback = MixTrackPlayback::build(params, &self.sources, &self.config)?;
        let id: Arc<str> = Arc::from(id);
        let track = MixTrack::new(id.clone(), playback, None, &self.config);
        let shared = track.shared().clone();
        self.send(AudioCommand::AddTrack(Box::new(track)))?;

        info!(id = %id, chunks = ?params.chunks, playing = params.playing, "Track added");
        self.tracks.insert(id.clone(), TrackHandle { id, shared });
        Ok(())
    }

    /// Queue `params` as the track's next playback
    pub fn update_track(&mut self, id: &str, params: &PlaybackParams) -> Result<(), EngineError> {
        let handle = self
            .tracks
            .get(id)
            .filter(|h| h.shared.lifecycle().is_live())
            .ok_or_else(|| EngineError::UnknownTrack(id.to_string()))?;
        let next = MixTrackPlayback::build(params, &self.sources, &self.config)?;
        self.send(AudioCommand::UpdateTrack {
            id: handle.id.clone(),
            next: Box::new(next),
        })?;
        debug!(id, next_at_chunk = params.next_at_chunk, "Track update queued");
        Ok(())
    }

    pub fn remove_track(&mut self, id: &str) -> Result<(), EngineError> {
        let handle = self
            .tracks
            .get(id)
            .filter(|h| h.shared.lifecycle().is_live())
            .ok_or_else(|| EngineError::UnknownTrack(id.to_string()))?;
        handle.shared.lifecycle().mark_removed();
        info!(id, "Track removal requested");
        Ok(())
    }

    /// Play, pause, set master volume, cycle length or preview routing
    pub fn update_transport(&mut self, update: TransportUpdate) -> Result<(), EngineError> {
        if let Some(volume) = update.volume {
            if !(volume.is_finite() && volume >= 0.0) {
                return Err(EngineError::InvalidParameter {
                    name: "volume",
                    value: volume as f64,
                });
            }
        }
        if let Some(Some(0)) = update.cycle_frames {
            return Err(EngineError::InvalidParameter {
                name: "cycle_frames",
                value: 0.0,
            });
        }
        self.send(AudioCommand::SetTransport(update))
    }

    /// Start capturing the mix (or a source, in resynthesis mode)
    pub fn start_recording(&mut self, mode: RecordMode) -> Result<(), EngineError> {
        if self.recording.as_ref().is_some_and(|r| !r.lifecycle().is_safe()) {
            return Err(EngineError::RecordingActive);
        }
        if let RecordMode::Resynthesis { source_id, .. } = &mode {
            if !self
                .sources
                .get(&**source_id)
                .is_some_and(|h| h.lifecycle.is_live())
            {
                return Err(EngineError::UnknownSource(source_id.to_string()));
            }
        }

        let recording = Recording::new(
            mode,
            self.config.channels,
            self.config.record_chunk_frames(),
        );
        let shared = recording.shared().clone();
        self.send(AudioCommand::StartRecording(Box::new(recording)))?;
        self.recording = Some(shared);
        self.provision_chunks();
        info!("Recording started");
        Ok(())
    }

    /// Mark a slice boundary at the current record position
    pub fn mark_recording(&mut self) -> Result<(), EngineError> {
        if !self.recording.as_ref().is_some_and(|r| r.lifecycle().is_live()) {
            return Err(EngineError::NoRecording);
        }
        self.send(AudioCommand::MarkRecording)
    }

    /// Request stop. The finished take arrives through [`AudioEngine::take_recording`].
    pub fn stop_recording(&mut self) -> Result<(), EngineError> {
        let shared = self
            .recording
            .as_ref()
            .filter(|r| r.lifecycle().is_live())
            .ok_or(EngineError::NoRecording)?;
        shared.lifecycle().mark_removed();
        info!(frames = shared.frames(), "Recording stop requested");
        Ok(())
    }

    /// Next finished recording, once the render side has handed it back
    pub fn take_recording(&mut self) -> Option<Recording> {
        self.collect_garbage();
        self.finished.pop_front().map(|r| *r)
    }

    /// Publish slice `index` of `recording` as a new source
    pub fn add_recording_slice(
        &mut self,
        recording: &Recording,
        index: usize,
        id: &str,
    ) -> Result<(), EngineError> {
        let source = recording.slice_source(index, id, self.config.pv_window)?;
        self.add_source(source)
    }

    fn provision_chunks(&self) {
        let frames = self.config.record_chunk_frames();
        while self.chunk_tx.len() < SPARE_RECORD_CHUNKS {
            let chunk = Box::new(RecordChunk::new(self.config.channels, frames));
            if self.chunk_tx.try_send(chunk).is_err() {
                break;
            }
        }
    }

    /// Release everything the render side handed back and forget handles it
    /// has acknowledged. Returns the number of objects released.
    pub fn collect_garbage(&mut self) -> usize {
        let mut released = 0;
        while let Ok(event) = self.event_rx.try_recv() {
            match event {
                AudioEvent::Retired(item) => {
                    released += 1;
                    drop(item);
                }
                AudioEvent::RecordingStopped(recording) => {
                    info!(
                        frames = recording.length(),
                        marks = recording.bounds().len(),
                        "Recording finished"
                    );
                    self.finished.push_back(recording);
                }
            }
        }

        self.sources.retain(|id, h| {
            let keep = !h.lifecycle.is_safe();
            if !keep {
                debug!(id = %id, "Source reclaimed");
            }
            keep
        });
        self.tracks.retain(|id, h| {
            let keep = !h.shared.lifecycle().is_safe();
            if !keep {
                debug!(id = %id, "Track reclaimed");
            }
            keep
        });
        if self.recording.as_ref().is_some_and(|r| r.lifecycle().is_safe()) {
            self.recording = None;
        }
        released
    }

    /// Periodic control-side housekeeping: reclaim, keep the recorder fed,
    /// report render-side diagnostics.
    pub fn maintain(&mut self) {
        self.collect_garbage();
        if self.recording.as_ref().is_some_and(|r| r.lifecycle().is_live()) {
            self.provision_chunks();
        }

        let now = self.stats.snapshot();
        let before = self.reported;
        let report = |name: &str, now: u64, before: u64| {
            if now > before {
                warn!(count = now - before, "{name}");
            }
        };
        report("Voices rendered silent", now.silent_voices, before.silent_voices);
        report("Recording marks dropped", now.dropped_marks, before.dropped_marks);
        report("Record frames truncated", now.truncated_frames, before.truncated_frames);
        report(
            "Retirements deferred (event queue full)",
            now.deferred_retirements,
            before.deferred_retirements,
        );
        report(
            "Objects dropped on the render thread",
            now.render_deallocations,
            before.render_deallocations,
        );
        report("Commands for unknown targets", now.unknown_targets, before.unknown_targets);
        self.reported = now;
    }

    /// Objects removed but not yet acknowledged by the render side
    pub fn pending_reclamation(&self) -> usize {
        self.sources
            .values()
            .filter(|h| !h.lifecycle.is_live())
            .count()
            + self
                .tracks
                .values()
                .filter(|h| !h.shared.lifecycle().is_live())
                .count()
    }

    pub fn has_source(&self, id: &str) -> bool {
        self.sources.get(id).is_some_and(|h| h.lifecycle.is_live())
    }

    pub fn has_track(&self, id: &str) -> bool {
        self.tracks
            .get(id)
            .is_some_and(|h| h.shared.lifecycle().is_live())
    }

    pub fn track_shared(&self, id: &str) -> Option<Arc<TrackShared>> {
        self.tracks.get(id).map(|h| h.shared.clone())
    }

    /// Transport and per-track positions
    pub fn timing(&self) -> Timing {
        let mut tracks: Vec<TrackTiming> = self
            .tracks
            .values()
            .filter(|h| h.shared.lifecycle().is_live())
            .map(|h| TrackTiming {
                id: h.id.to_string(),
                sample: h.shared.sample(),
                chunk_index: h.shared.chunk_index(),
                playing: h.shared.playing(),
                pending_swap: h.shared.has_next(),
                alpha: h.shared.alpha(),
                swaps: h.shared.swaps(),
            })
            .collect();
        tracks.sort_by(|a, b| a.id.cmp(&b.id));

        Timing {
            time: self.transport.time(),
            ticks: self.transport.ticks(),
            playing: self.transport.playing(),
            recorded_frames: self.recording.as_ref().map(|r| r.frames()),
            tracks,
        }
    }

    /// Read and reset the output peak meter
    pub fn take_peak(&self) -> f32 {
        self.transport.take_peak()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Check if shutdown was requested, from either side
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Request shutdown. The render side sees the flag at once; the command
    /// lets anything queued ahead of it apply first.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Err(e) = self.send(AudioCommand::Shutdown) {
            warn!(error = %e, "Shutdown command not queued");
        }
    }
}
