//! Looper - headless loop engine host
//!
//! A clock thread stands in for the audio device: it pulls one period at a
//! time from the engine and pushes it through a lock-free ring to a meter
//! thread. The main thread is the control side and runs a short scripted
//! session: build loops, play them, record, slice the take and clean up.

use std::f32::consts::PI;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use looper_analysis::{Levels, WaveformPyramid};
use looper_audio::{
    AudioEngine, EngineConfig, MixTrackSourceConfig, PlaybackParams, RecordMode, Source,
    StreamState, TransportUpdate,
};

/// Control loop interval
const MAINTAIN_INTERVAL: Duration = Duration::from_millis(20);
/// Periods of output the meter ring can hold
const METER_RING_PERIODS: usize = 64;
/// Columns in the printed waveform overview
const OVERVIEW_POINTS: usize = 48;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let (mut engine, stream) = AudioEngine::new(config.clone())?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let overflowed = Arc::new(AtomicU64::new(0));

    let ring = HeapRb::<f32>::new(config.period * config.channels * METER_RING_PERIODS);
    let (producer, consumer) = ring.split();

    let clock_handle = {
        let overflowed = overflowed.clone();
        thread::Builder::new()
            .name("looper-clock".into())
            .spawn(move || run_clock(stream, producer, overflowed))
            .context("spawning clock thread")?
    };
    let meter_handle = {
        let shutdown = shutdown.clone();
        let channels = config.channels;
        let sample_rate = config.sample_rate;
        thread::Builder::new()
            .name("looper-meter".into())
            .spawn(move || run_meter(consumer, channels, sample_rate, shutdown))
            .context("spawning meter thread")?
    };

    let result = run_session(&mut engine, &config);

    // Stops the clock thread through the engine's own flag
    engine.shutdown();
    let _ = clock_handle.join();
    shutdown.store(true, Ordering::SeqCst);
    let _ = meter_handle.join();

    let dropped = overflowed.load(Ordering::Relaxed);
    if dropped > 0 {
        warn!(samples = dropped, "Meter ring overflowed");
    }
    engine.collect_garbage();
    result
}

/// Config from the path given on the command line, else the user config file.
/// A missing user config is written out with defaults so it can be edited.
fn load_config() -> anyhow::Result<EngineConfig> {
    if let Some(path) = std::env::args().nth(1).map(PathBuf::from) {
        let config = EngineConfig::load_from(&path)
            .with_context(|| format!("loading config {}", path.display()))?;
        info!(path = %path.display(), "Config loaded");
        return Ok(config);
    }

    let path = EngineConfig::config_path();
    if path.exists() {
        let config = EngineConfig::load_from(&path)
            .with_context(|| format!("loading config {}", path.display()))?;
        info!(path = %path.display(), "Config loaded");
        return Ok(config);
    }

    let config = EngineConfig::default();
    match config.save_to(&path) {
        Ok(()) => info!(path = %path.display(), "Wrote default config"),
        Err(e) => debug!(error = %e, "Could not write default config"),
    }
    Ok(config)
}

/// Render thread: one period per period of wall time, until the engine shuts down
fn run_clock(mut stream: StreamState, mut producer: HeapProd<f32>, overflowed: Arc<AtomicU64>) {
    let config = stream.config().clone();
    let period = Duration::from_secs_f64(config.period as f64 / config.sample_rate as f64);
    let mut block = vec![0.0f32; config.period * config.channels];
    let mut next = Instant::now();

    while !stream.is_shutdown() {
        stream.process(&mut block);
        let pushed = producer.push_slice(&block);
        if pushed < block.len() {
            overflowed.fetch_add((block.len() - pushed) as u64, Ordering::Relaxed);
        }

        next += period;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else {
            // Fell behind; don't try to catch up with a burst
            next = now;
        }
    }
}

/// Meter thread: logs output level once per second of audio
fn run_meter(
    mut consumer: HeapCons<f32>,
    channels: usize,
    sample_rate: u32,
    shutdown: Arc<AtomicBool>,
) {
    let window = sample_rate as usize * channels;
    let mut pending: Vec<f32> = Vec::with_capacity(window);
    let mut scratch = vec![0.0f32; 4096];

    loop {
        let done = shutdown.load(Ordering::Relaxed);
        while consumer.occupied_len() > 0 {
            let n = consumer.pop_slice(&mut scratch);
            for &s in &scratch[..n] {
                pending.push(s);
                if pending.len() == window {
                    if let Ok(levels) = Levels::measure(&pending) {
                        info!(
                            peak_db = %format!("{:.1}", levels.peak_db()),
                            rms_db = %format!("{:.1}", levels.rms_db()),
                            "Output level"
                        );
                    }
                    pending.clear();
                }
            }
        }
        if done {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Call `maintain` for `duration`, then log transport timing
fn pump(engine: &mut AudioEngine, duration: Duration) {
    let end = Instant::now() + duration;
    while Instant::now() < end {
        engine.maintain();
        thread::sleep(MAINTAIN_INTERVAL);
    }
    let timing = engine.timing();
    for track in &timing.tracks {
        debug!(
            track = %track.id,
            sample = track.sample as u64,
            chunk = track.chunk_index,
            swaps = track.swaps,
            "Track position"
        );
    }
    info!(
        time = %format!("{:.2}", timing.time),
        ticks = timing.ticks,
        recorded = timing.recorded_frames.unwrap_or(0),
        "Transport"
    );
}

fn run_session(engine: &mut AudioEngine, config: &EngineConfig) -> anyhow::Result<()> {
    let sr = config.sample_rate;
    let bar = sr as usize * 2;

    engine.add_source(drum_loop(sr, bar, config.channels)?)?;
    engine.add_source(pad(sr, bar, config.channels)?)?;
    engine.update_transport(TransportUpdate {
        cycle_frames: Some(Some(bar / 4)),
        ..Default::default()
    })?;

    let beat = PlaybackParams {
        sources: vec![("drums".into(), MixTrackSourceConfig::default())],
        chunks: vec![0, 1, 2, 3],
        playing: true,
        volume: 0.8,
        ..Default::default()
    };
    engine.add_track("beat", &beat)?;
    engine.add_track(
        "pad",
        &PlaybackParams {
            sources: vec![(
                "pad".into(),
                MixTrackSourceConfig {
                    volume: 0.5,
                    ..Default::default()
                },
            )],
            chunks: vec![0],
            playing: true,
            aperiodic: true,
            ..Default::default()
        },
    )?;
    pump(engine, Duration::from_secs(2));

    engine.start_recording(RecordMode::Live)?;
    for _ in 0..3 {
        pump(engine, Duration::from_secs(1));
        engine.mark_recording()?;
    }

    // Reverse the pattern at the next seam, stretch the pad and darken it
    engine.update_track(
        "beat",
        &PlaybackParams {
            chunks: vec![3, 2, 1, 0],
            next_at_chunk: true,
            ..beat.clone()
        },
    )?;
    engine.update_track(
        "pad",
        &PlaybackParams {
            sources: vec![(
                "pad".into(),
                MixTrackSourceConfig {
                    volume: 0.5,
                    ..Default::default()
                },
            )],
            chunks: vec![0],
            playing: true,
            aperiodic: true,
            rate: 0.75,
            filter: 0.2,
            delay: 0.25,
            delay_gain: 0.4,
            ..Default::default()
        },
    )?;
    pump(engine, Duration::from_secs(2));

    engine.stop_recording()?;
    let recording = loop {
        if let Some(recording) = engine.take_recording() {
            break recording;
        }
        anyhow::ensure!(
            !engine.is_shutdown(),
            "engine shut down before the recording was returned"
        );
        thread::sleep(MAINTAIN_INTERVAL);
    };

    let take = recording.read_range(0..recording.length());
    let levels = Levels::measure_channels(&take)?;
    info!(
        frames = recording.length(),
        slices = recording.slices().len(),
        peak_db = %format!("{:.1}", levels.peak_db()),
        rms_db = %format!("{:.1}", levels.rms_db()),
        "Recording"
    );
    let overview = WaveformPyramid::build_channels(&take)?.overview(OVERVIEW_POINTS);
    info!("Take: {}", draw_overview(&overview));

    // Loop the second slice of the take on its own
    engine.add_recording_slice(&recording, 1, "take-1")?;
    engine.remove_track("beat")?;
    engine.add_track(
        "take",
        &PlaybackParams {
            sources: vec![("take-1".into(), MixTrackSourceConfig::default())],
            chunks: vec![0],
            playing: true,
            aperiodic: true,
            ..Default::default()
        },
    )?;
    pump(engine, Duration::from_secs(2));

    for id in ["take", "pad"] {
        engine.remove_track(id)?;
    }
    for id in ["drums", "pad", "take-1"] {
        engine.remove_source(id)?;
    }
    let deadline = Instant::now() + Duration::from_secs(1);
    while engine.pending_reclamation() > 0 && Instant::now() < deadline {
        engine.maintain();
        thread::sleep(MAINTAIN_INTERVAL);
    }
    info!(
        pending = engine.pending_reclamation(),
        stats = ?engine.stats(),
        "Session finished"
    );
    Ok(())
}

/// Four decaying tones, one region per beat
fn drum_loop(sample_rate: u32, frames: usize, channels: usize) -> anyhow::Result<Source> {
    let beat = frames / 4;
    let sr = sample_rate as f32;
    let pitches = [55.0f32, 110.0, 82.4, 165.0];
    let mono: Vec<f32> = (0..frames)
        .map(|i| {
            let n = i / beat;
            let t = (i % beat) as f32 / sr;
            let f = pitches[n.min(3)];
            (2.0 * PI * f * t).sin() * (-t * 12.0).exp() * 0.9
        })
        .collect();
    let data = vec![mono; channels.clamp(1, 2)];
    Ok(Source::new("drums", data)?.with_bounds(vec![beat, beat * 2, beat * 3])?)
}

/// Slow major chord with a little stereo spread
fn pad(sample_rate: u32, frames: usize, channels: usize) -> anyhow::Result<Source> {
    let sr = sample_rate as f32;
    let chord = [220.0f32, 277.2, 329.6];
    let data: Vec<Vec<f32>> = (0..channels.clamp(1, 2))
        .map(|c| {
            let detune = 1.0 + c as f32 * 0.002;
            (0..frames)
                .map(|i| {
                    let t = i as f32 / sr;
                    chord
                        .iter()
                        .map(|f| (2.0 * PI * f * detune * t).sin())
                        .sum::<f32>()
                        / chord.len() as f32
                })
                .collect()
        })
        .collect();
    Ok(Source::new("pad", data)?)
}

fn draw_overview(points: &[(f32, f32)]) -> String {
    const BARS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
    points
        .iter()
        .map(|&(min, max)| {
            let level = max.max(-min).clamp(0.0, 1.0);
            BARS[((level * (BARS.len() - 1) as f32).round() as usize).min(BARS.len() - 1)]
        })
        .collect()
}
