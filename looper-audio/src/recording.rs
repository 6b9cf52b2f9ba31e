//! Chunked capture of the rendered mix
//!
//! A [`Recording`] grows by whole [`RecordChunk`]s that the control side
//! allocates ahead of time, so appending never allocates on the render
//! thread. Marks are stored per chunk as local offsets and reported as
//! cumulative frame positions.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::EngineError;
use crate::lifecycle::Lifecycle;
use crate::source::Source;

/// Marks a single chunk can hold
pub const MAX_CHUNK_BOUNDS: usize = 256;
/// Chunks a single recording can hold
pub const MAX_RECORD_CHUNKS: usize = 512;

/// What a recording captures
#[derive(Debug, Clone, PartialEq)]
pub enum RecordMode {
    /// The summed track mix, before master volume
    Live,
    /// Source `source_id` read at native rate from `offset`
    Resynthesis { source_id: Arc<str>, offset: usize },
}

pub struct RecordChunk {
    channels: Vec<Vec<f32>>,
    used: usize,
    /// Local mark offsets, each <= `used`. A mark equal to `used` on a
    /// full chunk belongs to the start of the next one.
    bounds: Vec<usize>,
}

impl RecordChunk {
    pub fn new(channel_count: usize, size: usize) -> Self {
        Self {
            channels: (0..channel_count.max(1)).map(|_| vec![0.0; size.max(1)]).collect(),
            used: 0,
            bounds: Vec::with_capacity(MAX_CHUNK_BOUNDS),
        }
    }

    pub fn size(&self) -> usize {
        self.channels[0].len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_full(&self) -> bool {
        self.used == self.size()
    }

    pub fn bounds(&self) -> &[usize] {
        &self.bounds
    }

    /// Copy as many interleaved frames as fit. Returns frames taken.
    fn append(&mut self, interleaved: &[f32]) -> usize {
        let ch_count = self.channels.len();
        let frames = (interleaved.len() / ch_count).min(self.size() - self.used);
        for (i, frame) in interleaved.chunks_exact(ch_count).take(frames).enumerate() {
            for (ch, &s) in frame.iter().enumerate() {
                self.channels[ch][self.used + i] = s;
            }
        }
        self.used += frames;
        frames
    }
}

/// Telemetry shared with the control side
#[derive(Debug, Default)]
pub struct RecordingShared {
    pub(crate) lifecycle: Lifecycle,
    frames: AtomicUsize,
}

impl RecordingShared {
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Frames captured so far
    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::Relaxed)
    }
}

pub struct Recording {
    mode: RecordMode,
    channel_count: usize,
    chunks: Vec<Box<RecordChunk>>,
    length: usize,
    last_bound: Option<usize>,
    shared: Arc<RecordingShared>,
}

impl Recording {
    /// Start a recording with one chunk of `chunk_frames` frames
    pub fn new(mode: RecordMode, channel_count: usize, chunk_frames: usize) -> Self {
        let mut chunks = Vec::with_capacity(MAX_RECORD_CHUNKS);
        chunks.push(Box::new(RecordChunk::new(channel_count, chunk_frames)));
        Self {
            mode,
            channel_count: channel_count.max(1),
            chunks,
            length: 0,
            last_bound: None,
            shared: Arc::new(RecordingShared::default()),
        }
    }

    pub fn mode(&self) -> &RecordMode {
        &self.mode
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Frames captured
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn shared(&self) -> &Arc<RecordingShared> {
        &self.shared
    }

    /// Append interleaved frames, pulling a spare chunk from `spare` whenever
    /// the current one fills. Returns the frames that had to be dropped.
    /// A trailing partial frame is ignored.
    pub fn append(
        &mut self,
        interleaved: &[f32],
        mut spare: impl FnMut() -> Option<Box<RecordChunk>>,
    ) -> usize {
        let ch = self.channel_count;
        let whole = interleaved.len() - interleaved.len() % ch;
        let mut offset = 0;
        while offset < whole {
            let Some(current) = self.chunks.last_mut() else {
                break;
            };
            if current.is_full() {
                if self.chunks.len() == self.chunks.capacity() {
                    break;
                }
                match spare() {
                    Some(chunk) if chunk.channels.len() == ch && chunk.used == 0 => {
                        self.chunks.push(chunk)
                    }
                    _ => break,
                }
                continue;
            }
            let taken = current.append(&interleaved[offset..whole]);
            self.length += taken;
            offset += taken * ch;
        }
        self.shared.frames.store(self.length, Ordering::Relaxed);
        (whole - offset) / ch
    }

    /// Mark the current position. Returns `false` if the mark was dropped
    /// because it would not be strictly after the previous one.
    pub fn mark(&mut self) -> bool {
        if self.last_bound.is_some_and(|b| b >= self.length) {
            return false;
        }
        let Some(current) = self.chunks.last_mut() else {
            return false;
        };
        if current.bounds.len() == current.bounds.capacity() {
            return false;
        }
        current.bounds.push(current.used);
        self.last_bound = Some(self.length);
        true
    }

    /// Drop marks that never got audio after them
    pub fn finish(&mut self) {
        let length = self.length;
        let mut start = 0;
        for chunk in &mut self.chunks {
            chunk.bounds.retain(|&b| start + b < length);
            start += chunk.used;
        }
    }

    /// Cumulative mark positions
    pub fn bounds(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut start = 0;
        for chunk in &self.chunks {
            out.extend(chunk.bounds.iter().map(|b| start + b));
            start += chunk.used;
        }
        out
    }

    /// Frame ranges between recording start, each mark and recording end.
    /// Empty ranges are skipped.
    pub fn slices(&self) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        let mut start = 0;
        for b in self.bounds().into_iter().chain(std::iter::once(self.length)) {
            let b = b.min(self.length);
            if b > start {
                ranges.push(start..b);
                start = b;
            }
        }
        ranges
    }

    /// Copy a frame range out as one array per channel
    pub fn read_range(&self, range: Range<usize>) -> Vec<Vec<f32>> {
        let end = range.end.min(self.length);
        let start = range.start.min(end);
        let mut out: Vec<Vec<f32>> = (0..self.channel_count)
            .map(|_| Vec::with_capacity(end - start))
            .collect();

        let mut chunk_start = 0;
        for chunk in &self.chunks {
            let chunk_end = chunk_start + chunk.used;
            let lo = start.max(chunk_start);
            let hi = end.min(chunk_end);
            if lo < hi {
                for (ch, dst) in out.iter_mut().enumerate() {
                    dst.extend_from_slice(&chunk.channels[ch][lo - chunk_start..hi - chunk_start]);
                }
            }
            chunk_start = chunk_end;
        }
        out
    }

    /// Turn slice `index` into a new source
    pub fn slice_source(
        &self,
        index: usize,
        id: impl Into<Arc<str>>,
        min_length: usize,
    ) -> Result<Source, EngineError> {
        let slices = self.slices();
        let range = slices
            .get(index)
            .cloned()
            .ok_or(EngineError::SliceOutOfRange {
                index,
                slices: slices.len(),
            })?;
        if range.len() < min_length {
            return Err(EngineError::SliceTooShort {
                length: range.len(),
                min: min_length,
            });
        }
        Source::new(id, self.read_range(range))
    }

    /// Turn the whole take into one source whose bounds are the marks
    pub fn to_source(&self, id: impl Into<Arc<str>>) -> Result<Source, EngineError> {
        if self.length == 0 {
            return Err(EngineError::EmptySource);
        }
        let bounds: Vec<usize> = self
            .bounds()
            .into_iter()
            .filter(|&b| b > 0 && b < self.length)
            .collect();
        Source::new(id, self.read_range(0..self.length))?.with_bounds(bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(count: usize, value: f32) -> Vec<f32> {
        vec![value; count * 2]
    }

    #[test]
    fn test_append_spills_into_spare_chunks() {
        let mut rec = Recording::new(RecordMode::Live, 2, 100);
        let mut pool = vec![Box::new(RecordChunk::new(2, 100))];

        let dropped = rec.append(&frames(150, 0.5), || pool.pop());
        assert_eq!(dropped, 0);
        assert_eq!(rec.length(), 150);
        assert_eq!(rec.chunk_count(), 2);
        assert_eq!(rec.shared().frames(), 150);
    }

    #[test]
    fn test_append_truncates_without_spare() {
        let mut rec = Recording::new(RecordMode::Live, 2, 100);
        let dropped = rec.append(&frames(130, 0.5), || None);
        assert_eq!(dropped, 30);
        assert_eq!(rec.length(), 100);
    }

    #[test]
    fn test_append_ignores_partial_frame() {
        let mut rec = Recording::new(RecordMode::Live, 2, 100);
        let dropped = rec.append(&[0.1, 0.2, 0.3], || None);
        assert_eq!(dropped, 0);
        assert_eq!(rec.length(), 1);
        assert_eq!(rec.read_range(0..1), vec![vec![0.1], vec![0.2]]);

        // Nothing but a partial frame
        assert_eq!(rec.append(&[0.4], || None), 0);
        assert_eq!(rec.length(), 1);
    }

    #[test]
    fn test_bounds_and_slices() {
        let mut rec = Recording::new(RecordMode::Live, 2, 120);
        let mut pool: Vec<Box<RecordChunk>> =
            (0..3).map(|_| Box::new(RecordChunk::new(2, 120))).collect();

        assert!(rec.mark());
        rec.append(&frames(100, 0.1), || pool.pop());
        assert!(rec.mark());
        rec.append(&frames(150, 0.2), || pool.pop());
        assert!(rec.mark());
        rec.append(&frames(50, 0.3), || pool.pop());
        rec.finish();

        assert_eq!(rec.bounds(), vec![0, 100, 250]);
        let lengths: Vec<usize> = rec.slices().iter().map(|r| r.len()).collect();
        assert_eq!(lengths, vec![100, 150, 50]);

        // The 150-frame slice straddles a chunk seam
        let slice = rec.read_range(100..250);
        assert_eq!(slice[0].len(), 150);
        assert!(slice[1].iter().all(|&s| s == 0.2));
    }

    #[test]
    fn test_duplicate_mark_dropped() {
        let mut rec = Recording::new(RecordMode::Live, 1, 64);
        rec.append(&[0.0; 10], || None);
        assert!(rec.mark());
        assert!(!rec.mark());
        rec.append(&[0.0; 1], || None);
        assert!(rec.mark());
        assert_eq!(rec.bounds(), vec![10, 11]);
    }

    #[test]
    fn test_trailing_mark_removed_on_finish() {
        let mut rec = Recording::new(RecordMode::Live, 1, 64);
        rec.append(&[0.0; 10], || None);
        rec.mark();
        rec.finish();
        assert!(rec.bounds().is_empty());
        assert_eq!(rec.slices(), vec![0..10]);
    }

    #[test]
    fn test_mark_on_full_chunk_survives_finish() {
        let mut rec = Recording::new(RecordMode::Live, 1, 64);
        let mut pool = vec![Box::new(RecordChunk::new(1, 64))];
        rec.append(&[0.0; 64], || None);
        assert!(rec.mark());
        rec.append(&[0.0; 10], || pool.pop());
        rec.finish();
        assert_eq!(rec.bounds(), vec![64]);
        assert_eq!(rec.slices(), vec![0..64, 64..74]);
    }

    #[test]
    fn test_slice_source_checks() {
        let mut rec = Recording::new(RecordMode::Live, 2, 4096);
        rec.append(&frames(100, 0.1), || None);
        rec.mark();
        rec.append(&frames(3000, 0.2), || None);

        assert!(matches!(
            rec.slice_source(0, "short", 2048),
            Err(EngineError::SliceTooShort { length: 100, .. })
        ));
        assert!(matches!(
            rec.slice_source(5, "none", 2048),
            Err(EngineError::SliceOutOfRange { index: 5, slices: 2 })
        ));
        let source = rec.slice_source(1, "loop", 2048).unwrap();
        assert_eq!(source.length(), 3000);
        assert_eq!(source.channel_count(), 2);
    }

    #[test]
    fn test_to_source_keeps_marks() {
        let mut rec = Recording::new(RecordMode::Live, 1, 1000);
        rec.append(&[0.5; 300], || None);
        rec.mark();
        rec.append(&[0.5; 200], || None);
        let source = rec.to_source("take").unwrap();
        assert_eq!(source.length(), 500);
        assert_eq!(source.bounds(), &[300]);
    }
}
