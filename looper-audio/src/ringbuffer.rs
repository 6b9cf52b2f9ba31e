//! Fixed-capacity multi-channel circular buffer
//!
//! Stores one array per channel and moves interleaved frames in and out. The
//! capacity never changes after construction, so none of the methods allocate.
//!
//! Writing past capacity either overwrites the oldest frames ([`RingBuffer::write`],
//! used by the delay line, the preview bus and the vocoder output) or is
//! rejected ([`RingBuffer::try_write`], used for output staging).

pub struct RingBuffer {
    channels: Vec<Vec<f32>>,
    size: usize,
    /// Next frame to read
    head: usize,
    /// Next frame to write
    tail: usize,
    used: usize,
}

impl RingBuffer {
    /// Create a buffer holding `size` frames of `channel_count` channels.
    /// Both are clamped to at least 1.
    pub fn new(channel_count: usize, size: usize) -> Self {
        let size = size.max(1);
        Self {
            channels: (0..channel_count.max(1)).map(|_| vec![0.0; size]).collect(),
            size,
            head: 0,
            tail: 0,
            used: 0,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Capacity in frames
    pub fn size(&self) -> usize {
        self.size
    }

    /// Frames ready to read
    pub fn available(&self) -> usize {
        self.used
    }

    /// Frames that can be written without overwriting
    pub fn free(&self) -> usize {
        self.size - self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used == self.size
    }

    /// Append one frame, overwriting the oldest when full.
    ///
    /// Missing channels in `frame` are written as silence. Returns `true` if
    /// unread data was overwritten.
    pub fn write_frame(&mut self, frame: &[f32]) -> bool {
        for (ch, buf) in self.channels.iter_mut().enumerate() {
            buf[self.tail] = frame.get(ch).copied().unwrap_or(0.0);
        }
        self.tail = (self.tail + 1) % self.size;
        if self.used == self.size {
            self.head = (self.head + 1) % self.size;
            true
        } else {
            self.used += 1;
            false
        }
    }

    /// Append interleaved frames, overwriting the oldest when full.
    ///
    /// Returns the number of unread frames that were overwritten.
    pub fn write(&mut self, interleaved: &[f32]) -> usize {
        let mut overwritten = 0;
        for frame in interleaved.chunks_exact(self.channels.len()) {
            if self.write_frame(frame) {
                overwritten += 1;
            }
        }
        overwritten
    }

    /// Append as many interleaved frames as fit. Returns frames written.
    pub fn try_write(&mut self, interleaved: &[f32]) -> usize {
        let frames = (interleaved.len() / self.channels.len()).min(self.free());
        let ch_count = self.channels.len();
        self.write(&interleaved[..frames * ch_count]);
        frames
    }

    /// Read interleaved frames into `out`. Returns the number of frames read.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let ch_count = self.channels.len();
        let frames = (out.len() / ch_count).min(self.used);
        for (i, frame) in out.chunks_exact_mut(ch_count).take(frames).enumerate() {
            let idx = (self.head + i) % self.size;
            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample = self.channels[ch][idx];
            }
        }
        self.head = (self.head + frames) % self.size;
        self.used -= frames;
        frames
    }

    /// Add interleaved frames into `out` instead of overwriting it.
    /// Returns the number of frames consumed.
    pub fn read_add(&mut self, out: &mut [f32]) -> usize {
        let ch_count = self.channels.len();
        let frames = (out.len() / ch_count).min(self.used);
        for (i, frame) in out.chunks_exact_mut(ch_count).take(frames).enumerate() {
            let idx = (self.head + i) % self.size;
            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample += self.channels[ch][idx];
            }
        }
        self.head = (self.head + frames) % self.size;
        self.used -= frames;
        frames
    }

    /// Discard up to `frames` unread frames
    pub fn skip(&mut self, frames: usize) -> usize {
        let frames = frames.min(self.used);
        self.head = (self.head + frames) % self.size;
        self.used -= frames;
        frames
    }

    /// Sample written `back` frames before the most recent one (0 = most recent).
    ///
    /// Returns silence when the buffer holds fewer than `back + 1` frames.
    pub fn frame_behind(&self, back: usize, channel: usize) -> f32 {
        if back >= self.used {
            return 0.0;
        }
        let idx = (self.tail + self.size - 1 - back) % self.size;
        self.channels[channel][idx]
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_accounting() {
        let mut rb = RingBuffer::new(2, 8);
        assert_eq!(rb.available(), 0);

        rb.write(&[1.0, -1.0, 2.0, -2.0, 3.0, -3.0]);
        assert_eq!(rb.available(), 3);
        assert_eq!(rb.free(), 5);

        let mut out = [0.0; 4];
        assert_eq!(rb.read(&mut out), 2);
        assert_eq!(out, [1.0, -1.0, 2.0, -2.0]);
        assert_eq!(rb.available(), 1);
    }

    #[test]
    fn test_read_returns_only_available() {
        let mut rb = RingBuffer::new(1, 4);
        rb.write(&[0.5]);
        let mut out = [9.0; 3];
        assert_eq!(rb.read(&mut out), 1);
        assert_eq!(out, [0.5, 9.0, 9.0]);
    }

    #[test]
    fn test_overwrite_when_full() {
        let mut rb = RingBuffer::new(1, 3);
        let overwritten = rb.write(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(overwritten, 2);
        assert!(rb.is_full());

        let mut out = [0.0; 3];
        rb.read(&mut out);
        assert_eq!(out, [3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_try_write_rejects_overflow() {
        let mut rb = RingBuffer::new(2, 2);
        let written = rb.try_write(&[1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        assert_eq!(written, 2);
        assert_eq!(rb.available(), 2);

        let mut out = [0.0; 4];
        rb.read(&mut out);
        assert_eq!(out, [1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let mut rb = RingBuffer::new(1, 4);
        let mut out = [0.0; 3];
        for round in 0..5 {
            let base = round as f32 * 3.0;
            rb.write(&[base, base + 1.0, base + 2.0]);
            assert_eq!(rb.read(&mut out), 3);
            assert_eq!(out, [base, base + 1.0, base + 2.0]);
        }
    }

    #[test]
    fn test_frame_behind() {
        let mut rb = RingBuffer::new(2, 4);
        rb.write(&[1.0, 10.0, 2.0, 20.0, 3.0, 30.0]);
        assert_eq!(rb.frame_behind(0, 0), 3.0);
        assert_eq!(rb.frame_behind(2, 1), 10.0);
        assert_eq!(rb.frame_behind(3, 0), 0.0);
    }

    #[test]
    fn test_read_add_and_skip() {
        let mut rb = RingBuffer::new(1, 4);
        rb.write(&[1.0, 2.0, 3.0]);
        assert_eq!(rb.skip(1), 1);

        let mut out = [0.5, 0.5];
        assert_eq!(rb.read_add(&mut out), 2);
        assert_eq!(out, [2.5, 3.5]);
        assert!(rb.is_empty());
    }
}
