//! Feedback echo over a [`RingBuffer`].
//!
//! `out = in + gain * line[d]`, and `out` is what gets written back to the
//! line, so every echo is `gain` times quieter than the previous one.

use super::Effect;
use crate::ringbuffer::RingBuffer;
use crate::source::MAX_SOURCE_CHANNELS;

pub struct DelayLine {
    line: RingBuffer,
    /// Delay in frames; 0 disables the echo
    delay_frames: usize,
    /// Feedback gain in [0, 1)
    gain: f32,
}

impl DelayLine {
    /// Create a delay able to hold `max_frames` frames
    pub fn new(channels: usize, max_frames: usize) -> Self {
        Self {
            line: RingBuffer::new(channels.min(MAX_SOURCE_CHANNELS), max_frames),
            delay_frames: 0,
            gain: 0.0,
        }
    }

    pub fn max_frames(&self) -> usize {
        self.line.size()
    }

    /// Set delay length (clamped to capacity) and feedback gain (clamped to [0, 1))
    pub fn set_params(&mut self, delay_frames: usize, gain: f32) {
        self.delay_frames = delay_frames.min(self.line.size());
        self.gain = if gain.is_finite() {
            gain.clamp(0.0, 0.999)
        } else {
            0.0
        };
    }

    pub fn delay_frames(&self) -> usize {
        self.delay_frames
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl Effect for DelayLine {
    fn process(&mut self, samples: &mut [f32]) {
        if self.delay_frames == 0 {
            return;
        }
        let ch_count = self.line.channel_count();
        let mut out = [0.0f32; MAX_SOURCE_CHANNELS];
        for frame in samples.chunks_exact_mut(ch_count) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                let delayed = self.line.frame_behind(self.delay_frames - 1, ch);
                *sample += self.gain * delayed;
                out[ch] = *sample;
            }
            self.line.write_frame(&out[..ch_count]);
        }
    }

    fn reset(&mut self) {
        self.line.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_passes_through() {
        let mut delay = DelayLine::new(2, 100);
        let mut samples = vec![1.0, -1.0, 0.5, -0.5];
        delay.process(&mut samples);
        assert_eq!(samples, vec![1.0, -1.0, 0.5, -0.5]);
    }

    #[test]
    fn test_echo_latency_and_decay() {
        let mut delay = DelayLine::new(1, 64);
        delay.set_params(10, 0.5);

        let mut samples = vec![0.0; 40];
        samples[0] = 1.0;
        delay.process(&mut samples);

        assert_eq!(samples[0], 1.0);
        assert_eq!(samples[10], 0.5);
        assert_eq!(samples[20], 0.25);
        assert_eq!(samples[30], 0.125);
        let others: f32 = samples
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 10 != 0)
            .map(|(_, s)| s.abs())
            .sum();
        assert_eq!(others, 0.0);
    }

    #[test]
    fn test_echo_spans_blocks() {
        let mut delay = DelayLine::new(2, 64);
        delay.set_params(3, 0.5);

        let mut first = vec![1.0, 0.25, 0.0, 0.0];
        delay.process(&mut first);
        let mut second = vec![0.0; 4];
        delay.process(&mut second);

        // Frame 3 overall is the second frame of the second block
        assert_eq!(second[2], 0.5);
        assert_eq!(second[3], 0.125);
    }

    #[test]
    fn test_params_are_clamped() {
        let mut delay = DelayLine::new(1, 16);
        delay.set_params(100, 1.5);
        assert_eq!(delay.delay_frames(), 16);
        assert!(delay.gain() < 1.0);
        delay.set_params(4, f32::NAN);
        assert_eq!(delay.gain(), 0.0);
    }
}
