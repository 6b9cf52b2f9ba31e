//! Audio analysis for Looper
//!
//! Offline helpers used on the control side: waveform overviews for drawing
//! sources and recordings, and level measurement for reporting.

mod levels;
mod waveform;

use thiserror::Error;

pub use levels::{to_db, Levels};
pub use waveform::{MinMaxLevel, WaveformPyramid};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error("no samples to analyse")]
    EmptyInput,
    #[error("channels differ in length")]
    ChannelMismatch,
}
