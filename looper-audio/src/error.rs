//! Error types for the control-side engine API

use crate::config::ConfigError;
use thiserror::Error;

/// Errors returned when a host command is rejected.
///
/// A rejected command leaves engine state untouched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("unknown source: {0}")]
    UnknownSource(String),
    #[error("unknown track: {0}")]
    UnknownTrack(String),
    #[error("id already in use: {0}")]
    DuplicateId(String),
    #[error("chunk {index} out of range ({regions} regions)")]
    InvalidChunk { index: usize, regions: usize },
    #[error("chunk cursor {index} out of range ({chunks} chunks)")]
    InvalidChunkIndex { index: usize, chunks: usize },
    #[error("a playing track needs at least one chunk")]
    EmptyChunks,
    #[error("delay of {requested} frames exceeds maximum of {max}")]
    DelayTooLong { requested: usize, max: usize },
    #[error("invalid parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: f64 },
    #[error("invalid bounds: {0}")]
    InvalidBounds(String),
    #[error("channel mismatch: {0}")]
    ChannelMismatch(String),
    #[error("source has no audio")]
    EmptySource,
    #[error("slice of {length} frames is shorter than the analysis window ({min})")]
    SliceTooShort { length: usize, min: usize },
    #[error("slice {index} out of range ({slices} slices)")]
    SliceOutOfRange { index: usize, slices: usize },
    #[error("a recording is already active")]
    RecordingActive,
    #[error("no active recording")]
    NoRecording,
    #[error("{0} table is full")]
    TableFull(&'static str),
    #[error("command queue is full")]
    QueueFull,
    #[error("render side disconnected")]
    Disconnected,
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}
