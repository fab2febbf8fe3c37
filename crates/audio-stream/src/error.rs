use std::io;

use thiserror::Error;

use crate::backend::{BufferId, SourceId};

/// Failures reported by an [`AudioBackend`](crate::backend::AudioBackend).
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("audio context lost")]
    ContextLost,

    #[error("invalid source handle {0:?}")]
    InvalidSource(SourceId),

    #[error("invalid buffer handle {0:?}")]
    InvalidBuffer(BufferId),

    #[error("unsupported sample rate {requested} Hz (output runs at {output} Hz)")]
    UnsupportedRate { requested: u32, output: u32 },

    #[error("audio device error: {0}")]
    Device(String),
}

/// Errors surfaced by the playback engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bit depth outside {8, 16, 32}.
    #[error("unsupported PCM format: {bits_per_sample} bits per sample")]
    UnsupportedFormat { bits_per_sample: u16 },

    #[error("invalid playback config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("byte source error: {0}")]
    Source(#[from] io::Error),

    #[error("failed to spawn playback worker: {0}")]
    Worker(#[source] io::Error),

    #[error("engine has been disposed")]
    Disposed,
}

pub type Result<T> = std::result::Result<T, EngineError>;
