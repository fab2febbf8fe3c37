//! Streaming PCM playback over a queued-buffer audio backend.
//!
//! The crate is split into small stages:
//! - `format` / `config`: validate the PCM layout and derive buffer sizing
//! - `source`: byte sources the engine pulls decoded PCM from
//! - `ring`: the fixed set of backend buffers cycled during playback
//! - `engine`: the Stopped/Playing/Paused state machine and its worker thread
//! - `notify`: state-change observers
//! - `backend` / `output` / `device`: the backend seam and its CPAL implementation

pub mod backend;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod format;
pub mod notify;
pub mod output;
pub mod ring;
pub mod source;

pub use audio_stream_types::{EndReason, PlaybackState, StreamStatus};
pub use backend::{AudioBackend, BufferId, Current, SourceId, SourceState};
pub use config::{DEFAULT_LATENCY_MS, PlaybackConfig};
pub use engine::PlaybackEngine;
pub use error::{BackendError, EngineError};
pub use format::{BufferFormat, PcmFormat};
pub use notify::{StateChange, Subscription};
pub use output::CpalBackend;
pub use source::{PcmSource, SeekableSource};
