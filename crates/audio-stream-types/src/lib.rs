use serde::{Deserialize, Serialize};

/// Playback state of a stream engine.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// Idle. Initial state, and the state after stop or end of stream.
    #[default]
    Stopped,
    /// Buffers are being fed to the output.
    Playing,
    /// Output halted; queued buffers are kept.
    Paused,
}

impl PlaybackState {
    /// Stable label used in logs and CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            PlaybackState::Stopped => "stopped",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
        }
    }
}

/// Reason why a stream transitioned to [`PlaybackState::Stopped`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The byte source was exhausted and every queued buffer finished playing.
    Eof,
    /// Playback was explicitly stopped by a command.
    Stopped,
    /// A backend or source failure ended playback.
    Error,
}

/// Point-in-time view of a stream engine.
///
/// Fields are read from independent status cells, so a snapshot taken during
/// active playback is approximate.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamStatus {
    pub state: PlaybackState,
    /// Playback position in milliseconds, derived from the source read cursor.
    pub position_ms: u64,
    /// Total stream length in milliseconds.
    pub length_ms: u64,
    /// Target duration of one buffer in milliseconds.
    pub latency_ms: u32,
    /// Size of one ring buffer in bytes.
    pub buffer_bytes: usize,
    /// Set when the most recent session ended.
    pub end_reason: Option<EndReason>,
}
