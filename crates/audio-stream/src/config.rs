use crate::error::{EngineError, Result};
use crate::format::{self, BufferFormat, PcmFormat};

/// Default target buffer duration.
pub const DEFAULT_LATENCY_MS: u32 = 50;

/// Per-session playback parameters, derived once when the engine is initialized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaybackConfig {
    /// Format of the bytes delivered by the source.
    pub format: PcmFormat,
    /// Backend tag the buffers are submitted with.
    pub buffer_format: BufferFormat,
    /// Target duration of one ring buffer; also the worker's idle poll interval.
    pub latency_ms: u32,
    /// Bytes read from the source per ring buffer (whole frames).
    pub buffer_bytes: usize,
    /// Total source length in bytes.
    pub length_bytes: u64,
    /// Total source length in milliseconds.
    pub length_ms: u64,
}

impl PlaybackConfig {
    /// Derive the session config, rejecting unsupported or degenerate formats.
    pub fn new(format: PcmFormat, latency_ms: u32, length_bytes: u64) -> Result<Self> {
        let buffer_format = format::resolve(format.channels, format.bits_per_sample)?;
        if format.sample_rate == 0 {
            return Err(EngineError::InvalidConfig("sample rate must be non-zero".into()));
        }
        if format.channels == 0 {
            return Err(EngineError::InvalidConfig("channel count must be non-zero".into()));
        }
        if latency_ms == 0 {
            return Err(EngineError::InvalidConfig("latency must be non-zero".into()));
        }

        let block = format.block_align();
        let raw = format.bytes_per_second() * u64::from(latency_ms) / 1000;
        let aligned = (raw / block * block).max(block);
        let buffer_bytes = usize::try_from(aligned)
            .map_err(|_| EngineError::InvalidConfig(format!("buffer of {aligned} bytes")))?;

        let length_ms = length_bytes.saturating_mul(1000) / format.bytes_per_second();

        Ok(Self {
            format,
            buffer_format,
            latency_ms,
            buffer_bytes,
            length_bytes,
            length_ms,
        })
    }

    /// Playback position for a source byte offset, never past the stream length.
    pub fn position_ms(&self, offset: u64) -> u64 {
        (offset.saturating_mul(1000) / self.format.bytes_per_second()).min(self.length_ms)
    }

    /// Frame-aligned source byte offset for a position, clamped to the stream length.
    pub fn offset_for_ms(&self, ms: u64) -> u64 {
        let block = self.format.block_align();
        let raw = ms.saturating_mul(self.format.bytes_per_second()) / 1000;
        (raw / block * block).min(self.length_bytes)
    }

    pub fn latency(&self) -> std::time::Duration {
        std::time::Duration::from_millis(u64::from(self.latency_ms))
    }
}
