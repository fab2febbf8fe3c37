//! PCM format descriptors and their mapping onto backend buffer formats.

use crate::error::{EngineError, Result};

/// Layout of the interleaved PCM bytes produced by the byte source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    /// Bytes per interleaved frame (all channels of one sample instant).
    pub fn block_align(&self) -> u64 {
        u64::from(self.channels) * u64::from(self.bits_per_sample / 8)
    }

    pub fn bytes_per_second(&self) -> u64 {
        u64::from(self.sample_rate) * self.block_align()
    }
}

/// Buffer data format tag understood by the audio backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferFormat {
    Mono8,
    Mono16,
    MonoFloat32,
    Stereo8,
    Stereo16,
    StereoFloat32,
}

impl BufferFormat {
    pub fn channels(self) -> usize {
        match self {
            BufferFormat::Mono8 | BufferFormat::Mono16 | BufferFormat::MonoFloat32 => 1,
            BufferFormat::Stereo8 | BufferFormat::Stereo16 | BufferFormat::StereoFloat32 => 2,
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            BufferFormat::Mono8 | BufferFormat::Stereo8 => 1,
            BufferFormat::Mono16 | BufferFormat::Stereo16 => 2,
            BufferFormat::MonoFloat32 | BufferFormat::StereoFloat32 => 4,
        }
    }
}

/// Map a channel count and bit depth to a backend buffer format.
///
/// Two or more channels select the stereo family, anything else mono.
/// Bit depths 8, 16 and 32 map to unsigned 8-bit, signed 16-bit and float32.
/// Any other depth is rejected; there is no truncation fallback.
pub fn resolve(channels: u16, bits_per_sample: u16) -> Result<BufferFormat> {
    let stereo = channels >= 2;
    let format = match (stereo, bits_per_sample) {
        (false, 8) => BufferFormat::Mono8,
        (false, 16) => BufferFormat::Mono16,
        (false, 32) => BufferFormat::MonoFloat32,
        (true, 8) => BufferFormat::Stereo8,
        (true, 16) => BufferFormat::Stereo16,
        (true, 32) => BufferFormat::StereoFloat32,
        _ => return Err(EngineError::UnsupportedFormat { bits_per_sample }),
    };
    Ok(format)
}
