//! File decode stage.
//!
//! Uses Symphonia to probe the input and decode every packet into interleaved
//! `f32`, stored as little-endian bytes so the stream engine can play it as
//! 32-bit float PCM. Layouts wider than stereo keep their first two channels.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use audio_stream::PcmFormat;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// A fully decoded track.
pub struct DecodedTrack {
    pub format: PcmFormat,
    pub bytes: Vec<u8>,
}

/// Decode `path` into interleaved `f32` PCM bytes.
pub fn decode_file(path: &Path) -> Result<DecodedTrack> {
    let file = File::open(path).with_context(|| format!("open {path:?}"))?;

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .with_context(|| format!("probe {path:?}"))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("No default audio track"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let channels = codec_params
        .channels
        .ok_or_else(|| anyhow!("Unknown channels"))?
        .count();
    let rate = codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate"))?;
    let out_channels = channels.min(2);

    let mut decoder =
        symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

    let mut bytes = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e).context("read packet"),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!("skipping undecodable packet: {e}");
                continue;
            }
            Err(e) => return Err(e).context("decode packet"),
        };

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        sample_buf.copy_interleaved_ref(decoded);
        append_le_bytes(&mut bytes, sample_buf.samples(), channels, out_channels);
    }

    let format = PcmFormat::new(rate, out_channels as u16, 32);
    tracing::info!(
        rate_hz = rate,
        channels,
        bytes = bytes.len(),
        "source decoded"
    );
    Ok(DecodedTrack { format, bytes })
}

/// Append `samples` (interleaved, `channels` wide) keeping `keep` channels per frame.
fn append_le_bytes(out: &mut Vec<u8>, samples: &[f32], channels: usize, keep: usize) {
    if channels == 0 {
        return;
    }
    for frame in samples.chunks_exact(channels) {
        for sample in &frame[..keep] {
            out.extend_from_slice(&sample.to_le_bytes());
        }
    }
}
