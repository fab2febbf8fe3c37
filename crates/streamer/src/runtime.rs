//! Streamer runtime helpers.
//!
//! Provides device enumeration and local playback through the stream engine.

use std::io::Cursor;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use audio_stream::{PlaybackEngine, PlaybackState, StateChange, StreamStatus, device, output};
use cpal::traits::{DeviceTrait, StreamTrait};

use crate::config::StreamPlayConfig;
use crate::decode;

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    device::list_devices(&host)
}

/// Decode a local file and stream it until it ends or Ctrl-C stops it.
pub fn run_play(config: StreamPlayConfig) -> Result<()> {
    let host = cpal::default_host();
    let device_name = normalize_device_name(config.device);
    let device = device::pick_device(&host, device_name.as_deref())?;
    tracing::info!(device = %device.description()?, "output device");

    let track = decode::decode_file(&config.path)?;
    let rate = track.format.sample_rate;

    let supported = device::pick_output_config(&device, rate)?;
    let mut stream_config: cpal::StreamConfig = supported.clone().into();
    if stream_config.sample_rate != rate {
        return Err(anyhow!(
            "device has no output config at {rate} Hz (closest {} Hz)",
            stream_config.sample_rate
        ));
    }
    if let Some(buf) = device::pick_buffer_size(&supported, device_frames(rate, config.latency_ms))
    {
        stream_config.buffer_size = buf;
    }
    tracing::info!(
        rate_hz = stream_config.sample_rate,
        channels = stream_config.channels,
        sample_format = ?supported.sample_format(),
        buffer_size = ?stream_config.buffer_size,
        "device output config"
    );

    let (backend, stream) = output::open(&device, &stream_config, supported.sample_format())?;
    stream.play().context("start output stream")?;

    let engine = Arc::new(PlaybackEngine::initialize(
        Arc::new(backend.clone()),
        Box::new(Cursor::new(track.bytes)),
        track.format,
        config.latency_ms,
    )?);
    let (changes, _subscription) = engine.subscribe_channel();

    {
        let engine = engine.clone();
        ctrlc::set_handler(move || {
            if let Err(e) = engine.stop() {
                tracing::warn!("stop on interrupt failed: {e}");
            }
        })
        .context("install Ctrl-C handler")?;
    }

    engine.play()?;

    let mut failure = None;
    for change in changes.iter() {
        report(&engine.status(), &change, config.json)?;
        if change.state == PlaybackState::Stopped {
            failure = change.failure;
            break;
        }
    }

    tracing::info!(
        played_frames = backend.played_frames(),
        underruns = backend.underrun_events(),
        "playback finished"
    );
    engine.dispose()?;

    match failure {
        Some(e) => Err(anyhow!("playback failed: {e}")),
        None => Ok(()),
    }
}

fn report(status: &StreamStatus, change: &StateChange, json: bool) -> Result<()> {
    let line = status_for_change(status, change);
    if json {
        println!("{}", serde_json::to_string(&line)?);
    } else {
        tracing::info!(
            state = line.state.as_str(),
            position_ms = line.position_ms,
            length_ms = line.length_ms,
            end_reason = ?line.end_reason,
            "state changed"
        );
    }
    Ok(())
}

/// Engine status with the fields carried by `change` taking precedence.
fn status_for_change(status: &StreamStatus, change: &StateChange) -> StreamStatus {
    StreamStatus {
        state: change.state,
        position_ms: change.position_ms,
        end_reason: change.end_reason,
        ..status.clone()
    }
}

/// Device callback size matching one engine buffer.
fn device_frames(rate: u32, latency_ms: u32) -> u32 {
    (u64::from(rate) * u64::from(latency_ms) / 1000).max(1) as u32
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
