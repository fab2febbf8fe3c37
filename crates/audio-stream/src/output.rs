//! CPAL-backed implementation of [`AudioBackend`].
//!
//! Buffers and the source queue live in process memory behind a mutex. The
//! CPAL output callback pulls frames from the front of the pending queue:
//! - PCM bytes are decoded per buffer format (u8, i16 LE, f32 LE)
//! - channels are mapped onto the device layout (mono↔stereo)
//! - finished buffers move to the processed list for the engine to reclaim
//!
//! There is no resampling; buffers must carry the device sample rate.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use crate::backend::{AudioBackend, BufferId, Current, SourceId, SourceState};
use crate::error::BackendError;
use crate::format::BufferFormat;

/// Audio backend rendering into a CPAL output stream.
#[derive(Clone)]
pub struct CpalBackend {
    shared: Arc<OutputShared>,
}

struct OutputShared {
    output_rate: u32,
    output_channels: usize,
    state: Mutex<OutputState>,
    underrun_events: AtomicU64,
    played_frames: AtomicU64,
}

#[derive(Default)]
struct OutputState {
    next_buffer: u32,
    next_source: u32,
    buffers: HashMap<BufferId, StoredBuffer>,
    source: Option<QueuedSource>,
}

struct StoredBuffer {
    format: BufferFormat,
    data: Vec<u8>,
}

struct QueuedSource {
    id: SourceId,
    pending: VecDeque<BufferId>,
    processed: VecDeque<BufferId>,
    /// Byte offset into the front pending buffer.
    cursor: usize,
    state: SourceState,
}

impl QueuedSource {
    fn holds(&self, id: BufferId) -> bool {
        self.pending.contains(&id) || self.processed.contains(&id)
    }

    fn finish_front(&mut self) {
        if let Some(id) = self.pending.pop_front() {
            self.processed.push_back(id);
        }
        self.cursor = 0;
    }
}

/// What one callback produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct RenderStats {
    frames: usize,
    /// The queue ran dry while playing.
    starved: bool,
}

/// Open a CPAL output stream on `device` and return the backend that feeds it.
///
/// The stream is returned unstarted; call `play()` on it to begin rendering.
pub fn open(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
) -> Result<(CpalBackend, cpal::Stream)> {
    let backend = CpalBackend::new(config.sample_rate, config.channels);
    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, &backend)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, &backend)?,
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, &backend)?,
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, &backend)?,
        other => return Err(anyhow!("Unsupported sample format: {other:?}")),
    };
    Ok((backend, stream))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    backend: &CpalBackend,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let shared = backend.shared.clone();
    let mut scratch: Vec<f32> = Vec::new();

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            scratch.resize(data.len(), 0.0);
            let stats = shared.render(&mut scratch);
            for (out, sample) in data.iter_mut().zip(scratch.iter()) {
                *out = <T as cpal::Sample>::from_sample::<f32>(*sample);
            }
            if stats.frames > 0 {
                shared
                    .played_frames
                    .fetch_add(stats.frames as u64, Ordering::Relaxed);
            }
            if stats.starved {
                shared.underrun_events.fetch_add(1, Ordering::Relaxed);
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

impl CpalBackend {
    /// Backend for an output running at `output_rate` with `output_channels`.
    pub fn new(output_rate: u32, output_channels: u16) -> Self {
        Self {
            shared: Arc::new(OutputShared {
                output_rate,
                output_channels: usize::from(output_channels.max(1)),
                state: Mutex::new(OutputState::default()),
                underrun_events: AtomicU64::new(0),
                played_frames: AtomicU64::new(0),
            }),
        }
    }

    pub fn output_rate(&self) -> u32 {
        self.shared.output_rate
    }

    pub fn output_channels(&self) -> u16 {
        self.shared.output_channels as u16
    }

    /// Times the queue ran dry while the source was playing.
    pub fn underrun_events(&self) -> u64 {
        self.shared.underrun_events.load(Ordering::Relaxed)
    }

    /// Output frames rendered from queued buffers.
    pub fn played_frames(&self) -> u64 {
        self.shared.played_frames.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, OutputState> {
        self.shared.lock()
    }

    fn with_source<R>(
        &self,
        source: SourceId,
        f: impl FnOnce(&mut QueuedSource) -> R,
    ) -> Result<R, BackendError> {
        let mut st = self.lock();
        match st.source.as_mut() {
            Some(src) if src.id == source => Ok(f(src)),
            _ => Err(BackendError::InvalidSource(source)),
        }
    }
}

impl OutputShared {
    fn lock(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn render(&self, out: &mut [f32]) -> RenderStats {
        let mut st = self.lock();
        render(&mut st, out, self.output_channels)
    }
}

/// Fill `out` (interleaved, `out_channels` wide) from the source queue.
///
/// Anything not covered by queued audio is silence. A playing source whose
/// queue runs dry switches to `Stopped`.
fn render(st: &mut OutputState, out: &mut [f32], out_channels: usize) -> RenderStats {
    out.fill(0.0);
    let mut stats = RenderStats::default();
    let OutputState { buffers, source, .. } = st;
    let Some(src) = source.as_mut() else {
        return stats;
    };
    if src.state != SourceState::Playing {
        return stats;
    }

    for frame in out.chunks_exact_mut(out_channels) {
        let mut decoded = None;
        while decoded.is_none() {
            let Some(&front) = src.pending.front() else {
                src.state = SourceState::Stopped;
                src.cursor = 0;
                stats.starved = true;
                return stats;
            };
            let Some(buf) = buffers.get(&front) else {
                src.finish_front();
                continue;
            };
            let frame_bytes = buf.format.channels() * buf.format.bytes_per_sample();
            if src.cursor + frame_bytes > buf.data.len() {
                // Empty buffer or trailing partial frame.
                src.finish_front();
                continue;
            }
            decoded = Some(decode_frame(buf, src.cursor));
            src.cursor += frame_bytes;
            if src.cursor >= buf.data.len() {
                src.finish_front();
            }
        }
        if let Some((samples, src_channels)) = decoded {
            let frame_len = frame.len();
            for (ch, slot) in frame.iter_mut().enumerate() {
                *slot = map_channel(&samples, src_channels, frame_len, ch);
            }
            stats.frames += 1;
        }
    }
    stats
}

/// Decode one interleaved frame starting at byte `at`.
fn decode_frame(buf: &StoredBuffer, at: usize) -> ([f32; 2], usize) {
    let channels = buf.format.channels();
    let width = buf.format.bytes_per_sample();
    let mut samples = [0.0f32; 2];
    for (ch, slot) in samples.iter_mut().enumerate().take(channels) {
        let start = at + ch * width;
        *slot = decode_sample(&buf.data[start..start + width]);
    }
    (samples, channels)
}

fn decode_sample(bytes: &[u8]) -> f32 {
    match *bytes {
        [b] => (f32::from(b) - 128.0) / 128.0,
        [lo, hi] => f32::from(i16::from_le_bytes([lo, hi])) / 32768.0,
        [a, b, c, d] => f32::from_le_bytes([a, b, c, d]),
        _ => 0.0,
    }
}

/// Output sample for `dst_ch` given one decoded source frame.
///
/// - mono → stereo: duplicate channel 0 into the front pair
/// - stereo → mono: average L/R
/// - channels beyond the front pair are silent
fn map_channel(src: &[f32; 2], src_channels: usize, dst_channels: usize, dst_ch: usize) -> f32 {
    match (src_channels, dst_channels) {
        (2, 1) => 0.5 * (src[0] + src[1]),
        (1, _) if dst_ch < 2 => src[0],
        _ if dst_ch < src_channels.min(2) => src[dst_ch],
        _ => 0.0,
    }
}

impl AudioBackend for CpalBackend {
    fn make_current(&self) -> Result<Current, BackendError> {
        Ok(Current::bind())
    }

    fn create_source(&self, _cx: &Current) -> Result<SourceId, BackendError> {
        let mut st = self.lock();
        if st.source.is_some() {
            return Err(BackendError::Device("output already has a source".into()));
        }
        st.next_source += 1;
        let id = SourceId(st.next_source);
        st.source = Some(QueuedSource {
            id,
            pending: VecDeque::new(),
            processed: VecDeque::new(),
            cursor: 0,
            state: SourceState::Initial,
        });
        Ok(id)
    }

    fn delete_source(&self, _cx: &Current, source: SourceId) -> Result<(), BackendError> {
        let mut st = self.lock();
        if !st.source.as_ref().is_some_and(|src| src.id == source) {
            return Err(BackendError::InvalidSource(source));
        }
        st.source = None;
        Ok(())
    }

    fn allocate_buffers(&self, _cx: &Current, n: usize) -> Result<Vec<BufferId>, BackendError> {
        let mut st = self.lock();
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            st.next_buffer += 1;
            let id = BufferId(st.next_buffer);
            st.buffers.insert(
                id,
                StoredBuffer {
                    format: BufferFormat::Stereo16,
                    data: Vec::new(),
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    fn delete_buffers(&self, _cx: &Current, buffers: &[BufferId]) -> Result<(), BackendError> {
        let mut st = self.lock();
        for &id in buffers {
            let attached = st.source.as_ref().is_some_and(|src| src.holds(id));
            if attached || !st.buffers.contains_key(&id) {
                return Err(BackendError::InvalidBuffer(id));
            }
        }
        for id in buffers {
            st.buffers.remove(id);
        }
        Ok(())
    }

    fn submit_data(
        &self,
        _cx: &Current,
        buffer: BufferId,
        format: BufferFormat,
        data: &[u8],
        sample_rate: u32,
    ) -> Result<(), BackendError> {
        if sample_rate != self.shared.output_rate {
            return Err(BackendError::UnsupportedRate {
                requested: sample_rate,
                output: self.shared.output_rate,
            });
        }
        let mut st = self.lock();
        if st.source.as_ref().is_some_and(|src| src.holds(buffer)) {
            return Err(BackendError::InvalidBuffer(buffer));
        }
        let stored = st
            .buffers
            .get_mut(&buffer)
            .ok_or(BackendError::InvalidBuffer(buffer))?;
        stored.format = format;
        stored.data.clear();
        stored.data.extend_from_slice(data);
        Ok(())
    }

    fn enqueue(
        &self,
        _cx: &Current,
        source: SourceId,
        buffers: &[BufferId],
    ) -> Result<(), BackendError> {
        let mut st = self.lock();
        let OutputState {
            buffers: stored,
            source: queued,
            ..
        } = &mut *st;
        let src = match queued.as_mut() {
            Some(src) if src.id == source => src,
            _ => return Err(BackendError::InvalidSource(source)),
        };
        for &id in buffers {
            if !stored.contains_key(&id) || src.holds(id) {
                return Err(BackendError::InvalidBuffer(id));
            }
        }
        src.pending.extend(buffers.iter().copied());
        Ok(())
    }

    fn dequeue_processed(
        &self,
        _cx: &Current,
        source: SourceId,
        count: usize,
    ) -> Result<Vec<BufferId>, BackendError> {
        self.with_source(source, |src| {
            let n = count.min(src.processed.len());
            src.processed.drain(..n).collect()
        })
    }

    /// Start or resume the queue. Buffers already processed are not replayed.
    fn play(&self, _cx: &Current, source: SourceId) -> Result<(), BackendError> {
        self.with_source(source, |src| {
            src.state = if src.pending.is_empty() {
                SourceState::Stopped
            } else {
                SourceState::Playing
            };
        })
    }

    fn pause(&self, _cx: &Current, source: SourceId) -> Result<(), BackendError> {
        self.with_source(source, |src| {
            if src.state == SourceState::Playing {
                src.state = SourceState::Paused;
            }
        })
    }

    fn stop(&self, _cx: &Current, source: SourceId) -> Result<(), BackendError> {
        self.with_source(source, |src| {
            let pending: Vec<BufferId> = src.pending.drain(..).collect();
            src.processed.extend(pending);
            src.cursor = 0;
            src.state = SourceState::Stopped;
        })
    }

    fn processed_count(&self, _cx: &Current, source: SourceId) -> Result<usize, BackendError> {
        self.with_source(source, |src| src.processed.len())
    }

    fn queued_count(&self, _cx: &Current, source: SourceId) -> Result<usize, BackendError> {
        self.with_source(source, |src| src.pending.len() + src.processed.len())
    }

    fn source_state(&self, _cx: &Current, source: SourceId) -> Result<SourceState, BackendError> {
        self.with_source(source, |src| src.state)
    }
}
