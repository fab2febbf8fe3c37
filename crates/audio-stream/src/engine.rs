//! Streaming playback engine.
//!
//! [`PlaybackEngine`] owns one backend source, a [`BufferRing`] and the byte
//! source feeding it. Control calls (`play`, `pause`, `resume`, `stop`, `seek`,
//! `dispose`) are serialized by a session lock. While playing, a dedicated
//! worker thread:
//! - pre-rolls every ring buffer and starts the backend source
//! - polls the backend for processed buffers, one latency interval at a time
//! - refills processed buffers and restarts the source after an underrun
//! - publishes the position from the byte source's read cursor
//!
//! State, position and the stop signal live in atomic cells so the worker and
//! control threads never share a lock for status reads.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use audio_stream_types::{EndReason, PlaybackState, StreamStatus};
use crossbeam_channel::Receiver;

use crate::backend::{AudioBackend, SourceId, SourceState};
use crate::config::{DEFAULT_LATENCY_MS, PlaybackConfig};
use crate::error::{EngineError, Result};
use crate::format::PcmFormat;
use crate::notify::{Observers, StateChange, Subscription};
use crate::ring::{BUFFER_COUNT, BufferRing};
use crate::source::PcmSource;

/// Status cells shared between control threads and the worker.
struct StatusCell {
    state: AtomicU8,
    offset: AtomicU64,
    end_reason: AtomicU8,
}

impl StatusCell {
    fn new(offset: u64) -> Self {
        Self {
            state: AtomicU8::new(encode_state(PlaybackState::Stopped)),
            offset: AtomicU64::new(offset),
            end_reason: AtomicU8::new(encode_end_reason(None)),
        }
    }

    fn state(&self) -> PlaybackState {
        decode_state(self.state.load(Ordering::SeqCst))
    }

    fn swap_state(&self, state: PlaybackState) -> PlaybackState {
        decode_state(self.state.swap(encode_state(state), Ordering::SeqCst))
    }

    fn end_reason(&self) -> Option<EndReason> {
        decode_end_reason(self.end_reason.load(Ordering::SeqCst))
    }
}

fn encode_state(state: PlaybackState) -> u8 {
    match state {
        PlaybackState::Stopped => 0,
        PlaybackState::Playing => 1,
        PlaybackState::Paused => 2,
    }
}

fn decode_state(raw: u8) -> PlaybackState {
    match raw {
        1 => PlaybackState::Playing,
        2 => PlaybackState::Paused,
        _ => PlaybackState::Stopped,
    }
}

fn encode_end_reason(reason: Option<EndReason>) -> u8 {
    match reason {
        None => 0,
        Some(EndReason::Eof) => 1,
        Some(EndReason::Stopped) => 2,
        Some(EndReason::Error) => 3,
    }
}

fn decode_end_reason(raw: u8) -> Option<EndReason> {
    match raw {
        1 => Some(EndReason::Eof),
        2 => Some(EndReason::Stopped),
        3 => Some(EndReason::Error),
        _ => None,
    }
}

/// Buffer ring and byte source; touched by the worker and by stop/seek/dispose.
struct Media {
    ring: BufferRing,
    pcm: Box<dyn PcmSource>,
    exhausted: bool,
}

struct Shared {
    backend: Arc<dyn AudioBackend>,
    source: SourceId,
    config: PlaybackConfig,
    status: StatusCell,
    stop_signal: AtomicBool,
    disposed: AtomicBool,
    media: Mutex<Media>,
    observers: Observers,
}

impl Shared {
    fn state(&self) -> PlaybackState {
        self.status.state()
    }

    fn media(&self) -> MutexGuard<'_, Media> {
        self.media.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_offset(&self, offset: u64) {
        self.status.offset.store(offset, Ordering::SeqCst);
    }

    fn position_ms(&self) -> u64 {
        self.config
            .position_ms(self.status.offset.load(Ordering::SeqCst))
    }

    /// Store `state` and notify observers if it changed (or a failure is attached).
    fn transition(
        &self,
        state: PlaybackState,
        end_reason: Option<EndReason>,
        failure: Option<Arc<EngineError>>,
    ) -> bool {
        let prev = self.status.swap_state(state);
        if prev == state && failure.is_none() {
            return false;
        }
        let end_reason = if state == PlaybackState::Stopped {
            end_reason
        } else {
            None
        };
        self.status
            .end_reason
            .store(encode_end_reason(end_reason), Ordering::SeqCst);
        tracing::debug!(from = prev.as_str(), to = state.as_str(), ?end_reason, "state change");
        self.observers.notify(&StateChange {
            state,
            position_ms: self.position_ms(),
            end_reason,
            failure,
        });
        true
    }
}

#[derive(Default)]
struct Session {
    worker: Option<JoinHandle<()>>,
}

/// Streams PCM from a byte source through a ring of backend buffers.
pub struct PlaybackEngine {
    shared: Arc<Shared>,
    session: Mutex<Session>,
}

impl PlaybackEngine {
    /// Create an engine for `pcm` in `format`, with buffers of `latency_ms` each.
    ///
    /// The format is validated before the backend is touched: an unsupported
    /// bit depth fails with [`EngineError::UnsupportedFormat`] and allocates
    /// nothing. Ring buffers are allocated lazily on first play.
    pub fn initialize(
        backend: Arc<dyn AudioBackend>,
        pcm: Box<dyn PcmSource>,
        format: PcmFormat,
        latency_ms: u32,
    ) -> Result<Self> {
        let config = PlaybackConfig::new(format, latency_ms, pcm.len())?;
        let source = {
            let cx = backend.make_current()?;
            backend.create_source(&cx)?
        };
        tracing::info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            bits = format.bits_per_sample,
            latency_ms,
            buffer_bytes = config.buffer_bytes,
            length_ms = config.length_ms,
            "stream initialized"
        );

        let offset = pcm.position();
        let ring = BufferRing::new(&config);
        Ok(Self {
            shared: Arc::new(Shared {
                backend,
                source,
                config,
                status: StatusCell::new(offset),
                stop_signal: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                media: Mutex::new(Media {
                    ring,
                    pcm,
                    exhausted: false,
                }),
                observers: Observers::new(),
            }),
            session: Mutex::new(Session::default()),
        })
    }

    /// [`PlaybackEngine::initialize`] with [`DEFAULT_LATENCY_MS`].
    pub fn initialize_default(
        backend: Arc<dyn AudioBackend>,
        pcm: Box<dyn PcmSource>,
        format: PcmFormat,
    ) -> Result<Self> {
        Self::initialize(backend, pcm, format, DEFAULT_LATENCY_MS)
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return Err(EngineError::Disposed);
        }
        Ok(())
    }

    /// Start playback from Stopped, or resume from Paused. No-op while Playing.
    ///
    /// Starting a stream whose source is at its end rewinds it first.
    pub fn play(&self) -> Result<()> {
        let mut session = self.lock_session();
        self.ensure_live()?;
        match self.shared.state() {
            PlaybackState::Playing => {
                tracing::debug!("play ignored: already playing");
                Ok(())
            }
            PlaybackState::Paused => self.resume_locked(),
            PlaybackState::Stopped => {
                {
                    let mut media = self.shared.media();
                    if !media.pcm.is_empty() && media.pcm.remaining() == 0 {
                        media.pcm.seek(0)?;
                        self.shared.publish_offset(0);
                        tracing::debug!("source rewound for replay");
                    }
                }
                self.start_locked(&mut session)
            }
        }
    }

    /// Halt output, keeping queued buffers. No-op unless Playing.
    pub fn pause(&self) -> Result<()> {
        let _session = self.lock_session();
        self.ensure_live()?;
        if self.shared.state() != PlaybackState::Playing {
            tracing::debug!(state = self.shared.state().as_str(), "pause ignored");
            return Ok(());
        }
        let backend = self.shared.backend.as_ref();
        let cx = backend.make_current()?;
        // The worker checks the state and starts the source under the media lock.
        let _media = self.shared.media();
        backend.pause(&cx, self.shared.source)?;
        self.shared.transition(PlaybackState::Paused, None, None);
        Ok(())
    }

    /// Continue from Paused. No-op in any other state.
    pub fn resume(&self) -> Result<()> {
        let _session = self.lock_session();
        self.ensure_live()?;
        if self.shared.state() != PlaybackState::Paused {
            tracing::debug!(state = self.shared.state().as_str(), "resume ignored");
            return Ok(());
        }
        self.resume_locked()
    }

    /// Stop playback and wait until the backend has no buffer queued.
    ///
    /// Idempotent, and a no-op after [`PlaybackEngine::dispose`]. The position
    /// is kept; a later `play` continues from it.
    pub fn stop(&self) -> Result<()> {
        let mut session = self.lock_session();
        if self.shared.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_locked(&mut session)
    }

    /// Move the read position to `position_ms` (frame aligned, clamped to the length).
    ///
    /// An active session is stopped first. Playing sessions restart at the new
    /// position; paused ones end up Stopped there.
    pub fn seek(&self, position_ms: u64) -> Result<()> {
        let mut session = self.lock_session();
        self.ensure_live()?;
        let was = self.shared.state();
        if was != PlaybackState::Stopped || session.worker.is_some() {
            self.stop_locked(&mut session)?;
        }

        let offset = self.shared.config.offset_for_ms(position_ms);
        {
            let mut media = self.shared.media();
            media.pcm.seek(offset)?;
            media.exhausted = false;
        }
        self.shared.publish_offset(offset);
        tracing::debug!(position_ms, offset, "seek");

        if was == PlaybackState::Playing {
            self.start_locked(&mut session)?;
        }
        Ok(())
    }

    /// Stop any active playback, then release the ring buffers and the backend source.
    ///
    /// Idempotent and safe on an engine that never played. The engine is
    /// unusable afterwards. Also runs on drop.
    pub fn dispose(&self) -> Result<()> {
        let mut session = self.lock_session();
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.shared.state() != PlaybackState::Stopped || session.worker.is_some() {
            if let Err(e) = self.stop_locked(&mut session) {
                tracing::warn!(error = %e, "stop before dispose failed");
            }
        }

        let backend = self.shared.backend.as_ref();
        let cx = backend.make_current()?;
        self.shared
            .media()
            .ring
            .release(backend, &cx, self.shared.source)?;
        backend.delete_source(&cx, self.shared.source)?;
        tracing::debug!("stream disposed");
        Ok(())
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    /// Position in milliseconds; approximate while playing, never past the length.
    pub fn position_ms(&self) -> u64 {
        self.shared.position_ms()
    }

    pub fn length_ms(&self) -> u64 {
        self.shared.config.length_ms
    }

    pub fn latency_ms(&self) -> u32 {
        self.shared.config.latency_ms
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.shared.config
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            state: self.shared.state(),
            position_ms: self.shared.position_ms(),
            length_ms: self.shared.config.length_ms,
            latency_ms: self.shared.config.latency_ms,
            buffer_bytes: self.shared.config.buffer_bytes,
            end_reason: self.shared.status.end_reason(),
        }
    }

    /// Register a state-change observer.
    ///
    /// Callbacks run synchronously on the thread making the transition. The
    /// end-of-stream notification runs on the worker thread, so a callback must
    /// not block on this engine's control methods.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.shared.observers.subscribe(callback)
    }

    /// Receive state changes on a channel instead of a callback.
    pub fn subscribe_channel(&self) -> (Receiver<StateChange>, Subscription) {
        self.shared.observers.subscribe_channel()
    }

    fn resume_locked(&self) -> Result<()> {
        let backend = self.shared.backend.as_ref();
        let cx = backend.make_current()?;
        let _media = self.shared.media();
        backend.play(&cx, self.shared.source)?;
        self.shared.transition(PlaybackState::Playing, None, None);
        Ok(())
    }

    fn start_locked(&self, session: &mut Session) -> Result<()> {
        if let Some(worker) = session.worker.take() {
            join_worker(worker);
        }

        {
            let backend = self.shared.backend.as_ref();
            let cx = backend.make_current()?;
            let mut media = self.shared.media();
            // A faulted run can leave buffers attached; pre-roll must only see free ones.
            if media.ring.is_allocated() {
                backend.stop(&cx, self.shared.source)?;
                media.ring.wait_drain(backend, &cx, self.shared.source)?;
            }
            media.exhausted = false;
            self.shared.publish_offset(media.pcm.position());
        }

        self.shared.stop_signal.store(false, Ordering::SeqCst);
        self.shared.transition(PlaybackState::Playing, None, None);

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("audio-stream".into())
            .spawn(move || run_worker(shared));
        match spawned {
            Ok(handle) => {
                session.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared
                    .transition(PlaybackState::Stopped, Some(EndReason::Error), None);
                Err(EngineError::Worker(e))
            }
        }
    }

    fn stop_locked(&self, session: &mut Session) -> Result<()> {
        self.shared.stop_signal.store(true, Ordering::SeqCst);
        if let Some(worker) = session.worker.take() {
            join_worker(worker);
        }

        let backend = self.shared.backend.as_ref();
        let source = self.shared.source;
        let cx = backend.make_current()?;
        {
            let media = self.shared.media();
            if media.ring.is_allocated() {
                // Only a playing source finishes its queue; stopping any other marks it processed.
                if backend.source_state(&cx, source)? != SourceState::Playing {
                    backend.stop(&cx, source)?;
                }
                media.ring.wait_drain(backend, &cx, source)?;
                backend.stop(&cx, source)?;
            }
        }
        self.shared
            .transition(PlaybackState::Stopped, Some(EndReason::Stopped), None);
        Ok(())
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            tracing::warn!(error = %e, "dispose on drop failed");
        }
    }
}

fn join_worker(worker: JoinHandle<()>) {
    if worker.thread().id() == thread::current().id() {
        // Called from an observer on the worker itself; it exits on its own.
        return;
    }
    if worker.join().is_err() {
        tracing::warn!("playback worker panicked");
    }
}

enum Exit {
    /// Source exhausted and the backend queue ran dry.
    Finished,
    /// Stop signal observed; `stop` publishes the transition.
    Cancelled,
}

fn run_worker(shared: Arc<Shared>) {
    match stream(&shared) {
        Ok(Exit::Cancelled) => tracing::debug!("playback worker cancelled"),
        Ok(Exit::Finished) => {
            tracing::info!(position_ms = shared.position_ms(), "end of stream");
            shared.transition(PlaybackState::Stopped, Some(EndReason::Eof), None);
        }
        Err(e) => {
            if shared.stop_signal.load(Ordering::SeqCst) {
                tracing::debug!(error = %e, "playback worker failed while stopping");
                return;
            }
            tracing::warn!(error = %e, "playback worker failed");
            shared.transition(
                PlaybackState::Stopped,
                Some(EndReason::Error),
                Some(Arc::new(e)),
            );
        }
    }
}

fn stream(shared: &Shared) -> Result<Exit> {
    let backend = shared.backend.as_ref();
    let source = shared.source;
    let idle = shared.config.latency();
    let cx = backend.make_current()?;

    {
        let mut guard = shared.media();
        let Media {
            ring,
            pcm,
            exhausted,
        } = &mut *guard;
        ring.create_buffers(backend, &cx, BUFFER_COUNT)?;
        let ids = ring.ids().to_vec();
        let outcome = ring.fill(backend, &cx, source, &mut **pcm, &ids)?;
        *exhausted = outcome.exhausted || pcm.remaining() == 0;
        // Paused before pre-roll finished: resume() starts the source, and the
        // position stays put until the loop runs.
        if shared.state() == PlaybackState::Playing {
            shared.publish_offset(pcm.position());
            if outcome.queued > 0 {
                backend.play(&cx, source)?;
            }
        }
        tracing::debug!(queued = outcome.queued, exhausted = *exhausted, "pre-roll done");
    }

    loop {
        if shared.stop_signal.load(Ordering::SeqCst) {
            return Ok(Exit::Cancelled);
        }
        let processed = backend.processed_count(&cx, source)?;
        match shared.state() {
            PlaybackState::Paused => {
                thread::sleep(idle);
                continue;
            }
            PlaybackState::Stopped => return Ok(Exit::Cancelled),
            PlaybackState::Playing => {}
        }

        let mut guard = shared.media();
        if processed == 0 {
            if guard.exhausted && backend.queued_count(&cx, source)? == 0 {
                return Ok(Exit::Finished);
            }
            drop(guard);
            thread::sleep(idle);
            continue;
        }

        let Media {
            ring,
            pcm,
            exhausted,
        } = &mut *guard;
        let freed = ring.unqueue(backend, &cx, source, processed)?;
        let outcome = ring.fill(backend, &cx, source, &mut **pcm, &freed)?;
        if outcome.exhausted || pcm.remaining() == 0 {
            *exhausted = true;
        }
        if outcome.queued > 0
            && shared.state() == PlaybackState::Playing
            && backend.source_state(&cx, source)? == SourceState::Stopped
        {
            tracing::debug!("output ran dry, restarting source");
            backend.play(&cx, source)?;
        }
        shared.publish_offset(pcm.position());
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::backend::mock::{Call, MockBackend};

    fn cd() -> PcmFormat {
        PcmFormat::new(44_100, 2, 16)
    }

    fn engine(backend: &Arc<MockBackend>, bytes: usize, latency_ms: u32) -> PlaybackEngine {
        PlaybackEngine::initialize(
            backend.clone(),
            Box::new(Cursor::new(vec![0u8; bytes])),
            cd(),
            latency_ms,
        )
        .unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    fn next_change(rx: &Receiver<StateChange>) -> StateChange {
        rx.recv_timeout(Duration::from_secs(5))
            .expect("state change within timeout")
    }

    #[test]
    fn preroll_consumes_exact_source_and_ends_with_eof() {
        let backend = Arc::new(MockBackend::auto());
        let engine = engine(&backend, 4 * 8820, 50);
        assert_eq!(engine.config().buffer_bytes, 8820);
        assert_eq!(engine.length_ms(), 200);
        let (rx, _sub) = engine.subscribe_channel();

        engine.play().unwrap();

        let playing = next_change(&rx);
        assert_eq!(playing.state, PlaybackState::Playing);
        let stopped = next_change(&rx);
        assert_eq!(stopped.state, PlaybackState::Stopped);
        assert_eq!(stopped.end_reason, Some(EndReason::Eof));
        assert!(stopped.failure.is_none());

        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert_eq!(engine.position_ms(), engine.length_ms());
        assert_eq!(backend.submits(), 4);
        assert_eq!(backend.queued(), 0);
        assert!(backend.max_queued() <= BUFFER_COUNT);
        let allocs: Vec<Call> = backend
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Allocate(_)))
            .collect();
        assert_eq!(allocs, vec![Call::Allocate(BUFFER_COUNT)]);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn unsupported_depth_fails_before_backend_is_touched() {
        let backend = Arc::new(MockBackend::auto());
        let result = PlaybackEngine::initialize(
            backend.clone(),
            Box::new(Cursor::new(vec![0u8; 64])),
            PcmFormat::new(44_100, 2, 24),
            50,
        );
        assert!(matches!(
            result,
            Err(EngineError::UnsupportedFormat { bits_per_sample: 24 })
        ));
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn stop_before_play_only_binds_context() {
        let backend = Arc::new(MockBackend::auto());
        let engine = engine(&backend, 8820, 50);
        let (rx, _sub) = engine.subscribe_channel();
        let before = backend.calls().len();

        engine.stop().unwrap();
        engine.stop().unwrap();

        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert_eq!(
            backend.calls()[before..].to_vec(),
            vec![Call::MakeCurrent, Call::MakeCurrent]
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stop_leaves_nothing_queued() {
        let backend = Arc::new(MockBackend::manual());
        let engine = engine(&backend, 882 * 500, 5);
        engine.play().unwrap();
        assert!(wait_until(|| backend.submits() >= BUFFER_COUNT));
        backend.complete(2);
        assert!(wait_until(|| backend.submits() >= BUFFER_COUNT + 2));

        backend.set_auto_complete(true);
        engine.stop().unwrap();

        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert_eq!(engine.status().end_reason, Some(EndReason::Stopped));
        assert_eq!(backend.queued(), 0);
        assert_eq!(backend.state(), SourceState::Stopped);
        assert!(backend.max_queued() <= BUFFER_COUNT);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn stop_while_paused_reclaims_instead_of_waiting() {
        let backend = Arc::new(MockBackend::manual());
        let engine = engine(&backend, 882 * 50, 5);
        engine.play().unwrap();
        assert!(wait_until(|| backend.submits() >= BUFFER_COUNT));
        engine.pause().unwrap();

        engine.stop().unwrap();

        assert_eq!(backend.queued(), 0);
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn stop_after_pause_during_preroll_reclaims_unstarted_queue() {
        let backend = Arc::new(MockBackend::manual());
        let engine = engine(&backend, 882 * 50, 5);
        backend.hold_worker_at(Call::MakeCurrent);
        engine.play().unwrap();
        assert!(wait_until(|| backend.worker_held()));
        engine.pause().unwrap();
        backend.release_worker();
        assert!(wait_until(|| backend.submits() >= BUFFER_COUNT));

        engine.stop().unwrap();

        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert_eq!(backend.queued(), 0);
        assert_eq!(engine.position_ms(), 0);
        assert!(!backend.calls().contains(&Call::Play));
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn resume_after_pause_during_preroll_starts_source() {
        let backend = Arc::new(MockBackend::manual());
        let engine = engine(&backend, 882 * 50, 5);
        backend.hold_worker_at(Call::MakeCurrent);
        engine.play().unwrap();
        assert!(wait_until(|| backend.worker_held()));
        engine.pause().unwrap();
        backend.release_worker();
        assert!(wait_until(|| backend.submits() >= BUFFER_COUNT));
        assert_eq!(engine.position_ms(), 0);

        engine.resume().unwrap();
        assert_eq!(backend.state(), SourceState::Playing);

        backend.set_auto_complete(true);
        assert!(wait_until(|| engine.state() == PlaybackState::Stopped));
        assert_eq!(engine.status().end_reason, Some(EndReason::Eof));
        assert_eq!(engine.position_ms(), engine.length_ms());
    }

    #[test]
    fn pause_while_worker_starts_source_leaves_it_paused() {
        let backend = Arc::new(MockBackend::manual());
        let engine = engine(&backend, 882 * 50, 5);
        backend.hold_worker_at(Call::Play);
        engine.play().unwrap();
        assert!(wait_until(|| backend.worker_held()));

        thread::scope(|s| {
            let pausing = s.spawn(|| engine.pause());
            thread::sleep(Duration::from_millis(20));
            backend.release_worker();
            pausing.join().unwrap().unwrap();
        });

        assert_eq!(engine.state(), PlaybackState::Paused);
        assert_eq!(backend.state(), SourceState::Paused);
        engine.stop().unwrap();
        assert_eq!(backend.queued(), 0);
    }

    #[test]
    fn pause_resume_keeps_position_and_filled_buffers() {
        let backend = Arc::new(MockBackend::manual());
        let engine = engine(&backend, 882 * 50, 5);
        engine.play().unwrap();
        assert!(wait_until(|| backend.submits() >= BUFFER_COUNT));
        backend.complete(2);
        assert!(wait_until(|| backend.submits() >= BUFFER_COUNT + 2));

        engine.pause().unwrap();
        assert_eq!(engine.state(), PlaybackState::Paused);
        thread::sleep(Duration::from_millis(20));
        let position = engine.position_ms();
        let submits = backend.submits();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(engine.position_ms(), position);
        assert_eq!(backend.submits(), submits);

        engine.resume().unwrap();
        assert_eq!(engine.state(), PlaybackState::Playing);
        assert!(engine.position_ms() >= position);
        assert_eq!(backend.submits(), submits);

        backend.set_auto_complete(true);
        assert!(wait_until(|| engine.state() == PlaybackState::Stopped));
        assert_eq!(engine.position_ms(), engine.length_ms());
        assert_eq!(backend.submits(), 50);
        assert!(backend.max_queued() <= BUFFER_COUNT);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn position_is_monotonic_and_bounded_while_playing() {
        let backend = Arc::new(MockBackend::auto());
        let engine = engine(&backend, 882 * 400, 5);
        engine.play().unwrap();

        let mut last = 0;
        while engine.state() == PlaybackState::Playing {
            let pos = engine.position_ms();
            assert!(pos >= last, "position went back from {last} to {pos}");
            assert!(pos <= engine.length_ms());
            last = pos;
        }
        assert_eq!(engine.position_ms(), engine.length_ms());
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn transitions_notify_before_call_returns() {
        let backend = Arc::new(MockBackend::manual());
        let engine = engine(&backend, 882 * 50, 5);
        let seen: Arc<Mutex<Vec<PlaybackState>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let _sub = engine.subscribe(move |change| seen_cb.lock().unwrap().push(change.state));

        engine.play().unwrap();
        assert_eq!(seen.lock().unwrap().last(), Some(&PlaybackState::Playing));
        engine.pause().unwrap();
        assert_eq!(seen.lock().unwrap().last(), Some(&PlaybackState::Paused));
        engine.resume().unwrap();
        assert_eq!(seen.lock().unwrap().last(), Some(&PlaybackState::Playing));
        engine.pause().unwrap();
        engine.stop().unwrap();
        assert_eq!(seen.lock().unwrap().last(), Some(&PlaybackState::Stopped));
    }

    #[test]
    fn backend_fault_surfaces_as_failure_payload() {
        let backend = Arc::new(MockBackend::auto());
        backend.fail_on_submit(BUFFER_COUNT + 2);
        let engine = engine(&backend, 882 * 50, 5);
        let (rx, _sub) = engine.subscribe_channel();

        engine.play().unwrap();

        assert_eq!(next_change(&rx).state, PlaybackState::Playing);
        let stopped = next_change(&rx);
        assert_eq!(stopped.state, PlaybackState::Stopped);
        assert_eq!(stopped.end_reason, Some(EndReason::Error));
        let failure = stopped.failure.expect("failure payload");
        assert!(matches!(*failure, EngineError::Backend(_)));
        assert_eq!(engine.status().end_reason, Some(EndReason::Error));

        engine.stop().unwrap();
        assert_eq!(backend.queued(), 0);
    }

    #[test]
    fn misuse_transitions_are_noops() {
        let backend = Arc::new(MockBackend::manual());
        let engine = engine(&backend, 882 * 10, 5);
        let (rx, _sub) = engine.subscribe_channel();
        let before = backend.calls().len();

        engine.resume().unwrap();
        engine.pause().unwrap();

        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert_eq!(backend.calls().len(), before);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn seek_while_stopped_moves_position_and_play_continues_there() {
        let backend = Arc::new(MockBackend::auto());
        let engine = engine(&backend, 4 * 8820, 50);
        engine.seek(100).unwrap();
        assert_eq!(engine.position_ms(), 100);
        assert_eq!(engine.state(), PlaybackState::Stopped);

        engine.play().unwrap();
        assert!(wait_until(|| engine.state() == PlaybackState::Stopped));
        assert_eq!(engine.position_ms(), 200);
        assert_eq!(backend.submits(), 2);
    }

    #[test]
    fn seek_while_playing_restarts_at_new_position() {
        let backend = Arc::new(MockBackend::manual());
        let engine = engine(&backend, 882 * 100, 5);
        engine.play().unwrap();
        assert!(wait_until(|| backend.submits() >= BUFFER_COUNT));
        backend.set_auto_complete(true);

        engine.seek(400).unwrap();
        assert!(wait_until(|| engine.state() == PlaybackState::Stopped));
        assert_eq!(engine.position_ms(), engine.length_ms());
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn play_after_end_of_stream_rewinds() {
        let backend = Arc::new(MockBackend::auto());
        let engine = engine(&backend, 2 * 8820, 50);
        engine.play().unwrap();
        assert!(wait_until(|| engine.state() == PlaybackState::Stopped));

        engine.play().unwrap();
        assert!(wait_until(|| {
            engine.state() == PlaybackState::Stopped && backend.submits() == 4
        }));
        assert_eq!(engine.position_ms(), engine.length_ms());
    }

    #[test]
    fn dispose_releases_everything_and_is_idempotent() {
        let backend = Arc::new(MockBackend::auto());
        let engine = engine(&backend, 882 * 200, 5);
        engine.play().unwrap();

        engine.dispose().unwrap();
        engine.dispose().unwrap();

        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.live_sources(), 0);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
        let calls = backend.calls();
        let buffers_deleted = calls
            .iter()
            .position(|c| matches!(c, Call::DeleteBuffers(_)))
            .unwrap();
        let source_deleted = calls.iter().position(|c| *c == Call::DeleteSource).unwrap();
        assert!(buffers_deleted < source_deleted);
        assert!(matches!(engine.play(), Err(EngineError::Disposed)));
        assert!(matches!(engine.pause(), Err(EngineError::Disposed)));
        engine.stop().unwrap();
    }

    #[test]
    fn dispose_without_play_allocates_no_buffers() {
        let backend = Arc::new(MockBackend::auto());
        let engine = engine(&backend, 8820, 50);
        engine.dispose().unwrap();
        assert_eq!(backend.live_sources(), 0);
        assert!(!backend.calls().iter().any(|c| matches!(c, Call::Allocate(_))));
    }

    #[test]
    fn drop_disposes_engine() {
        let backend = Arc::new(MockBackend::auto());
        {
            let engine = engine(&backend, 882 * 100, 5);
            engine.play().unwrap();
        }
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.live_sources(), 0);
    }
}
