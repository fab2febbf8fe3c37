//! In-memory backend used by unit tests.
//!
//! Mirrors the queued-source model and records every call plus any invariant
//! violation (double queue, refill of an attached buffer, deleting an attached
//! buffer) instead of panicking, so worker-thread misuse is visible to tests.

use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;

use super::{AudioBackend, BufferId, Current, SourceId, SourceState};
use crate::error::BackendError;
use crate::format::BufferFormat;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    MakeCurrent,
    CreateSource,
    DeleteSource,
    Allocate(usize),
    DeleteBuffers(Vec<BufferId>),
    Submit(BufferId, usize),
    Enqueue(Vec<BufferId>),
    Dequeue(usize),
    Play,
    Pause,
    Stop,
    ProcessedCount,
    QueuedCount,
    SourceState,
}

struct MockState {
    next_id: u32,
    sources: HashSet<u32>,
    live: HashSet<BufferId>,
    pending: VecDeque<BufferId>,
    processed: VecDeque<BufferId>,
    state: SourceState,
    auto_complete: bool,
    max_queued: usize,
    submits: usize,
    fail_on_submit: Option<usize>,
    calls: Vec<Call>,
    violations: Vec<String>,
    /// Call the playback worker blocks on until released.
    hold: Option<Call>,
    held: bool,
}

impl MockState {
    fn attached(&self, id: BufferId) -> bool {
        self.pending.contains(&id) || self.processed.contains(&id)
    }

    fn finish_one(&mut self) {
        if let Some(id) = self.pending.pop_front() {
            self.processed.push_back(id);
        }
        if self.pending.is_empty() && self.state == SourceState::Playing {
            self.state = SourceState::Stopped;
        }
    }
}

pub(crate) struct MockBackend {
    inner: Mutex<MockState>,
    released: Condvar,
}

impl MockBackend {
    /// Backend where one queued buffer finishes per processed-count query while playing.
    pub(crate) fn auto() -> Self {
        Self::with_auto_complete(true)
    }

    /// Backend where buffers only finish when the test calls [`MockBackend::complete`].
    pub(crate) fn manual() -> Self {
        Self::with_auto_complete(false)
    }

    fn with_auto_complete(auto_complete: bool) -> Self {
        Self {
            inner: Mutex::new(MockState {
                next_id: 1,
                sources: HashSet::new(),
                live: HashSet::new(),
                pending: VecDeque::new(),
                processed: VecDeque::new(),
                state: SourceState::Initial,
                auto_complete,
                max_queued: 0,
                submits: 0,
                fail_on_submit: None,
                calls: Vec::new(),
                violations: Vec::new(),
                hold: None,
                held: false,
            }),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap()
    }

    pub(crate) fn set_auto_complete(&self, on: bool) {
        self.lock().auto_complete = on;
    }

    /// Finish up to `n` queued buffers.
    pub(crate) fn complete(&self, n: usize) {
        let mut st = self.lock();
        for _ in 0..n {
            st.finish_one();
        }
    }

    /// Fail the `n`th submit (1-based) and every one after it.
    pub(crate) fn fail_on_submit(&self, n: usize) {
        self.lock().fail_on_submit = Some(n);
    }

    /// Block the playback worker thread when it makes `call`, until [`MockBackend::release_worker`].
    pub(crate) fn hold_worker_at(&self, call: Call) {
        self.lock().hold = Some(call);
    }

    pub(crate) fn release_worker(&self) {
        self.lock().hold = None;
        self.released.notify_all();
    }

    /// The worker is currently blocked at the held call.
    pub(crate) fn worker_held(&self) -> bool {
        self.lock().held
    }

    fn pass_hold<'a>(
        &'a self,
        mut st: MutexGuard<'a, MockState>,
        call: &Call,
    ) -> MutexGuard<'a, MockState> {
        let on_worker = thread::current().name() == Some("audio-stream");
        if on_worker && st.hold.as_ref() == Some(call) {
            st.held = true;
            st = self
                .released
                .wait_while(st, |s| s.hold.is_some())
                .unwrap();
            st.held = false;
        }
        st
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub(crate) fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    pub(crate) fn max_queued(&self) -> usize {
        self.lock().max_queued
    }

    pub(crate) fn queued(&self) -> usize {
        let st = self.lock();
        st.pending.len() + st.processed.len()
    }

    pub(crate) fn submits(&self) -> usize {
        self.lock().submits
    }

    pub(crate) fn live_buffers(&self) -> usize {
        self.lock().live.len()
    }

    pub(crate) fn live_sources(&self) -> usize {
        self.lock().sources.len()
    }

    pub(crate) fn state(&self) -> SourceState {
        self.lock().state
    }

    fn check_source(st: &MockState, source: SourceId) -> Result<(), BackendError> {
        if st.sources.contains(&source.0) {
            Ok(())
        } else {
            Err(BackendError::InvalidSource(source))
        }
    }
}

impl AudioBackend for MockBackend {
    fn make_current(&self) -> Result<Current, BackendError> {
        let mut st = self.lock();
        st.calls.push(Call::MakeCurrent);
        drop(self.pass_hold(st, &Call::MakeCurrent));
        Ok(Current::bind())
    }

    fn create_source(&self, _cx: &Current) -> Result<SourceId, BackendError> {
        let mut st = self.lock();
        st.calls.push(Call::CreateSource);
        let id = st.next_id;
        st.next_id += 1;
        st.sources.insert(id);
        Ok(SourceId(id))
    }

    fn delete_source(&self, _cx: &Current, source: SourceId) -> Result<(), BackendError> {
        let mut st = self.lock();
        st.calls.push(Call::DeleteSource);
        if !st.sources.remove(&source.0) {
            return Err(BackendError::InvalidSource(source));
        }
        st.pending.clear();
        st.processed.clear();
        Ok(())
    }

    fn allocate_buffers(&self, _cx: &Current, n: usize) -> Result<Vec<BufferId>, BackendError> {
        let mut st = self.lock();
        st.calls.push(Call::Allocate(n));
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let id = BufferId(st.next_id);
            st.next_id += 1;
            st.live.insert(id);
            out.push(id);
        }
        Ok(out)
    }

    fn delete_buffers(&self, _cx: &Current, buffers: &[BufferId]) -> Result<(), BackendError> {
        let mut st = self.lock();
        st.calls.push(Call::DeleteBuffers(buffers.to_vec()));
        for id in buffers {
            if st.attached(*id) {
                st.violations.push(format!("deleted attached buffer {id:?}"));
            }
            if !st.live.remove(id) {
                return Err(BackendError::InvalidBuffer(*id));
            }
        }
        Ok(())
    }

    fn submit_data(
        &self,
        _cx: &Current,
        buffer: BufferId,
        _format: BufferFormat,
        data: &[u8],
        _sample_rate: u32,
    ) -> Result<(), BackendError> {
        let mut st = self.lock();
        st.calls.push(Call::Submit(buffer, data.len()));
        st.submits += 1;
        if st.fail_on_submit.is_some_and(|n| st.submits >= n) {
            return Err(BackendError::ContextLost);
        }
        if !st.live.contains(&buffer) {
            return Err(BackendError::InvalidBuffer(buffer));
        }
        if st.attached(buffer) {
            st.violations.push(format!("refilled in-flight buffer {buffer:?}"));
        }
        Ok(())
    }

    fn enqueue(
        &self,
        _cx: &Current,
        source: SourceId,
        buffers: &[BufferId],
    ) -> Result<(), BackendError> {
        let mut st = self.lock();
        st.calls.push(Call::Enqueue(buffers.to_vec()));
        Self::check_source(&st, source)?;
        for id in buffers {
            if st.attached(*id) {
                st.violations.push(format!("double queue of {id:?}"));
                continue;
            }
            st.pending.push_back(*id);
        }
        let queued = st.pending.len() + st.processed.len();
        st.max_queued = st.max_queued.max(queued);
        Ok(())
    }

    fn dequeue_processed(
        &self,
        _cx: &Current,
        source: SourceId,
        count: usize,
    ) -> Result<Vec<BufferId>, BackendError> {
        let mut st = self.lock();
        st.calls.push(Call::Dequeue(count));
        Self::check_source(&st, source)?;
        let take = count.min(st.processed.len());
        Ok(st.processed.drain(..take).collect())
    }

    fn play(&self, _cx: &Current, source: SourceId) -> Result<(), BackendError> {
        let mut st = self.lock();
        st.calls.push(Call::Play);
        let mut st = self.pass_hold(st, &Call::Play);
        Self::check_source(&st, source)?;
        st.state = SourceState::Playing;
        Ok(())
    }

    fn pause(&self, _cx: &Current, source: SourceId) -> Result<(), BackendError> {
        let mut st = self.lock();
        st.calls.push(Call::Pause);
        Self::check_source(&st, source)?;
        if st.state == SourceState::Playing {
            st.state = SourceState::Paused;
        }
        Ok(())
    }

    fn stop(&self, _cx: &Current, source: SourceId) -> Result<(), BackendError> {
        let mut st = self.lock();
        st.calls.push(Call::Stop);
        Self::check_source(&st, source)?;
        while let Some(id) = st.pending.pop_front() {
            st.processed.push_back(id);
        }
        st.state = SourceState::Stopped;
        Ok(())
    }

    fn processed_count(&self, _cx: &Current, source: SourceId) -> Result<usize, BackendError> {
        let mut st = self.lock();
        st.calls.push(Call::ProcessedCount);
        Self::check_source(&st, source)?;
        if st.auto_complete && st.state == SourceState::Playing {
            st.finish_one();
        }
        Ok(st.processed.len())
    }

    fn queued_count(&self, _cx: &Current, source: SourceId) -> Result<usize, BackendError> {
        let mut st = self.lock();
        st.calls.push(Call::QueuedCount);
        Self::check_source(&st, source)?;
        Ok(st.pending.len() + st.processed.len())
    }

    fn source_state(&self, _cx: &Current, source: SourceId) -> Result<SourceState, BackendError> {
        let mut st = self.lock();
        st.calls.push(Call::SourceState);
        Self::check_source(&st, source)?;
        Ok(st.state)
    }
}
