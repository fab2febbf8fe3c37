//! Capability surface of the native audio output.
//!
//! The engine never talks to a device directly. It drives an [`AudioBackend`]
//! through a small queued-source model:
//! - buffers are allocated once, filled with PCM bytes and queued on a source
//! - the backend plays queued buffers in order and reports how many finished
//! - finished ("processed") buffers are dequeued and may then be refilled
//!
//! Backend contexts are thread-affine. [`AudioBackend::make_current`] binds the
//! context to the calling thread and returns a [`Current`] token; every other
//! call requires that token, and the token cannot leave the thread.

use std::marker::PhantomData;

use crate::error::BackendError;
use crate::format::BufferFormat;

#[cfg(test)]
pub(crate) mod mock;

/// Opaque backend buffer handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

/// Opaque backend source handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SourceId(pub u32);

/// Playback state of a backend source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    /// Created, never played.
    Initial,
    Playing,
    Paused,
    /// Stopped explicitly, or ran out of queued buffers.
    Stopped,
}

/// Proof that the backend context is bound to the current thread.
///
/// `!Send` and `!Sync`: a token minted on one thread cannot be used from another.
#[derive(Debug)]
pub struct Current {
    _thread_bound: PhantomData<*const ()>,
}

impl Current {
    /// Mint a token. Backend implementations call this after binding their context.
    pub fn bind() -> Self {
        Self {
            _thread_bound: PhantomData,
        }
    }
}

/// Buffer and source primitives required by the playback engine.
pub trait AudioBackend: Send + Sync {
    /// Bind the backend context to the calling thread.
    fn make_current(&self) -> Result<Current, BackendError>;

    fn create_source(&self, cx: &Current) -> Result<SourceId, BackendError>;
    fn delete_source(&self, cx: &Current, source: SourceId) -> Result<(), BackendError>;

    fn allocate_buffers(&self, cx: &Current, n: usize) -> Result<Vec<BufferId>, BackendError>;
    fn delete_buffers(&self, cx: &Current, buffers: &[BufferId]) -> Result<(), BackendError>;

    /// Replace the contents of a (non-queued) buffer.
    fn submit_data(
        &self,
        cx: &Current,
        buffer: BufferId,
        format: BufferFormat,
        data: &[u8],
        sample_rate: u32,
    ) -> Result<(), BackendError>;

    /// Append buffers to the source's play queue.
    fn enqueue(&self, cx: &Current, source: SourceId, buffers: &[BufferId])
    -> Result<(), BackendError>;

    /// Detach up to `count` processed buffers from the front of the queue.
    fn dequeue_processed(
        &self,
        cx: &Current,
        source: SourceId,
        count: usize,
    ) -> Result<Vec<BufferId>, BackendError>;

    fn play(&self, cx: &Current, source: SourceId) -> Result<(), BackendError>;
    fn pause(&self, cx: &Current, source: SourceId) -> Result<(), BackendError>;
    /// Stop the source; every queued buffer becomes processed.
    fn stop(&self, cx: &Current, source: SourceId) -> Result<(), BackendError>;

    /// Buffers finished playing but still attached to the queue.
    fn processed_count(&self, cx: &Current, source: SourceId) -> Result<usize, BackendError>;
    /// Buffers attached to the queue, processed ones included.
    fn queued_count(&self, cx: &Current, source: SourceId) -> Result<usize, BackendError>;
    fn source_state(&self, cx: &Current, source: SourceId) -> Result<SourceState, BackendError>;
}
