//! Fixed ring of backend buffers.
//!
//! The ring owns [`BUFFER_COUNT`] buffer handles. It never records which of them
//! are in flight: the backend is the authority, and a handle is only treated as
//! free after [`BufferRing::unqueue`] got it back as processed (or before it was
//! ever queued).

use std::thread;
use std::time::Duration;

use crate::backend::{AudioBackend, BufferId, Current, SourceId};
use crate::config::PlaybackConfig;
use crate::error::Result;
use crate::format::BufferFormat;
use crate::source::{PcmSource, read_full};

/// Number of buffers in the ring.
pub const BUFFER_COUNT: usize = 4;

/// Poll interval of [`BufferRing::wait_drain`].
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of one [`BufferRing::fill`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FillOutcome {
    /// Buffers submitted and queued on the source.
    pub queued: usize,
    /// A read came back empty; the remaining buffers were left unqueued.
    pub exhausted: bool,
}

pub struct BufferRing {
    ids: Option<Vec<BufferId>>,
    buffer_bytes: usize,
    buffer_format: BufferFormat,
    sample_rate: u32,
    scratch: Vec<u8>,
}

impl BufferRing {
    pub fn new(config: &PlaybackConfig) -> Self {
        Self {
            ids: None,
            buffer_bytes: config.buffer_bytes,
            buffer_format: config.buffer_format,
            sample_rate: config.format.sample_rate,
            scratch: Vec::new(),
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.ids.is_some()
    }

    /// All ring handles; empty until [`BufferRing::create_buffers`] ran.
    pub fn ids(&self) -> &[BufferId] {
        self.ids.as_deref().unwrap_or(&[])
    }

    /// Allocate the ring's handles. Only the first call allocates.
    pub fn create_buffers(
        &mut self,
        backend: &dyn AudioBackend,
        cx: &Current,
        n: usize,
    ) -> Result<()> {
        if self.ids.is_some() {
            return Ok(());
        }
        let ids = backend.allocate_buffers(cx, n)?;
        tracing::debug!(count = ids.len(), bytes = self.buffer_bytes, "ring buffers allocated");
        self.scratch = vec![0; self.buffer_bytes];
        self.ids = Some(ids);
        Ok(())
    }

    /// Detach up to `count` processed buffers from the source; they are free afterwards.
    pub fn unqueue(
        &self,
        backend: &dyn AudioBackend,
        cx: &Current,
        source: SourceId,
        count: usize,
    ) -> Result<Vec<BufferId>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        Ok(backend.dequeue_processed(cx, source, count)?)
    }

    /// Refill free buffers from `pcm` and queue them on the source.
    ///
    /// Stops at the first empty read. Buffers not filled stay unqueued, which is
    /// how end of stream reaches the backend.
    pub fn fill(
        &mut self,
        backend: &dyn AudioBackend,
        cx: &Current,
        source: SourceId,
        pcm: &mut dyn PcmSource,
        free: &[BufferId],
    ) -> Result<FillOutcome> {
        let mut outcome = FillOutcome::default();
        if self.scratch.len() != self.buffer_bytes {
            self.scratch = vec![0; self.buffer_bytes];
        }
        for &id in free {
            let want = (self.buffer_bytes as u64).min(pcm.remaining()) as usize;
            let got = if want == 0 {
                0
            } else {
                read_full(pcm, &mut self.scratch[..want])?
            };
            if got == 0 {
                outcome.exhausted = true;
                break;
            }
            backend.submit_data(
                cx,
                id,
                self.buffer_format,
                &self.scratch[..got],
                self.sample_rate,
            )?;
            backend.enqueue(cx, source, &[id])?;
            outcome.queued += 1;
        }
        Ok(outcome)
    }

    /// Block until the backend reports no buffer queued on `source`.
    ///
    /// Processed buffers are detached on every pass. There is no timeout: a
    /// backend that never finishes its queue blocks the caller indefinitely.
    pub fn wait_drain(
        &self,
        backend: &dyn AudioBackend,
        cx: &Current,
        source: SourceId,
    ) -> Result<()> {
        if !self.is_allocated() {
            return Ok(());
        }
        loop {
            let processed = backend.processed_count(cx, source)?;
            self.unqueue(backend, cx, source, processed)?;
            let queued = backend.queued_count(cx, source)?;
            if queued == 0 {
                return Ok(());
            }
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
    }

    /// Detach anything still processed and delete every handle.
    ///
    /// Safe to call repeatedly and on a ring that was never allocated.
    pub fn release(
        &mut self,
        backend: &dyn AudioBackend,
        cx: &Current,
        source: SourceId,
    ) -> Result<()> {
        let Some(ids) = self.ids.take() else {
            return Ok(());
        };
        let processed = backend.processed_count(cx, source)?;
        self.unqueue(backend, cx, source, processed)?;
        backend.delete_buffers(cx, &ids)?;
        tracing::debug!(count = ids.len(), "ring buffers released");
        Ok(())
    }
}
