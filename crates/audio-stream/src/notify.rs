//! State-change notifications.
//!
//! Observers are plain callbacks invoked synchronously on the thread that made
//! the transition: the caller's thread for control calls, the playback worker
//! for the terminal end-of-stream / fault notification.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use audio_stream_types::{EndReason, PlaybackState};
use crossbeam_channel::{Receiver, Sender};

use crate::error::EngineError;

/// Payload delivered to observers after the engine state changed.
#[derive(Clone, Debug)]
pub struct StateChange {
    pub state: PlaybackState,
    pub position_ms: u64,
    /// Set on transitions to `Stopped`.
    pub end_reason: Option<EndReason>,
    /// The fault that ended playback, if any.
    pub failure: Option<Arc<EngineError>>,
}

impl StateChange {
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

type Callback = Arc<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Callback)>>,
}

/// Set of registered observers.
#[derive(Clone, Default)]
pub struct Observers {
    registry: Arc<Registry>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback`; it stays registered until the returned handle is dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Register an observer that forwards every change onto an unbounded channel.
    pub fn subscribe_channel(&self) -> (Receiver<StateChange>, Subscription) {
        let (tx, rx): (Sender<StateChange>, Receiver<StateChange>) = crossbeam_channel::unbounded();
        let sub = self.subscribe(move |change| {
            let _ = tx.send(change.clone());
        });
        (rx, sub)
    }

    /// Invoke every observer in registration order.
    ///
    /// The registry lock is not held while callbacks run, so a callback may
    /// subscribe or unsubscribe.
    pub fn notify(&self, change: &StateChange) {
        let snapshot: Vec<Callback> = self
            .registry
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in snapshot {
            cb(change);
        }
    }

    pub fn len(&self) -> usize {
        self.registry
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration handle; unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes the observer"]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}
