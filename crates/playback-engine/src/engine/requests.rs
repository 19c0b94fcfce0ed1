//! Single-slot, last-write-wins queue feeding the engine worker.

use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::source::TrackIdentity;
use crate::sync::lock;

/// A queue to apply, with `index` the position of the current track in it.
#[derive(Clone, Debug)]
pub(crate) struct QueueRequest {
    pub queue: Arc<Vec<TrackIdentity>>,
    pub index: Option<usize>,
    pub generation: u64,
    pub seek_ms: Option<u64>,
}

impl QueueRequest {
    pub fn current(&self) -> Option<&TrackIdentity> {
        self.index.and_then(|i| self.queue.get(i))
    }
}

pub(crate) enum Work {
    Apply(QueueRequest),
    /// Re-apply the window around the current index (after an advance or loop change).
    Refresh,
    Shutdown,
}

#[derive(Default)]
struct Pending {
    request: Option<QueueRequest>,
    refresh: bool,
    shutdown: bool,
}

#[derive(Default)]
pub(crate) struct RequestQueue {
    pending: Mutex<Pending>,
    ready: Condvar,
}

impl RequestQueue {
    /// Replace any unprocessed request with `request`.
    pub fn submit(&self, request: QueueRequest) {
        let mut pending = lock(&self.pending);
        if let Some(old) = pending.request.replace(request) {
            tracing::debug!(generation = old.generation, "superseded queued request");
        }
        self.ready.notify_one();
    }

    pub fn request_refresh(&self) {
        lock(&self.pending).refresh = true;
        self.ready.notify_one();
    }

    pub fn shutdown(&self) {
        lock(&self.pending).shutdown = true;
        self.ready.notify_all();
    }

    /// Block until there is work. A full request absorbs a pending refresh.
    pub fn next(&self) -> Work {
        let guard = lock(&self.pending);
        let mut pending = self
            .ready
            .wait_while(guard, |p| p.request.is_none() && !p.refresh && !p.shutdown)
            .unwrap_or_else(PoisonError::into_inner);
        if pending.shutdown {
            return Work::Shutdown;
        }
        pending.refresh = false;
        match pending.request.take() {
            Some(request) => Work::Apply(request),
            None => Work::Refresh,
        }
    }
}
