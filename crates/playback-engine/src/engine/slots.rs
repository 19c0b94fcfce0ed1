//! The previous/current/next window the audio callback plays from.

use std::sync::Arc;

use crate::format::StreamFormat;
use crate::source::TrackIdentity;
use crate::track_cache::DecoderLease;

/// A current track still opening. It becomes `current` once its open commits.
pub(crate) struct PendingTarget {
    pub lease: DecoderLease,
    pub index: i64,
    pub generation: u64,
    /// Seek requested while opening; applied right before commit.
    pub seek_ms: Option<u64>,
}

/// Everything the audio callback reads, behind one mutex.
///
/// The callback only ever `try_lock`s this, so non-realtime holders keep their
/// critical sections short and never block on I/O while holding it.
pub(crate) struct Slots {
    pub previous: Option<DecoderLease>,
    pub current: Option<DecoderLease>,
    pub next: Option<DecoderLease>,
    pub previous_index: i64,
    pub current_index: i64,
    pub next_index: i64,
    pub pending: Option<PendingTarget>,
    /// Format the output was last started with.
    pub device_format: Option<StreamFormat>,
    /// The whole queue of the last applied request (previous list then next list).
    pub queue: Arc<Vec<TrackIdentity>>,
    /// Generation of the request `queue` came from.
    pub generation: u64,
}

impl Default for Slots {
    fn default() -> Self {
        Self {
            previous: None,
            current: None,
            next: None,
            previous_index: -1,
            current_index: -1,
            next_index: -1,
            pending: None,
            device_format: None,
            queue: Arc::new(Vec::new()),
            generation: 0,
        }
    }
}

impl Slots {
    /// Index playback is heading to: the pending target if any, else current.
    pub fn active_index(&self) -> i64 {
        self.pending
            .as_ref()
            .map_or(self.current_index, |p| p.index)
    }

    pub fn is_current(&self, lease: &DecoderLease) -> bool {
        self.current.as_ref().is_some_and(|c| c.same_decoder(lease))
    }

    /// Promote `next` to `current`. Only moves leases, so it is safe in the callback.
    pub fn advance(&mut self) -> bool {
        let Some(next) = self.next.take() else {
            return false;
        };
        self.previous = self.current.replace(next);
        self.previous_index = self.current_index;
        self.current_index = self.next_index;
        self.next_index = -1;
        true
    }

    /// Drop every lease and forget the pending target.
    pub fn detach(&mut self) {
        self.previous = None;
        self.current = None;
        self.next = None;
        self.pending = None;
        self.previous_index = -1;
        self.next_index = -1;
    }
}
