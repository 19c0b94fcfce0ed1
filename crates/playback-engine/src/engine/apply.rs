//! Applying queue requests: resolving the current track, committing it to the
//! audio path and keeping the neighbour window primed.
//!
//! Every step that touches shared state re-checks the request generation first, and
//! commits happen under the output and slot locks (always taken in that order), so a
//! superseded request never becomes visible to the audio callback or the sink.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use crate::decode::DecoderState;
use crate::events::EngineEvent;
use crate::source::TrackIdentity;
use crate::status::{LoopMode, ProcessingState};
use crate::sync::lock;
use crate::track_cache::DecoderLease;

use super::EngineInner;
use super::requests::QueueRequest;
use super::slots::PendingTarget;

const SETTLE_POLL: Duration = Duration::from_millis(100);

impl EngineInner {
    pub(crate) fn superseded(&self, generation: u64) -> bool {
        self.last_request_id.load(Ordering::Acquire) != generation
    }

    pub(crate) fn apply(self: &Arc<Self>, request: QueueRequest) {
        if self.superseded(request.generation) {
            return;
        }
        let Some(identity) = request.current().cloned() else {
            self.apply_empty(&request);
            return;
        };
        let index = request.index.map_or(-1, |i| i as i64);
        {
            let mut slots = lock(&self.slots);
            slots.queue = request.queue.clone();
            slots.generation = request.generation;
        }

        let lease = self.cache.acquire(&identity);
        lease.set_max_preload_bytes(self.config.active_preload_bytes);
        if lease.is_opened() {
            let is_current = lock(&self.slots).is_current(&lease);
            let seek = request
                .seek_ms
                .or_else(|| (!is_current && Self::needs_rewind(&lease)).then_some(0));
            if let Some(ms) = seek {
                if let Err(e) = lease.seek(ms) {
                    tracing::warn!(track = %identity.cache_key(), error = %e, "seek before commit failed");
                }
            }
            self.commit_current(lease.clone(), index, request.generation, false);
        } else {
            self.begin_pending_open(lease.clone(), index, request.generation, request.seek_ms);
        }

        self.apply_window(&request, &lease);
    }

    /// Re-apply the window around the current index of the stored queue.
    pub(crate) fn refresh(self: &Arc<Self>) {
        let (queue, index, generation) = {
            let slots = lock(&self.slots);
            (slots.queue.clone(), slots.active_index(), slots.generation)
        };
        let Some(index) = usize::try_from(index).ok().filter(|i| *i < queue.len()) else {
            return;
        };
        // A newer request is queued; it recomputes everything anyway.
        if self.superseded(generation) {
            return;
        }
        let request = QueueRequest {
            queue,
            index: Some(index),
            generation,
            seek_ms: None,
        };
        self.apply(request);
    }

    fn apply_empty(&self, request: &QueueRequest) {
        let mut output = lock(&self.output);
        let mut slots = lock(&self.slots);
        if self.superseded(request.generation) {
            return;
        }
        slots.queue = request.queue.clone();
        slots.generation = request.generation;
        slots.detach();
        slots.current_index = -1;
        slots.device_format = None;
        drop(slots);
        output.stop();
        drop(output);
        tracing::info!("queue cleared");
        self.set_state(ProcessingState::Idle);
        self.cache.evict_unreferenced(&HashSet::new());
    }

    fn needs_rewind(lease: &DecoderLease) -> bool {
        lease.is_opened() && (lease.playback_time_ms() > 0 || lease.finished_reading())
    }

    /// Make an opened `lease` the current decoder.
    ///
    /// `from_open` commits are only valid while the lease is still the pending target.
    /// Returns `None` if nothing was committed, else the seek the pending target
    /// carried at the moment of the commit.
    fn commit_current(
        self: &Arc<Self>,
        lease: DecoderLease,
        index: i64,
        generation: u64,
        from_open: bool,
    ) -> Option<Option<u64>> {
        let format = lease.format()?;
        let mut output = lock(&self.output);
        let mut slots = lock(&self.slots);
        if self.superseded(generation) || self.shutdown.load(Ordering::Acquire) {
            return None;
        }
        let pending_seek = match slots.pending.as_ref() {
            Some(p) if p.lease.same_decoder(&lease) && p.index == index => p.seek_ms,
            _ if from_open => return None,
            _ => None,
        };

        let changed = !slots.is_current(&lease) || slots.current_index != index;
        let restart = slots.device_format != Some(format) || !output.is_running();
        lease.set_looping(self.loop_mode() == LoopMode::One);
        if changed {
            slots.previous = None;
            slots.next = None;
            slots.previous_index = -1;
            slots.next_index = -1;
        }
        slots.current = Some(lease);
        slots.current_index = index;
        slots.pending = None;

        if !restart {
            drop(slots);
            drop(output);
            if changed {
                tracing::info!(index, format = %format, "current track swapped");
                self.notifier.send(EngineEvent::AudioChanged(index));
                self.set_state(ProcessingState::Buffering);
            }
            return Some(pending_seek);
        }

        output.stop();
        slots.device_format = Some(format);
        drop(slots);
        tracing::info!(index, format = %format, "current track committed with output restart");
        if changed {
            self.notifier.send(EngineEvent::AudioChanged(index));
        }
        self.start_output(&mut **output, format);
        Some(pending_seek)
    }

    /// Detach the old current and open `lease` in the background.
    fn begin_pending_open(
        self: &Arc<Self>,
        lease: DecoderLease,
        index: i64,
        generation: u64,
        seek_ms: Option<u64>,
    ) {
        {
            let mut slots = lock(&self.slots);
            if self.superseded(generation) {
                return;
            }
            // Re-targeting the same track keeps a seek recorded against it.
            let carried = slots
                .pending
                .as_ref()
                .filter(|p| p.lease.same_decoder(&lease) && p.index == index)
                .and_then(|p| p.seek_ms);
            slots.detach();
            slots.pending = Some(PendingTarget {
                lease: lease.clone(),
                index,
                generation,
                seek_ms: seek_ms.or(carried),
            });
        }
        self.set_state(ProcessingState::Buffering);

        let engine = self.clone();
        let spawned = thread::Builder::new()
            .name("engine-open".into())
            .spawn(move || engine.finish_pending_open(lease, index, generation));
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn open thread");
            self.set_state(ProcessingState::Error);
        }
    }

    fn finish_pending_open(self: Arc<Self>, lease: DecoderLease, index: i64, generation: u64) {
        let opened = if lease.claim_open() {
            let token = lock(&self.auth_token).clone();
            lease.open(&token).is_ok()
        } else {
            self.wait_for_open(&lease, generation)
        };

        if !opened {
            let mut slots = lock(&self.slots);
            let still_target = slots
                .pending
                .as_ref()
                .is_some_and(|p| p.lease.same_decoder(&lease));
            if still_target && !self.superseded(generation) {
                slots.pending = None;
                drop(slots);
                tracing::error!(track = %lease.identity().cache_key(), "current track failed to open");
                self.set_state(ProcessingState::Error);
            }
            return;
        }

        let seek_ms = {
            let slots = lock(&self.slots);
            match slots.pending.as_ref() {
                Some(p) if p.lease.same_decoder(&lease) && p.generation == generation => p.seek_ms,
                _ => return,
            }
        };
        let applied = seek_ms.or_else(|| Self::needs_rewind(&lease).then_some(0));
        if let Some(ms) = applied {
            if let Err(e) = lease.seek(ms) {
                tracing::warn!(track = %lease.identity().cache_key(), error = %e, "pending seek failed");
            }
        }
        let Some(late_seek) = self.commit_current(lease.clone(), index, generation, true) else {
            return;
        };
        // A seek recorded after we read the target still applies.
        if let Some(ms) = late_seek.filter(|ms| Some(*ms) != seek_ms) {
            if let Err(e) = lease.seek(ms) {
                tracing::warn!(track = %lease.identity().cache_key(), error = %e, "late seek failed");
            }
        }
        self.requests.request_refresh();
    }

    /// Wait for an open someone else claimed. False if it failed or we were superseded.
    fn wait_for_open(&self, lease: &DecoderLease, generation: u64) -> bool {
        loop {
            match lease.wait_open_settled(SETTLE_POLL) {
                DecoderState::Opened | DecoderState::Retrying => return true,
                DecoderState::Error => return false,
                DecoderState::Closed if lease.claim_open() => {
                    let token = lock(&self.auth_token).clone();
                    return lease.open(&token).is_ok();
                }
                _ => {}
            }
            if self.superseded(generation) || self.shutdown.load(Ordering::Acquire) {
                return false;
            }
        }
    }

    /// Prime previous/next, keep the retention window warm and evict the rest.
    fn apply_window(self: &Arc<Self>, request: &QueueRequest, current: &DecoderLease) {
        if self.superseded(request.generation) {
            return;
        }
        let Some(index) = request.index else {
            return;
        };
        let queue = &request.queue;
        let loop_mode = self.loop_mode();

        let previous = index
            .checked_sub(1)
            .map(|i| (i, self.cache.acquire(&queue[i])));
        let next_index = if index + 1 < queue.len() {
            Some(index + 1)
        } else if loop_mode == LoopMode::All && !queue.is_empty() {
            Some(0)
        } else {
            None
        };
        let next = next_index
            .map(|i| (i, self.cache.acquire(&queue[i])))
            .filter(|(_, lease)| !lease.same_decoder(current));

        // A single-track queue looping "all" wraps onto itself.
        let self_wrap = next_index.is_some() && next.is_none();
        current.set_looping(loop_mode == LoopMode::One || self_wrap);

        for (_, lease) in previous.iter().chain(next.iter()) {
            lease.set_max_preload_bytes(self.config.neighbor_preload_bytes);
            self.prime(lease);
        }

        let keep = self.retained(queue, index, next_index);
        for identity in &keep {
            if let Some(lease) = self.cache.lookup(identity) {
                if !lease.same_decoder(current) {
                    lease.set_max_preload_bytes(self.config.neighbor_preload_bytes);
                }
            }
        }

        {
            let mut slots = lock(&self.slots);
            if self.superseded(request.generation) || slots.active_index() != index as i64 {
                return;
            }
            slots.previous_index = previous.as_ref().map_or(-1, |(i, _)| *i as i64);
            slots.previous = previous.map(|(_, lease)| lease);
            slots.next_index = next.as_ref().map_or(-1, |(i, _)| *i as i64);
            slots.next = next.map(|(_, lease)| lease);
        }

        let evicted = self.cache.evict_unreferenced(&keep);
        if evicted > 0 {
            tracing::debug!(evicted, cached = self.cache.len(), "evicted decoders");
        }
    }

    /// Identities kept warm: the tail of the previous list and the head of the next list.
    fn retained(
        &self,
        queue: &[TrackIdentity],
        index: usize,
        next_index: Option<usize>,
    ) -> HashSet<TrackIdentity> {
        let start = (index + 1).saturating_sub(self.config.retain_previous);
        let end = (index + 1 + self.config.retain_next).min(queue.len());
        let mut keep: HashSet<TrackIdentity> = queue[start..end].iter().cloned().collect();
        if let Some(i) = next_index {
            keep.insert(queue[i].clone());
        }
        keep
    }

    /// Open a neighbour in the background, or rewind it if it has been played.
    fn prime(self: &Arc<Self>, lease: &DecoderLease) {
        if lease.is_opened() {
            if !Self::needs_rewind(lease) {
                return;
            }
        } else if !lease.claim_open() {
            return;
        }
        let lease = lease.clone();
        let token = lock(&self.auth_token).clone();
        let spawned = thread::Builder::new()
            .name("engine-prime".into())
            .spawn(move || {
                if !lease.is_opened() {
                    if let Err(e) = lease.open(&token) {
                        tracing::warn!(track = %lease.identity().cache_key(), error = %e, "neighbour open failed");
                    }
                    return;
                }
                if let Err(e) = lease.seek(0) {
                    tracing::warn!(track = %lease.identity().cache_key(), error = %e, "neighbour rewind failed");
                }
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn prime thread");
        }
    }
}
