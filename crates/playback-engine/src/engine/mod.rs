//! Playback orchestration.
//!
//! The engine keeps a previous/current/next window of decoders around the playback
//! cursor and renders the current one into the output device.
//!
//! Threads:
//! - audio callback (owned by the output): [`Renderer::render`], never blocks
//! - worker: drains the coalescing request queue and applies queue changes
//! - maintenance: device restarts and window refreshes flagged by the callback
//! - event dispatcher: delivers notifications to the [`EventSink`]
//! - short-lived helpers: background opens and neighbour rewinds

mod apply;
mod maintenance;
mod render;
mod requests;
mod slots;

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};

use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventSink, Notifier};
use crate::output::AudioOutput;
use crate::source::{SourceProvider, TrackIdentity};
use crate::status::{LoopMode, PlayerStatus, ProcessingState};
use crate::sync::lock;
use crate::track_cache::DecoderCache;

use maintenance::RtSignals;
use requests::{QueueRequest, RequestQueue, Work};
use slots::Slots;

pub use render::Renderer;

pub(crate) struct EngineInner {
    config: EngineConfig,
    cache: DecoderCache,
    output: Mutex<Box<dyn AudioOutput>>,
    slots: Mutex<Slots>,
    notifier: Notifier,
    requests: RequestQueue,
    signals: RtSignals,
    state: AtomicU8,
    loop_mode: AtomicU8,
    paused: AtomicBool,
    /// `f32` bits.
    volume: AtomicU32,
    auth_token: Mutex<String>,
    last_request_id: AtomicU64,
    seek_generation: AtomicU64,
    shutdown: AtomicBool,
}

impl EngineInner {
    pub(crate) fn state(&self) -> ProcessingState {
        ProcessingState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Record `state`, notifying only on an actual transition.
    pub(crate) fn set_state(&self, state: ProcessingState) {
        let old = self.state.swap(state.as_u8(), Ordering::AcqRel);
        if old != state.as_u8() {
            tracing::debug!(from = %ProcessingState::from_u8(old), to = %state, "processing state");
            self.notifier.send(EngineEvent::StateChanged(state));
        }
    }

    pub(crate) fn loop_mode(&self) -> LoopMode {
        LoopMode::from_u8(self.loop_mode.load(Ordering::Acquire))
    }

    pub(crate) fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    fn submit(&self, queue: Arc<Vec<TrackIdentity>>, index: Option<usize>, seek_ms: Option<u64>) {
        let generation = self.last_request_id.fetch_add(1, Ordering::AcqRel) + 1;
        self.requests.submit(QueueRequest {
            queue,
            index,
            generation,
            seek_ms,
        });
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            match self.requests.next() {
                Work::Apply(request) => self.apply(request),
                Work::Refresh => self.refresh(),
                Work::Shutdown => return,
            }
        }
    }
}

/// The playback engine. One per player.
///
/// Starts paused with an empty queue. Dropping it stops the output and closes every
/// decoder.
pub struct PlaybackEngine {
    inner: Arc<EngineInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackEngine {
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn SourceProvider>,
        output: Box<dyn AudioOutput>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let (notifier, dispatcher) = Notifier::spawn(sink)?;
        let (signals, wake) = RtSignals::new();
        let cache = DecoderCache::new(
            provider,
            config.decoder_settings(),
            config.max_open_decoders,
        );
        let inner = Arc::new(EngineInner {
            cache,
            output: Mutex::new(output),
            slots: Mutex::new(Slots::default()),
            notifier,
            requests: RequestQueue::default(),
            signals,
            state: AtomicU8::new(ProcessingState::Idle.as_u8()),
            loop_mode: AtomicU8::new(LoopMode::None.as_u8()),
            paused: AtomicBool::new(true),
            volume: AtomicU32::new(1.0f32.to_bits()),
            auth_token: Mutex::new(String::new()),
            last_request_id: AtomicU64::new(0),
            seek_generation: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            config,
        });

        let mut threads = Vec::new();
        let worker = inner.clone();
        threads.push(
            thread::Builder::new()
                .name("engine-worker".into())
                .spawn(move || worker.worker_loop())
                .context("spawn engine worker")?,
        );
        let maintenance = inner.clone();
        threads.push(
            thread::Builder::new()
                .name("engine-maintenance".into())
                .spawn(move || maintenance.maintenance_loop(wake))
                .context("spawn engine maintenance")?,
        );
        tracing::info!(
            max_open_decoders = inner.config.max_open_decoders,
            ring_seconds = inner.config.ring_seconds,
            "playback engine started"
        );

        Ok(Self {
            inner,
            threads: Mutex::new(threads),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Replace the queue. `previous` ends with the track to play; `next` follows it.
    ///
    /// Calls are coalesced: only the latest of a burst is fully applied.
    pub fn set_audios(&self, previous: Vec<TrackIdentity>, next: Vec<TrackIdentity>) {
        let index = previous.len().checked_sub(1);
        let mut queue = previous;
        queue.extend(next);
        tracing::debug!(tracks = queue.len(), index = ?index, "set audios");
        self.inner.submit(Arc::new(queue), index, None);
    }

    pub fn play(&self) {
        let inner = &self.inner;
        if inner.state() == ProcessingState::Completed {
            // Replay the finished track from the top.
            if let Err(e) = self.seek(0) {
                tracing::warn!(error = %e, "restart after completion failed");
            }
        }
        inner.paused.store(false, Ordering::Release);
        lock(&inner.output).set_paused(false);
        tracing::info!("play");
    }

    pub fn pause(&self) {
        let inner = &self.inner;
        inner.paused.store(true, Ordering::Release);
        lock(&inner.output).set_paused(true);
        tracing::info!("pause");
    }

    /// Move the current track to `position_ms`.
    ///
    /// If the current track is still opening the seek is recorded and applied when the
    /// open commits.
    pub fn seek(&self, position_ms: u64) -> Result<()> {
        let inner = &self.inner;
        let seek_generation = inner.seek_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let lease = {
            let mut slots = lock(&inner.slots);
            if let Some(pending) = slots.pending.as_mut() {
                pending.seek_ms = Some(position_ms);
                tracing::debug!(position_ms, "seek recorded for pending track");
                return Ok(());
            }
            slots.current.clone()
        };
        let Some(lease) = lease else {
            return Ok(());
        };

        lease.seek(position_ms).context("seek current track")?;
        tracing::debug!(position_ms, "seek");

        // A later seek or a track change owns the state now.
        let still_current = lock(&inner.slots).is_current(&lease);
        if still_current && inner.seek_generation.load(Ordering::Acquire) == seek_generation {
            let state = if lease.buffered_frames() > 0 {
                ProcessingState::Ready
            } else if lease.finished_reading() {
                ProcessingState::Completed
            } else {
                ProcessingState::Buffering
            };
            inner.set_state(state);
        }
        Ok(())
    }

    /// Skip to the following track; wraps to the first with loop mode All.
    pub fn next(&self) {
        let (queue, index) = self.queue_position();
        let Some(index) = index else {
            return;
        };
        let target = if index + 1 < queue.len() {
            index + 1
        } else if self.inner.loop_mode() == LoopMode::All {
            0
        } else {
            tracing::debug!("next at end of queue ignored");
            return;
        };
        self.inner.submit(queue, Some(target), None);
    }

    /// Skip to the preceding track; wraps with loop mode All, else restarts the first.
    pub fn prev(&self) -> Result<()> {
        let (queue, index) = self.queue_position();
        let Some(index) = index else {
            return Ok(());
        };
        let target = match index.checked_sub(1) {
            Some(i) => i,
            None if self.inner.loop_mode() == LoopMode::All => queue.len() - 1,
            None => return self.seek(0),
        };
        self.inner.submit(queue, Some(target), None);
        Ok(())
    }

    fn queue_position(&self) -> (Arc<Vec<TrackIdentity>>, Option<usize>) {
        let slots = lock(&self.inner.slots);
        let index = usize::try_from(slots.active_index())
            .ok()
            .filter(|i| *i < slots.queue.len());
        (slots.queue.clone(), index)
    }

    pub fn set_loop_mode(&self, mode: LoopMode) {
        let inner = &self.inner;
        let old = LoopMode::from_u8(inner.loop_mode.swap(mode.as_u8(), Ordering::AcqRel));
        if old == mode {
            return;
        }
        tracing::info!(mode = %mode, "loop mode");
        if let Some(current) = lock(&inner.slots).current.as_ref() {
            current.set_looping(mode == LoopMode::One);
        }
        inner.requests.request_refresh();
    }

    /// Token for sources opened from now on.
    pub fn set_auth_token(&self, token: impl Into<String>) {
        *lock(&self.inner.auth_token) = token.into();
    }

    /// Master volume, clamped to `[0, 1]`.
    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        self.inner.volume.store(volume.to_bits(), Ordering::Relaxed);
        lock(&self.inner.output).set_volume(volume);
    }

    pub fn is_playing(&self) -> bool {
        !self.inner.paused.load(Ordering::Acquire)
    }

    pub fn current_track_index(&self) -> i64 {
        lock(&self.inner.slots).active_index()
    }

    pub fn position_ms(&self) -> u64 {
        let slots = lock(&self.inner.slots);
        slots.current.as_ref().map_or(0, |c| c.playback_time_ms())
    }

    pub fn buffered_position_ms(&self) -> u64 {
        let slots = lock(&self.inner.slots);
        slots.current.as_ref().map_or(0, |c| c.buffered_time_ms())
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let slots = lock(&self.inner.slots);
        slots.current.as_ref().and_then(|c| c.duration_ms())
    }

    pub fn state(&self) -> ProcessingState {
        self.inner.state()
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.inner.loop_mode()
    }

    pub fn volume(&self) -> f32 {
        self.inner.volume()
    }

    pub fn status(&self) -> PlayerStatus {
        let inner = &self.inner;
        let slots = lock(&inner.slots);
        let current = slots.current.as_ref();
        PlayerStatus {
            playing: !inner.paused.load(Ordering::Acquire),
            track_index: slots.active_index(),
            position_ms: current.map_or(0, |c| c.playback_time_ms()),
            buffered_position_ms: current.map_or(0, |c| c.buffered_time_ms()),
            duration_ms: current.and_then(|c| c.duration_ms()),
            state: inner.state(),
            loop_mode: inner.loop_mode(),
            volume: inner.volume(),
            output_format: slots.device_format,
        }
    }

    /// Stop the output, join the engine threads and close every decoder. Idempotent.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.requests.shutdown();
        inner.signals.wake();
        for handle in std::mem::take(&mut *lock(&self.threads)) {
            if handle.join().is_err() {
                tracing::error!("engine thread panicked");
            }
        }
        lock(&inner.output).stop();
        {
            let mut slots = lock(&inner.slots);
            slots.detach();
            slots.device_format = None;
        }
        inner.cache.close_all();
        inner.notifier.shutdown();
        if let Some(handle) = lock(&self.dispatcher).take() {
            if handle.join().is_err() {
                tracing::error!("event dispatcher panicked");
            }
        }
        tracing::info!("playback engine stopped");
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests;
