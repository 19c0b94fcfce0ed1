//! Outbound notifications to the embedding layer.
//!
//! The engine never calls the sink directly: events go through a bounded channel to a
//! dispatcher thread, so the audio callback only ever does a non-blocking `try_send`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use crate::status::ProcessingState;

const EVENT_QUEUE: usize = 256;
/// Marks an empty overflow slot.
const NO_INDEX: i64 = i64::MIN;

/// Receives engine notifications. Called from the dispatcher thread only.
pub trait EventSink: Send + Sync {
    /// The logical current track changed, or the current track looped.
    fn on_audio_changed(&self, track_index: i64);
    fn on_state_changed(&self, state: ProcessingState);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    AudioChanged(i64),
    StateChanged(ProcessingState),
}

/// Sink that drops everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn on_audio_changed(&self, _track_index: i64) {}
    fn on_state_changed(&self, _state: ProcessingState) {}
}

/// Sending half owned by the engine.
pub(crate) struct Notifier {
    tx: Sender<EngineEvent>,
    /// Latest audio change the callback could not queue.
    overflow: Arc<AtomicI64>,
    stop: Arc<AtomicBool>,
}

impl Notifier {
    /// Start the dispatcher thread feeding `sink`.
    pub(crate) fn spawn(sink: Arc<dyn EventSink>) -> Result<(Self, JoinHandle<()>)> {
        let (tx, rx) = bounded(EVENT_QUEUE);
        let overflow = Arc::new(AtomicI64::new(NO_INDEX));
        let stop = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher {
            rx,
            sink,
            overflow: overflow.clone(),
            stop: stop.clone(),
        };
        let handle = thread::Builder::new()
            .name("engine-events".into())
            .spawn(move || dispatcher.run())
            .context("spawn event dispatcher")?;
        Ok((Self { tx, overflow, stop }, handle))
    }

    /// Queue from a regular thread; a full queue is logged.
    pub(crate) fn send(&self, event: EngineEvent) {
        if let Err(TrySendError::Full(event)) = self.tx.try_send(event) {
            tracing::warn!(?event, "event queue full, dropping event");
        }
    }

    /// Queue from the audio callback. Never blocks and never logs.
    ///
    /// Audio changes that do not fit collapse into the overflow slot, and later ones
    /// follow them there until the dispatcher has drained the queue.
    pub(crate) fn send_rt(&self, event: EngineEvent) {
        if let EngineEvent::AudioChanged(index) = event {
            if self.overflow.load(Ordering::Acquire) != NO_INDEX {
                self.overflow.store(index, Ordering::Release);
                return;
            }
        }
        if let Err(TrySendError::Full(EngineEvent::AudioChanged(index))) = self.tx.try_send(event) {
            self.overflow.store(index, Ordering::Release);
        }
    }

    /// Ask the dispatcher to exit once the queue is drained.
    pub(crate) fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

struct Dispatcher {
    rx: Receiver<EngineEvent>,
    sink: Arc<dyn EventSink>,
    overflow: Arc<AtomicI64>,
    stop: Arc<AtomicBool>,
}

impl Dispatcher {
    fn run(self) {
        loop {
            match self.rx.recv_timeout(Duration::from_millis(50)) {
                Ok(EngineEvent::AudioChanged(index)) => self.sink.on_audio_changed(index),
                Ok(EngineEvent::StateChanged(state)) => self.sink.on_state_changed(state),
                Err(RecvTimeoutError::Timeout) => {
                    if self.stop.load(Ordering::Acquire) {
                        self.flush_overflow();
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.flush_overflow();
                    return;
                }
            }
            if self.rx.is_empty() {
                self.flush_overflow();
            }
        }
    }

    fn flush_overflow(&self) {
        let index = self.overflow.swap(NO_INDEX, Ordering::AcqRel);
        if index != NO_INDEX {
            self.sink.on_audio_changed(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::lock;
    use crate::test_support::{RecordingSink, wait_until};
    use std::sync::Mutex;

    /// Records events, but only while the test is not holding `gate`.
    #[derive(Default)]
    struct GatedSink {
        gate: Mutex<()>,
        inner: RecordingSink,
    }

    impl EventSink for GatedSink {
        fn on_audio_changed(&self, track_index: i64) {
            let _open = lock(&self.gate);
            self.inner.on_audio_changed(track_index);
        }

        fn on_state_changed(&self, state: ProcessingState) {
            let _open = lock(&self.gate);
            self.inner.on_state_changed(state);
        }
    }

    #[test]
    fn events_reach_sink_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let (notifier, handle) = Notifier::spawn(sink.clone()).unwrap();
        notifier.send(EngineEvent::StateChanged(ProcessingState::Buffering));
        notifier.send_rt(EngineEvent::AudioChanged(3));
        notifier.send(EngineEvent::StateChanged(ProcessingState::Ready));

        assert!(wait_until(Duration::from_secs(2), || sink.events().len() == 3));
        assert_eq!(
            sink.events(),
            vec![
                EngineEvent::StateChanged(ProcessingState::Buffering),
                EngineEvent::AudioChanged(3),
                EngineEvent::StateChanged(ProcessingState::Ready),
            ]
        );
        notifier.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn full_queue_keeps_the_latest_audio_change() {
        let sink = Arc::new(GatedSink::default());
        let held = lock(&sink.gate);
        let (notifier, handle) = Notifier::spawn(sink.clone()).unwrap();
        for index in 0..400 {
            notifier.send_rt(EngineEvent::AudioChanged(index));
        }
        drop(held);

        assert!(wait_until(Duration::from_secs(2), || {
            sink.inner.audio_changes().last() == Some(&399)
        }));
        let changes = sink.inner.audio_changes();
        assert!(changes.len() < 400);
        assert!(changes.windows(2).all(|w| w[0] < w[1]));
        notifier.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn dispatcher_exits_when_notifier_dropped() {
        let (notifier, handle) = Notifier::spawn(Arc::new(NullSink)).unwrap();
        drop(notifier);
        handle.join().unwrap();
    }
}
