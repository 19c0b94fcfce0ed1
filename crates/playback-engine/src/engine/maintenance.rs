//! Non-realtime follow-up for things the audio callback may only flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::events::EngineEvent;
use crate::format::StreamFormat;
use crate::output::AudioOutput;
use crate::status::ProcessingState;
use crate::sync::lock;

use super::EngineInner;
use super::render::Renderer;

/// Flags raised by the audio callback, plus a coalescing wakeup.
pub(crate) struct RtSignals {
    reinit: AtomicBool,
    refresh: AtomicBool,
    wake: Sender<()>,
}

impl RtSignals {
    pub fn new() -> (Self, Receiver<()>) {
        let (wake, rx) = bounded(1);
        let signals = Self {
            reinit: AtomicBool::new(false),
            refresh: AtomicBool::new(false),
            wake,
        };
        (signals, rx)
    }

    /// The next track needs a device restart before it can play.
    pub fn request_reinit(&self) {
        if !self.reinit.swap(true, Ordering::AcqRel) {
            let _ = self.wake.try_send(());
        }
    }

    /// The window moved; the worker should re-prime neighbours.
    pub fn request_refresh(&self) {
        self.refresh.store(true, Ordering::Release);
        let _ = self.wake.try_send(());
    }

    pub fn wake(&self) {
        let _ = self.wake.try_send(());
    }

    fn take_reinit(&self) -> bool {
        self.reinit.swap(false, Ordering::AcqRel)
    }

    fn take_refresh(&self) -> bool {
        self.refresh.swap(false, Ordering::AcqRel)
    }
}

impl EngineInner {
    pub(crate) fn maintenance_loop(self: Arc<Self>, wake: Receiver<()>) {
        loop {
            match wake.recv_timeout(Duration::from_millis(100)) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => self.settle_paused_state(),
                Err(RecvTimeoutError::Disconnected) => return,
            }
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            if self.signals.take_reinit() {
                self.reinit_to_next();
            }
            if self.signals.take_refresh() {
                self.requests.request_refresh();
            }
        }
    }

    /// While paused the callback does not run, so report readiness from here.
    fn settle_paused_state(&self) {
        if !self.paused.load(Ordering::Acquire) || self.state() != ProcessingState::Buffering {
            return;
        }
        let ready = {
            let slots = lock(&self.slots);
            slots.pending.is_none()
                && slots.device_format.is_some()
                && slots
                    .current
                    .as_ref()
                    .is_some_and(|c| c.buffered_frames() > 0)
        };
        if ready {
            self.set_state(ProcessingState::Ready);
        }
    }

    /// Restart the device in the next track's format and make it current.
    fn reinit_to_next(self: &Arc<Self>) {
        let mut output = lock(&self.output);
        let mut slots = lock(&self.slots);

        let drained = slots
            .current
            .as_ref()
            .is_none_or(|c| c.finished_reading() && c.buffered_frames() == 0);
        if !drained {
            return;
        }
        if slots.next.as_ref().is_some_and(|n| n.is_error()) {
            drop(slots);
            drop(output);
            self.set_state(ProcessingState::Completed);
            return;
        }
        let Some(format) = slots
            .next
            .as_ref()
            .filter(|n| n.is_opened())
            .and_then(|n| n.format())
        else {
            return;
        };

        output.stop();
        slots.advance();
        if let Some(current) = slots.current.as_ref() {
            current.set_max_preload_bytes(self.config.active_preload_bytes);
        }
        slots.device_format = Some(format);
        let index = slots.current_index;
        drop(slots);

        tracing::info!(index, format = %format, "advancing with output restart");
        self.notifier.send(EngineEvent::AudioChanged(index));
        self.start_output(&mut **output, format);
        drop(output);
        self.requests.request_refresh();
    }

    /// Start `output` in `format` and restore pause and volume on it.
    pub(crate) fn start_output(self: &Arc<Self>, output: &mut dyn AudioOutput, format: StreamFormat) {
        let renderer = Renderer::new(Arc::downgrade(self), format);
        match output.start(format, renderer) {
            Ok(()) => {
                output.set_volume(self.volume());
                output.set_paused(self.paused.load(Ordering::Acquire));
                self.set_state(ProcessingState::Buffering);
            }
            Err(e) => {
                tracing::error!(format = %format, error = %e, "output start failed");
                lock(&self.slots).device_format = None;
                self.set_state(ProcessingState::Error);
            }
        }
    }
}
