//! The real-time render path.
//!
//! Called from the output's audio callback. It never blocks: the slot mutex is only
//! `try_lock`ed, decoder reads are non-blocking pops, and notifications go out with
//! `try_send`. Anything unexpected degrades to silence for the cycle.

use std::sync::atomic::Ordering;
use std::sync::{TryLockError, Weak};

use crate::events::EngineEvent;
use crate::format::{StreamFormat, fill_silence};
use crate::status::ProcessingState;

use super::EngineInner;

/// Handle the output's callback renders through.
///
/// Holds the engine weakly so a stream that outlives the engine only plays silence.
#[derive(Clone)]
pub struct Renderer {
    engine: Weak<EngineInner>,
    format: StreamFormat,
}

impl Renderer {
    pub(crate) fn new(engine: Weak<EngineInner>, format: StreamFormat) -> Self {
        Self { engine, format }
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Fill `out` with interleaved frames in [`Renderer::format`].
    pub fn render(&self, out: &mut [u8]) {
        match self.engine.upgrade() {
            Some(engine) => engine.render(out, self.format),
            None => fill_silence(self.format.sample_format, out),
        }
    }
}

impl EngineInner {
    pub(crate) fn render(&self, out: &mut [u8], format: StreamFormat) {
        let silence = |buf: &mut [u8]| fill_silence(format.sample_format, buf);
        if self.paused.load(Ordering::Acquire) {
            silence(out);
            return;
        }
        let mut slots = match self.slots.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => {
                silence(out);
                return;
            }
        };
        if slots.device_format != Some(format) {
            silence(out);
            return;
        }

        let frame_bytes = format.frame_bytes();
        let usable = out.len() - out.len() % frame_bytes;
        let mut filled = 0;
        loop {
            let Some(current) = slots.current.as_ref() else {
                break;
            };
            if current.format() != Some(format) {
                break;
            }
            let read = current.read_frames(&mut out[filled..usable]);
            filled += read.frames * frame_bytes;
            if read.looped {
                self.notifier
                    .send_rt(EngineEvent::AudioChanged(slots.current_index));
            }
            if filled == usable {
                self.set_state_rt(ProcessingState::Ready);
                break;
            }
            if !read.drained {
                if filled == 0 {
                    self.set_state_rt(ProcessingState::Buffering);
                }
                break;
            }

            // The current track is done: hand over to next inside this same callback.
            // A next that failed to open counts as the end of the queue.
            let next_ready = slots
                .next
                .as_ref()
                .filter(|n| !n.is_error())
                .map(|n| (n.is_opened(), n.format()));
            match next_ready {
                None => {
                    self.set_state_rt(ProcessingState::Completed);
                    break;
                }
                Some((false, _)) => {
                    self.set_state_rt(ProcessingState::Buffering);
                    break;
                }
                Some((true, next_format)) if next_format != Some(format) => {
                    self.signals.request_reinit();
                    if filled == 0 {
                        self.set_state_rt(ProcessingState::Buffering);
                    }
                    break;
                }
                Some(_) => {
                    slots.advance();
                    if let Some(current) = slots.current.as_ref() {
                        current.set_max_preload_bytes(self.config.active_preload_bytes);
                    }
                    self.notifier
                        .send_rt(EngineEvent::AudioChanged(slots.current_index));
                    self.signals.request_refresh();
                }
            }
        }
        silence(&mut out[filled..]);
    }

    fn set_state_rt(&self, state: ProcessingState) {
        let old = self.state.swap(state.as_u8(), Ordering::AcqRel);
        if old != state.as_u8() {
            self.notifier.send_rt(EngineEvent::StateChanged(state));
        }
    }
}
