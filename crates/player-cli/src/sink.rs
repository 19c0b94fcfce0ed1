use crossbeam_channel::Sender;
use playback_engine::{EventSink, ProcessingState};

/// Logs engine events and tells the main loop when the queue runs out.
pub struct LogSink {
    completed: Sender<()>,
}

impl LogSink {
    pub fn new(completed: Sender<()>) -> Self {
        Self { completed }
    }
}

impl EventSink for LogSink {
    fn on_audio_changed(&self, track_index: i64) {
        tracing::info!(track = track_index, "now playing");
    }

    fn on_state_changed(&self, state: ProcessingState) {
        match state {
            ProcessingState::Error => tracing::warn!(state = %state, "player state"),
            ProcessingState::Completed => {
                tracing::info!(state = %state, "player state");
                let _ = self.completed.try_send(());
            }
            _ => tracing::debug!(state = %state, "player state"),
        }
    }
}
