//! Public transport API for embedding layers.
//!
//! Every call is safe from any thread; callers never manage locks.

use std::sync::Arc;

use anyhow::Result;

use crate::config::{CacheConfig, EngineConfig, OutputConfig};
use crate::engine::PlaybackEngine;
use crate::events::EventSink;
use crate::output::{AudioOutput, CpalOutput};
use crate::source::{DefaultSourceProvider, SourceProvider, TrackIdentity};
use crate::status::{LoopMode, PlayerStatus, ProcessingState};

pub struct Transport {
    engine: PlaybackEngine,
}

impl Transport {
    /// Engine on the configured CPAL device with the block-cache source provider.
    pub fn new(
        engine: EngineConfig,
        cache: CacheConfig,
        output: OutputConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let provider = Arc::new(DefaultSourceProvider::new(cache));
        let output = CpalOutput::new(output)?;
        Self::with_parts(engine, provider, Box::new(output), sink)
    }

    /// Engine over caller-supplied sources and output.
    pub fn with_parts(
        engine: EngineConfig,
        provider: Arc<dyn SourceProvider>,
        output: Box<dyn AudioOutput>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        Ok(Self {
            engine: PlaybackEngine::new(engine, provider, output, sink)?,
        })
    }

    pub fn play(&self) {
        self.engine.play();
    }

    pub fn pause(&self) {
        self.engine.pause();
    }

    pub fn seek(&self, position_ms: u64) -> Result<()> {
        self.engine.seek(position_ms)
    }

    pub fn next(&self) {
        self.engine.next();
    }

    pub fn prev(&self) -> Result<()> {
        self.engine.prev()
    }

    pub fn set_audios(&self, previous: Vec<TrackIdentity>, next: Vec<TrackIdentity>) {
        self.engine.set_audios(previous, next);
    }

    pub fn set_loop_mode(&self, mode: LoopMode) {
        self.engine.set_loop_mode(mode);
    }

    pub fn set_auth_token(&self, token: impl Into<String>) {
        self.engine.set_auth_token(token);
    }

    pub fn set_volume(&self, volume: f32) {
        self.engine.set_volume(volume);
    }

    pub fn get_current_playing(&self) -> bool {
        self.engine.is_playing()
    }

    pub fn get_current_track_pos(&self) -> i64 {
        self.engine.current_track_index()
    }

    pub fn get_current_position(&self) -> u64 {
        self.engine.position_ms()
    }

    pub fn get_current_buffered_position(&self) -> u64 {
        self.engine.buffered_position_ms()
    }

    pub fn get_current_player_state(&self) -> ProcessingState {
        self.engine.state()
    }

    pub fn get_current_loop_mode(&self) -> LoopMode {
        self.engine.loop_mode()
    }

    pub fn get_volume(&self) -> f32 {
        self.engine.volume()
    }

    pub fn status(&self) -> PlayerStatus {
        self.engine.status()
    }

    pub fn shutdown(&self) {
        self.engine.shutdown();
    }
}
