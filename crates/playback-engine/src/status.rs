use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::Serialize;

use crate::format::StreamFormat;

/// Coarse playback readiness reported to the embedding layer.
///
/// Discriminants are stable; `1` was a loading state that is now folded into `Idle`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ProcessingState {
    #[default]
    Idle = 0,
    Buffering = 2,
    Ready = 3,
    Completed = 4,
    Error = 5,
}

impl ProcessingState {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => ProcessingState::Buffering,
            3 => ProcessingState::Ready,
            4 => ProcessingState::Completed,
            5 => ProcessingState::Error,
            _ => ProcessingState::Idle,
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessingState::Idle => "idle",
            ProcessingState::Buffering => "buffering",
            ProcessingState::Ready => "ready",
            ProcessingState::Completed => "completed",
            ProcessingState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Queue repeat behaviour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LoopMode {
    #[default]
    None = 0,
    /// Repeat the current track.
    One = 1,
    /// Wrap from the end of the queue back to its start.
    All = 2,
}

impl LoopMode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => LoopMode::One,
            2 => LoopMode::All,
            _ => LoopMode::None,
        }
    }
}

impl FromStr for LoopMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(LoopMode::None),
            "one" | "track" => Ok(LoopMode::One),
            "all" | "queue" => Ok(LoopMode::All),
            other => bail!("unknown loop mode: {other}"),
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopMode::None => "none",
            LoopMode::One => "one",
            LoopMode::All => "all",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the player for status queries.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PlayerStatus {
    pub playing: bool,
    pub track_index: i64,
    pub position_ms: u64,
    pub buffered_position_ms: u64,
    pub duration_ms: Option<u64>,
    pub state: ProcessingState,
    pub loop_mode: LoopMode,
    pub volume: f32,
    /// Format the output device currently runs at.
    pub output_format: Option<StreamFormat>,
}
