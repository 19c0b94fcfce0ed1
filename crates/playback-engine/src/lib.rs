//! Gapless streaming playback engine.
//!
//! Decodes local files and cached HTTP streams with Symphonia, keeps a
//! previous/current/next window of decoders primed and renders the current one into a
//! CPAL output. Embedding layers drive it through [`Transport`] and observe it through
//! an [`EventSink`].

pub mod config;
pub mod device;
pub mod errors;
pub mod events;
pub mod format;
pub mod output;
pub mod source;
pub mod status;
pub mod transport;

mod decode;
mod engine;
mod playback;
mod resample;
mod ring;
mod sync;
mod track_cache;

#[cfg(test)]
mod test_support;

pub use config::{CacheConfig, EngineConfig, OutputConfig};
pub use decode::{DecoderState, FrameRead};
pub use engine::{PlaybackEngine, Renderer};
pub use events::{EngineEvent, EventSink, NullSink};
pub use format::{SampleFormat, StreamFormat};
pub use output::{AudioOutput, CpalOutput};
pub use source::{DefaultSourceProvider, SourceProvider, TrackIdentity};
pub use status::{LoopMode, PlayerStatus, ProcessingState};
pub use transport::Transport;
