use std::time::Duration;

use serde::Deserialize;

/// Engine tuning shared by the decoder cache, decoders and request worker.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ring buffer length per decoder, in seconds of audio.
    pub ring_seconds: u32,
    /// Demuxed-but-undecoded byte budget for the playing track.
    pub active_preload_bytes: usize,
    /// Same budget for primed neighbours and retained tracks.
    pub neighbor_preload_bytes: usize,
    /// Trailing history entries kept warm.
    pub retain_previous: usize,
    /// Upcoming queue entries kept warm.
    pub retain_next: usize,
    /// Upper bound on decoders that are open or opening at once.
    pub max_open_decoders: usize,
    /// Delay between reconnect attempts after a transient I/O failure.
    pub reconnect_interval_ms: u64,
    /// Longest the decode thread parks before re-checking its ring.
    pub fill_wait_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_seconds: 5,
            active_preload_bytes: 32 * 1024 * 1024,
            neighbor_preload_bytes: 100 * 1024,
            retain_previous: 5,
            retain_next: 8,
            max_open_decoders: 16,
            reconnect_interval_ms: 1000,
            fill_wait_ms: 10,
        }
    }
}

impl EngineConfig {
    pub(crate) fn decoder_settings(&self) -> DecoderSettings {
        DecoderSettings {
            ring_seconds: self.ring_seconds.max(1),
            preload_bytes: self.neighbor_preload_bytes,
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms.max(1)),
            fill_wait: Duration::from_millis(self.fill_wait_ms.max(1)),
        }
    }
}

/// Per-decoder settings derived from [`EngineConfig`].
#[derive(Clone, Debug)]
pub struct DecoderSettings {
    pub ring_seconds: u32,
    /// Initial preload budget; the engine raises it once the track becomes current.
    pub preload_bytes: usize,
    pub reconnect_interval: Duration,
    pub fill_wait: Duration,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        EngineConfig::default().decoder_settings()
    }
}

/// Disk cache and HTTP settings for streamed tracks.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Bytes per cache block; also the unit of network fetches.
    pub block_size: u64,
    /// Most missing blocks fetched by one range request.
    pub max_fetch_blocks: u64,
    /// Total on-disk budget across all track directories.
    pub budget_bytes: u64,
    pub request_timeout_secs: u64,
    /// Retries per range request before reporting a transient error.
    pub retries: u32,
    pub user_agent: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            max_fetch_blocks: 8,
            budget_bytes: 1024 * 1024 * 1024,
            request_timeout_secs: 45,
            retries: 3,
            user_agent: "Melodink-Player".to_string(),
        }
    }
}

/// Output device selection.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Case-insensitive substring of the device name; default device when unset.
    pub device: Option<String>,
    /// Converter input chunk in frames when the device needs resampling.
    pub chunk_frames: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.ring_seconds, 5);
        assert_eq!(cfg.neighbor_preload_bytes, 100 * 1024);
        assert_eq!(cfg.retain_previous, 5);
        assert_eq!(cfg.retain_next, 8);
        let cache = CacheConfig::default();
        assert_eq!(cache.retries, 3);
        assert_eq!(cache.request_timeout_secs, 45);
    }

    #[test]
    fn decoder_settings_never_zero() {
        let cfg = EngineConfig {
            ring_seconds: 0,
            reconnect_interval_ms: 0,
            fill_wait_ms: 0,
            ..EngineConfig::default()
        };
        let settings = cfg.decoder_settings();
        assert_eq!(settings.ring_seconds, 1);
        assert!(settings.reconnect_interval > Duration::ZERO);
        assert!(settings.fill_wait > Duration::ZERO);
    }
}
