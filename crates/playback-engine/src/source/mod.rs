//! Track identities and the byte sources decoders read from.
//!
//! A track is either a local file or a server stream. Streams go through a
//! [`BlockCacheSource`], which keeps fetched byte ranges on disk so replays and
//! seeks do not hit the network twice.

mod block_cache;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use symphonia::core::io::MediaSource;
use symphonia::core::probe::Hint;

use crate::config::CacheConfig;

pub use block_cache::{BlockCacheSource, CacheOptions, OpenDirGuard, OpenDirs, enforce_budget};

/// Everything needed to locate one playable rendition of a track.
///
/// Two identities compare equal only when every field matches; the decoder
/// cache shares one decoder per distinct identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TrackIdentity {
    /// Base URL of the music server, with a trailing slash.
    pub server_url: String,
    /// Root directory for per-track block caches.
    pub cache_path: PathBuf,
    pub track_id: i64,
    pub quality: String,
    /// Content hash of the rendition; a new upload gets a fresh cache entry.
    pub audio_hash: String,
    /// Downloaded copy, preferred over the network when present.
    pub local_path: Option<PathBuf>,
}

impl TrackIdentity {
    /// Identity for a plain local file.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            server_url: String::new(),
            cache_path: PathBuf::new(),
            track_id: 0,
            quality: String::new(),
            audio_hash: String::new(),
            local_path: Some(path.into()),
        }
    }

    /// Identity for a streamed server track.
    pub fn remote(
        server_url: impl Into<String>,
        cache_path: impl Into<PathBuf>,
        track_id: i64,
        quality: impl Into<String>,
        audio_hash: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            cache_path: cache_path.into(),
            track_id,
            quality: quality.into(),
            audio_hash: audio_hash.into(),
            local_path: None,
        }
    }

    /// Directory name of this track's block cache.
    pub fn cache_key(&self) -> String {
        format!("{}-{}-{}", self.track_id, self.quality, self.audio_hash)
    }

    pub fn stream_url(&self) -> String {
        format!("{}track/{}/audio", self.server_url, self.track_id)
    }

    /// Probe hint from the local file extension, if any.
    pub fn hint(&self) -> Hint {
        let mut hint = Hint::new();
        if let Some(ext) = self
            .local_path
            .as_deref()
            .and_then(Path::extension)
            .and_then(|e| e.to_str())
        {
            hint.with_extension(ext);
        }
        hint
    }

    fn usable_local_path(&self) -> Option<&Path> {
        self.local_path.as_deref().filter(|p| p.is_file())
    }
}

/// Opens the byte stream behind a [`TrackIdentity`].
pub trait SourceProvider: Send + Sync {
    fn open(&self, identity: &TrackIdentity, auth_token: &str) -> Result<Box<dyn MediaSource>>;
}

/// Local files first, otherwise the on-disk block cache in front of the server.
pub struct DefaultSourceProvider {
    cache: CacheConfig,
    open_dirs: Arc<OpenDirs>,
}

impl DefaultSourceProvider {
    pub fn new(cache: CacheConfig) -> Self {
        Self {
            cache,
            open_dirs: Arc::new(OpenDirs::default()),
        }
    }
}

impl SourceProvider for DefaultSourceProvider {
    fn open(&self, identity: &TrackIdentity, auth_token: &str) -> Result<Box<dyn MediaSource>> {
        if let Some(path) = identity.usable_local_path() {
            let file = File::open(path).with_context(|| format!("open {:?}", path))?;
            return Ok(Box::new(file));
        }
        if identity.server_url.is_empty() {
            bail!(
                "track {} has neither a local file nor a server url",
                identity.track_id
            );
        }

        let key = identity.cache_key();
        if let Err(e) = enforce_budget(
            &identity.cache_path,
            self.cache.budget_bytes,
            &self.open_dirs,
            Some(&key),
        ) {
            tracing::warn!(error = %e, "cache budget enforcement failed");
        }

        let options = CacheOptions::from_config(&self.cache, auth_token);
        let source = BlockCacheSource::init(
            &identity.cache_path,
            &key,
            &identity.stream_url(),
            options,
            &self.open_dirs,
        )?;
        Ok(Box::new(source))
    }
}
