//! Seekable HTTP source backed by a persistent per-track block cache.
//!
//! Each track gets a directory holding two files:
//! - `cache_index.bin`: total length (i64, little endian) followed by one bit per block
//! - `cache_data.bin`: the fetched bytes at their stream offsets (sparse)
//!
//! Reads are served from disk when the block is present; otherwise a run of missing
//! blocks is fetched with a single `Range` request and persisted before returning.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use symphonia::core::io::MediaSource;

use crate::config::CacheConfig;
use crate::errors::is_transient_kind;
use crate::sync::lock;

const INDEX_FILE: &str = "cache_index.bin";
const DATA_FILE: &str = "cache_data.bin";

/// Per-source HTTP and block settings.
#[derive(Clone, Debug)]
pub struct CacheOptions {
    pub block_size: u64,
    pub max_fetch_blocks: u64,
    pub timeout: Duration,
    pub retries: u32,
    pub user_agent: String,
    /// Sent as the `Cookie` header when non-empty.
    pub auth_token: String,
}

impl CacheOptions {
    pub fn from_config(cfg: &CacheConfig, auth_token: &str) -> Self {
        Self {
            block_size: cfg.block_size.max(1),
            max_fetch_blocks: cfg.max_fetch_blocks.max(1),
            timeout: Duration::from_secs(cfg.request_timeout_secs.max(1)),
            retries: cfg.retries,
            user_agent: cfg.user_agent.clone(),
            auth_token: auth_token.to_string(),
        }
    }
}

/// Track cache directories currently held open by a live source.
#[derive(Default)]
pub struct OpenDirs {
    dirs: Mutex<HashMap<PathBuf, usize>>,
}

/// Keeps a directory marked open until dropped.
pub struct OpenDirGuard {
    dirs: Arc<OpenDirs>,
    dir: PathBuf,
}

impl OpenDirs {
    pub fn mark(self: &Arc<Self>, dir: &Path) -> OpenDirGuard {
        *lock(&self.dirs).entry(dir.to_path_buf()).or_insert(0) += 1;
        OpenDirGuard {
            dirs: self.clone(),
            dir: dir.to_path_buf(),
        }
    }

    pub fn is_open(&self, dir: &Path) -> bool {
        lock(&self.dirs).contains_key(dir)
    }
}

impl Drop for OpenDirGuard {
    fn drop(&mut self) {
        let mut dirs = lock(&self.dirs.dirs);
        if let Some(count) = dirs.get_mut(&self.dir) {
            *count -= 1;
            if *count == 0 {
                dirs.remove(&self.dir);
            }
        }
    }
}

/// Remove least-recently-touched track directories under `root` until the total
/// size fits in `budget`. Open directories and `keep` are never removed.
///
/// Returns the number of bytes freed.
pub fn enforce_budget(
    root: &Path,
    budget: u64,
    open_dirs: &OpenDirs,
    keep: Option<&str>,
) -> Result<u64> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("read cache root {:?}", root)),
    };

    let mut dirs = Vec::new();
    let mut total = 0u64;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let size = dir_size(&path);
        total += size;
        let touched = fs::metadata(path.join(INDEX_FILE))
            .or_else(|_| entry.metadata())
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        dirs.push((touched, size, path));
    }
    if total <= budget {
        return Ok(0);
    }

    dirs.sort_by_key(|(touched, _, _)| *touched);
    let keep = keep.map(sanitize_key);
    let mut freed = 0u64;
    for (_, size, path) in dirs {
        if total <= budget {
            break;
        }
        let name = path.file_name().and_then(|n| n.to_str());
        if open_dirs.is_open(&path) || (keep.is_some() && name == keep.as_deref()) {
            continue;
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                tracing::debug!(dir = ?path, bytes = size, "evicted track cache");
                total -= size;
                freed += size;
            }
            Err(e) => tracing::warn!(dir = ?path, error = %e, "failed to evict track cache"),
        }
    }
    Ok(freed)
}

fn dir_size(dir: &Path) -> u64 {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}

/// Make `key` safe to use as a single directory name.
pub(crate) fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Seekable byte stream over a remote track, persisted block by block.
pub struct BlockCacheSource {
    url: String,
    agent: ureq::Agent,
    options: CacheOptions,
    index_path: PathBuf,
    data: File,
    total: u64,
    bitmap: Vec<u8>,
    pos: u64,
    _open: OpenDirGuard,
}

impl BlockCacheSource {
    /// Open (or create) the cache for `key` under `dir` and learn the stream length.
    ///
    /// A fresh cache costs one range request for the first block.
    pub fn init(
        dir: &Path,
        key: &str,
        url: &str,
        options: CacheOptions,
        open_dirs: &Arc<OpenDirs>,
    ) -> Result<Self> {
        let track_dir = dir.join(sanitize_key(key));
        fs::create_dir_all(&track_dir)
            .with_context(|| format!("create cache dir {:?}", track_dir))?;
        let guard = open_dirs.mark(&track_dir);

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(track_dir.join(DATA_FILE))
            .with_context(|| format!("open cache data in {:?}", track_dir))?;

        let config = ureq::Agent::config_builder()
            .user_agent(options.user_agent.as_str())
            .timeout_global(Some(options.timeout))
            .http_status_as_error(false)
            .build();

        let mut source = Self {
            url: url.to_string(),
            agent: ureq::Agent::new_with_config(config),
            options,
            index_path: track_dir.join(INDEX_FILE),
            data,
            total: 0,
            bitmap: Vec::new(),
            pos: 0,
            _open: guard,
        };

        if !source.load_index() {
            source.bootstrap().with_context(|| format!("fetch {}", source.url))?;
        }
        tracing::debug!(
            url = %source.url,
            total = source.total,
            cached_blocks = source.cached_blocks(),
            "cache source ready"
        );
        Ok(source)
    }

    fn block_count(&self) -> u64 {
        self.total.div_ceil(self.options.block_size)
    }

    fn has_block(&self, block: u64) -> bool {
        let byte = (block / 8) as usize;
        self.bitmap
            .get(byte)
            .is_some_and(|b| b & (1 << (block % 8)) != 0)
    }

    fn set_block(&mut self, block: u64) {
        let byte = (block / 8) as usize;
        if let Some(b) = self.bitmap.get_mut(byte) {
            *b |= 1 << (block % 8);
        }
    }

    fn cached_blocks(&self) -> u32 {
        self.bitmap.iter().map(|b| b.count_ones()).sum()
    }

    /// Load a valid index. Returns `false` when the cache must be rebuilt.
    fn load_index(&mut self) -> bool {
        let Ok(bytes) = fs::read(&self.index_path) else {
            return false;
        };
        let Some((head, bitmap)) = bytes.split_first_chunk::<8>() else {
            return false;
        };
        let total = i64::from_le_bytes(*head);
        if total <= 0 {
            return false;
        }
        self.total = total as u64;
        let expected = self.block_count().div_ceil(8) as usize;
        if bitmap.len() != expected {
            tracing::warn!(path = ?self.index_path, "cache index does not match block size, resetting");
            self.total = 0;
            return false;
        }
        self.bitmap = bitmap.to_vec();
        true
    }

    fn save_index(&self) -> io::Result<()> {
        let mut bytes = Vec::with_capacity(8 + self.bitmap.len());
        bytes.extend_from_slice(&(self.total as i64).to_le_bytes());
        bytes.extend_from_slice(&self.bitmap);
        fs::write(&self.index_path, bytes)
    }

    /// Learn the total length from a first-block request and keep what it returned.
    fn bootstrap(&mut self) -> io::Result<()> {
        self.data.set_len(0)?;
        let (bytes, total) = self.fetch_with_retries(0, self.options.block_size - 1)?;
        let total = total.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "server did not report content length")
        })?;
        self.total = total;
        self.bitmap = vec![0u8; self.block_count().div_ceil(8) as usize];
        self.store(0, 0, &bytes)?;
        Ok(())
    }

    /// Fetch the run of missing blocks starting at `first`.
    fn fetch_run(&mut self, first: u64) -> io::Result<()> {
        let last_allowed = (first + self.options.max_fetch_blocks - 1).min(self.block_count() - 1);
        let mut last = first;
        while last < last_allowed && !self.has_block(last + 1) {
            last += 1;
        }
        let start = first * self.options.block_size;
        let end = ((last + 1) * self.options.block_size).min(self.total) - 1;

        let started = Instant::now();
        let (bytes, _) = self.fetch_with_retries(start, end)?;
        tracing::debug!(
            start,
            end,
            bytes = bytes.len(),
            took_ms = started.elapsed().as_millis() as u64,
            "fetched cache blocks"
        );
        let stored = self.store(first, start, &bytes)?;
        if stored == 0 {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "range response ended before the first missing block",
            ));
        }
        Ok(())
    }

    /// Write `bytes` at `offset` and mark every block they complete. Returns blocks marked.
    fn store(&mut self, first: u64, offset: u64, bytes: &[u8]) -> io::Result<u64> {
        self.data.seek(SeekFrom::Start(offset))?;
        self.data.write_all(bytes)?;
        self.data.flush()?;

        let covered_end = offset + bytes.len() as u64;
        let mut block = first;
        let mut marked = 0;
        while block < self.block_count() {
            let block_end = ((block + 1) * self.options.block_size).min(self.total);
            if block_end > covered_end {
                break;
            }
            self.set_block(block);
            marked += 1;
            block += 1;
        }
        if marked > 0 {
            self.save_index()?;
        }
        Ok(marked)
    }

    fn fetch_with_retries(&self, start: u64, end: u64) -> io::Result<(Vec<u8>, Option<u64>)> {
        let mut attempt = 0;
        loop {
            match self.fetch_range(start, end) {
                Ok(found) => return Ok(found),
                Err(e) if attempt < self.options.retries && is_transient_kind(e.kind()) => {
                    attempt += 1;
                    tracing::warn!(
                        url = %self.url,
                        attempt,
                        error = %e,
                        "range request failed, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn fetch_range(&self, start: u64, end: u64) -> io::Result<(Vec<u8>, Option<u64>)> {
        let range = format!("bytes={start}-{end}");
        let mut request = self.agent.get(&self.url).header("Range", &range);
        if !self.options.auth_token.is_empty() {
            request = request.header("Cookie", &self.options.auth_token);
        }
        let resp = request.call().map_err(http_error)?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                format!("server error {status}"),
            ));
        }
        if status == ureq::http::StatusCode::UNAUTHORIZED
            || status == ureq::http::StatusCode::FORBIDDEN
        {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("request rejected with {status}"),
            ));
        }
        if !status.is_success() {
            return Err(io::Error::other(format!("unexpected status {status}")));
        }

        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_range = header("Content-Range");
        let content_length = header("Content-Length").and_then(|s| s.parse::<u64>().ok());
        let partial = status == ureq::http::StatusCode::PARTIAL_CONTENT;

        let mut body = Vec::new();
        let (_, payload) = resp.into_parts();
        payload.into_reader().read_to_end(&mut body)?;

        let total = if partial {
            content_range.as_deref().and_then(parse_content_range_total)
        } else {
            content_length.or(Some(body.len() as u64))
        };
        if !partial && start > 0 {
            // Range ignored: the body starts at zero.
            let skip = (start as usize).min(body.len());
            body.drain(..skip);
        }
        body.truncate((end - start + 1) as usize);
        Ok((body, total))
    }
}

/// Map transport failures onto I/O kinds the decoder knows how to classify.
fn http_error(err: ureq::Error) -> io::Error {
    match err {
        ureq::Error::Io(e) => e,
        ureq::Error::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, err.to_string()),
        ureq::Error::ConnectionFailed => {
            io::Error::new(io::ErrorKind::ConnectionRefused, err.to_string())
        }
        ureq::Error::HostNotFound => io::Error::new(io::ErrorKind::NotConnected, err.to_string()),
        other => io::Error::other(format!("http request failed: {other}")),
    }
}

impl Read for BlockCacheSource {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() || self.pos >= self.total {
            return Ok(0);
        }
        let block = self.pos / self.options.block_size;
        if !self.has_block(block) {
            self.fetch_run(block)?;
        }
        let block_end = ((block + 1) * self.options.block_size).min(self.total);
        let n = (block_end - self.pos).min(out.len() as u64) as usize;

        self.data.seek(SeekFrom::Start(self.pos))?;
        self.data.read_exact(&mut out[..n]).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(io::ErrorKind::InvalidData, "cache data shorter than its index")
            } else {
                e
            }
        })?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for BlockCacheSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(x) => Some(x),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => self.total.checked_add_signed(d),
        };
        self.pos = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of stream")
        })?;
        Ok(self.pos)
    }
}

impl MediaSource for BlockCacheSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        Some(self.total)
    }
}

/// Extract the total length from a `Content-Range` header (`bytes a-b/total`).
fn parse_content_range_total(header: &str) -> Option<u64> {
    let (_, total) = header.split_once('/')?;
    total.trim().parse::<u64>().ok()
}
