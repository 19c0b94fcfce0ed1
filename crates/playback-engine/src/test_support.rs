//! Fixtures shared by the unit tests: in-memory WAV sources, a flaky provider, a
//! recording event sink and an output the test drives by hand.

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use symphonia::core::io::MediaSource;

use crate::decode::TrackDecoder;
use crate::engine::Renderer;
use crate::events::{EngineEvent, EventSink};
use crate::format::StreamFormat;
use crate::output::AudioOutput;
use crate::source::{SourceProvider, TrackIdentity};
use crate::status::ProcessingState;
use crate::sync::lock;

/// 16-bit PCM WAV whose every channel carries the frame index.
pub fn wav_ramp(rate: u32, channels: u16, frames: usize) -> Vec<u8> {
    wav_ramp_from(rate, channels, frames, 0)
}

/// Like [`wav_ramp`], counting up from `start`.
pub fn wav_ramp_from(rate: u32, channels: u16, frames: usize, start: i32) -> Vec<u8> {
    let block_align = channels * 2;
    let data_len = (frames * block_align as usize) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&rate.to_le_bytes());
    out.extend_from_slice(&(rate * u32::from(block_align)).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for frame in 0..frames {
        let value = (start + frame as i32) as i16;
        for _ in 0..channels {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    out
}

pub fn s16_values(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Poll `cond` every couple of milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Pop `frames` frames of an S16 decoder, waiting for the decode thread as needed.
pub fn drain_frames(decoder: &TrackDecoder, frames: usize) -> Vec<i16> {
    let format = decoder.format().expect("decoder opened");
    let frame_bytes = format.frame_bytes();
    let mut out = Vec::new();
    let mut taken = 0;
    let mut buf = vec![0u8; 256 * frame_bytes];
    let deadline = Instant::now() + Duration::from_secs(5);
    while taken < frames && Instant::now() < deadline {
        let want = (frames - taken).min(256);
        let read = decoder.read_frames(&mut buf[..want * frame_bytes]);
        out.extend(s16_values(&buf[..read.frames * frame_bytes]));
        taken += read.frames;
        if read.frames == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
    out
}

/// Tracks served from memory, keyed by their local path.
#[derive(Default)]
pub struct MemoryProvider {
    tracks: HashMap<String, Arc<Vec<u8>>>,
    delay: Duration,
    opens: AtomicUsize,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_track(mut self, name: &str, bytes: Vec<u8>) -> Self {
        self.tracks.insert(name.to_string(), Arc::new(bytes));
        self
    }

    /// Sleep this long in every open, like a slow network.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl SourceProvider for MemoryProvider {
    fn open(&self, identity: &TrackIdentity, _auth_token: &str) -> Result<Box<dyn MediaSource>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let key = identity
            .local_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let bytes = self
            .tracks
            .get(&key)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, key.clone()))?;
        Ok(Box::new(Cursor::new(bytes.as_ref().clone())))
    }
}

/// Serves one track for any identity, failing the first opens with a timeout and
/// optionally cutting the first successful stream with a connection reset.
pub struct FlakyProvider {
    data: Vec<u8>,
    fail_opens: usize,
    reset_after_bytes: Option<usize>,
    opens: AtomicUsize,
    last_token: Mutex<String>,
}

impl FlakyProvider {
    pub fn new(data: Vec<u8>, fail_opens: usize, reset_after_bytes: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            data,
            fail_opens,
            reset_after_bytes,
            opens: AtomicUsize::new(0),
            last_token: Mutex::new(String::new()),
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn last_token(&self) -> String {
        lock(&self.last_token).clone()
    }
}

impl SourceProvider for FlakyProvider {
    fn open(&self, _identity: &TrackIdentity, auth_token: &str) -> Result<Box<dyn MediaSource>> {
        let attempt = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.last_token) = auth_token.to_string();
        if attempt <= self.fail_opens {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "upstream timed out").into());
        }
        let reset_at = self
            .reset_after_bytes
            .filter(|_| attempt == self.fail_opens + 1)
            .map(|b| b as u64);
        Ok(Box::new(ResettingSource {
            inner: Cursor::new(self.data.clone()),
            reset_at,
        }))
    }
}

struct ResettingSource {
    inner: Cursor<Vec<u8>>,
    reset_at: Option<u64>,
}

impl Read for ResettingSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(at) = self.reset_at else {
            return self.inner.read(buf);
        };
        let pos = self.inner.position();
        if pos >= at {
            return Err(io::Error::from(io::ErrorKind::ConnectionReset));
        }
        let room = ((at - pos) as usize).min(buf.len());
        self.inner.read(&mut buf[..room])
    }
}

impl Seek for ResettingSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl MediaSource for ResettingSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        Some(self.inner.get_ref().len() as u64)
    }
}

/// Sink that keeps every event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<EngineEvent> {
        lock(&self.events).clone()
    }

    pub fn audio_changes(&self) -> Vec<i64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::AudioChanged(index) => Some(index),
                EngineEvent::StateChanged(_) => None,
            })
            .collect()
    }

    pub fn states(&self) -> Vec<ProcessingState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::StateChanged(state) => Some(state),
                EngineEvent::AudioChanged(_) => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn on_audio_changed(&self, index: i64) {
        lock(&self.events).push(EngineEvent::AudioChanged(index));
    }

    fn on_state_changed(&self, state: ProcessingState) {
        lock(&self.events).push(EngineEvent::StateChanged(state));
    }
}

#[derive(Default)]
struct ManualState {
    renderer: Option<Renderer>,
    starts: Vec<StreamFormat>,
    stops: usize,
    paused: bool,
    volume: f32,
}

/// Output without a device: the test pulls rendered buffers itself.
#[derive(Clone, Default)]
pub struct ManualOutput {
    state: Arc<Mutex<ManualState>>,
}

impl ManualOutput {
    /// Format of the running stream.
    pub fn format(&self) -> Option<StreamFormat> {
        lock(&self.state).renderer.as_ref().map(Renderer::format)
    }

    pub fn starts(&self) -> Vec<StreamFormat> {
        lock(&self.state).starts.clone()
    }

    pub fn stops(&self) -> usize {
        lock(&self.state).stops
    }

    pub fn paused(&self) -> bool {
        lock(&self.state).paused
    }

    pub fn volume(&self) -> f32 {
        lock(&self.state).volume
    }

    /// Run one callback cycle of `frames` frames.
    pub fn pull(&self, frames: usize) -> Option<Vec<u8>> {
        let renderer = lock(&self.state).renderer.clone()?;
        let mut out = vec![0u8; frames * renderer.format().frame_bytes()];
        renderer.render(&mut out);
        Some(out)
    }
}

impl AudioOutput for ManualOutput {
    fn start(&mut self, format: StreamFormat, renderer: Renderer) -> Result<()> {
        let mut state = lock(&self.state);
        state.starts.push(format);
        state.renderer = Some(renderer);
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = lock(&self.state);
        if state.renderer.take().is_some() {
            state.stops += 1;
        }
    }

    fn set_paused(&mut self, paused: bool) {
        lock(&self.state).paused = paused;
    }

    fn set_volume(&mut self, volume: f32) {
        lock(&self.state).volume = volume;
    }

    fn is_running(&self) -> bool {
        lock(&self.state).renderer.is_some()
    }
}
