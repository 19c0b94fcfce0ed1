//! Per-track streaming decoder.
//!
//! A [`TrackDecoder`] owns one media source and its Symphonia demux/decode pipeline.
//! Once opened, a background thread keeps the decoder's [`SampleRingBuffer`] filled with
//! packed frames in the decoder's [`StreamFormat`]; the audio callback pulls them with
//! [`TrackDecoder::read_frames`].
//!
//! Lifecycle: `Closed -> Opening -> {Opened, Error}`, `Opened -> Retrying -> {Opened, Error}`
//! after a transient I/O failure, and `Closed` again (for good) after [`TrackDecoder::close`].
//!
//! Threads (all joined by `close`):
//! - decode thread: refills the ring, read-ahead bounded by the preload budget
//! - loop restart helper: rewinds to zero after end-of-stream while looping
//! - reconnect helper: reopens the source once per interval after a transient failure

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use symphonia::core::audio::{AudioBufferRef, RawSampleBuffer, SignalSpec};
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::{Error as SymphoniaError, SeekErrorKind};
use symphonia::core::formats::{FormatOptions, FormatReader, Packet, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::units::{Time, TimeBase};

use crate::config::DecoderSettings;
use crate::errors::{StreamEnd, is_transient};
use crate::format::{SampleFormat, StreamFormat};
use crate::ring::SampleRingBuffer;
use crate::source::{SourceProvider, TrackIdentity};
use crate::sync::{OpenGate, OpenPermit, Signal, lock};

/// Coarse decoder lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderState {
    Closed,
    Opening,
    Opened,
    /// Pipeline torn down after a transient failure; a reconnect loop is running.
    Retrying,
    Error,
}

/// Result of one [`TrackDecoder::read_frames`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameRead {
    pub frames: usize,
    /// The read crossed the loop point; playback restarted at the top of the track.
    pub looped: bool,
    /// Nothing more will arrive without a seek or loop restart.
    pub drained: bool,
}

/// Streaming decoder for one track identity.
///
/// Dropping the last handle closes the decoder and joins its threads.
pub struct TrackDecoder {
    inner: Arc<DecoderInner>,
    refs: AtomicUsize,
}

struct DecoderInner {
    identity: TrackIdentity,
    provider: Arc<dyn SourceProvider>,
    gate: Arc<OpenGate>,
    settings: DecoderSettings,
    ring: SampleRingBuffer,

    state: Mutex<DecoderState>,
    /// Notified on every state change.
    settled: Condvar,
    closing: AtomicBool,
    stop: Signal,
    open_lock: Mutex<()>,
    open_claimed: AtomicBool,
    auth_token: Mutex<String>,
    permit: Mutex<Option<OpenPermit>>,
    pipeline: Mutex<Option<Pipeline>>,
    threads: Mutex<Vec<JoinHandle<()>>>,

    /// Packed [`StreamFormat`]; 0 until opened.
    format: AtomicU64,
    duration_frames: AtomicU64,
    preload_bytes: AtomicUsize,

    /// Held by the consumer while popping and by seek while moving the cursor.
    consumer: Mutex<()>,
    /// Track frame the next popped frame belongs to.
    position: AtomicU64,
    /// Track frame just past the last frame pushed into the ring.
    write_pos: AtomicU64,
    /// Loop point (track length in frames) while a wraparound is pending, else 0.
    loop_end: AtomicU64,
    looping: AtomicBool,
    restarting: AtomicBool,
    finished: AtomicBool,
}

impl TrackDecoder {
    pub fn new(
        identity: TrackIdentity,
        provider: Arc<dyn SourceProvider>,
        gate: Arc<OpenGate>,
        settings: DecoderSettings,
    ) -> Self {
        let preload = settings.preload_bytes;
        Self {
            inner: Arc::new(DecoderInner {
                identity,
                provider,
                gate,
                settings,
                ring: SampleRingBuffer::new(),
                state: Mutex::new(DecoderState::Closed),
                settled: Condvar::new(),
                closing: AtomicBool::new(false),
                stop: Signal::default(),
                open_lock: Mutex::new(()),
                open_claimed: AtomicBool::new(false),
                auth_token: Mutex::new(String::new()),
                permit: Mutex::new(None),
                pipeline: Mutex::new(None),
                threads: Mutex::new(Vec::new()),
                format: AtomicU64::new(0),
                duration_frames: AtomicU64::new(0),
                preload_bytes: AtomicUsize::new(preload),
                consumer: Mutex::new(()),
                position: AtomicU64::new(0),
                write_pos: AtomicU64::new(0),
                loop_end: AtomicU64::new(0),
                looping: AtomicBool::new(false),
                restarting: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            }),
            refs: AtomicUsize::new(0),
        }
    }

    pub fn identity(&self) -> &TrackIdentity {
        &self.inner.identity
    }

    pub fn state(&self) -> DecoderState {
        *lock(&self.inner.state)
    }

    /// Opened, or retrying after a transient failure (still usable).
    pub fn is_opened(&self) -> bool {
        matches!(self.state(), DecoderState::Opened | DecoderState::Retrying)
    }

    pub fn is_error(&self) -> bool {
        self.state() == DecoderState::Error
    }

    pub fn finished_reading(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    pub fn format(&self) -> Option<StreamFormat> {
        StreamFormat::unpack(self.inner.format.load(Ordering::Acquire))
    }

    /// Playback position within the track.
    pub fn playback_time_ms(&self) -> u64 {
        self.inner
            .frames_to_ms(self.inner.position.load(Ordering::Acquire))
    }

    /// Position plus everything decoded and not yet played.
    pub fn buffered_time_ms(&self) -> u64 {
        let frames = self.inner.position.load(Ordering::Acquire) + self.inner.ring.len() as u64;
        self.inner.frames_to_ms(frames)
    }

    /// Container-reported length, when known.
    pub fn duration_ms(&self) -> Option<u64> {
        match self.inner.duration_frames.load(Ordering::Acquire) {
            0 => None,
            frames => Some(self.inner.frames_to_ms(frames)),
        }
    }

    pub fn buffered_frames(&self) -> usize {
        self.inner.ring.len()
    }

    /// Cap on demuxed-but-undecoded bytes the decode thread may hold.
    pub fn set_max_preload_bytes(&self, bytes: usize) {
        self.inner.preload_bytes.store(bytes, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn is_looping(&self) -> bool {
        self.inner.looping.load(Ordering::Acquire)
    }

    /// Repeat this track forever. Enabling it after end-of-stream restarts from zero.
    pub fn set_looping(&self, looping: bool) {
        let was = self.inner.looping.swap(looping, Ordering::AcqRel);
        if looping && !was && self.inner.finished.load(Ordering::Acquire) {
            self.inner.mark_loop_point();
            self.inner.spawn_restart();
        }
    }

    /// Block until an open attempt by someone else has settled, or `timeout` passes.
    pub fn wait_open_settled(&self, timeout: Duration) -> DecoderState {
        let inner = &self.inner;
        let state = lock(&inner.state);
        let (state, _) = inner
            .settled
            .wait_timeout_while(state, timeout, |s| {
                matches!(s, DecoderState::Closed | DecoderState::Opening)
                    && !inner.closing.load(Ordering::Acquire)
            })
            .unwrap_or_else(PoisonError::into_inner);
        *state
    }

    /// Reserve the right to open this decoder. Only one caller wins until the attempt ends.
    pub fn claim_open(&self) -> bool {
        self.state() == DecoderState::Closed
            && !self.inner.closing.load(Ordering::Acquire)
            && self
                .inner
                .open_claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Open the source, build the pipeline and start the decode thread.
    ///
    /// Transient source failures are retried once per reconnect interval until the
    /// decoder is closed. Returns immediately if already opened.
    pub fn open(&self, auth_token: &str) -> Result<()> {
        let result = self.inner.open(auth_token);
        self.inner.open_claimed.store(false, Ordering::Release);
        result
    }

    /// Pop up to `out.len() / frame_bytes` frames. Never blocks.
    ///
    /// Zero frames with `drained == false` means the decoder is still buffering.
    pub fn read_frames(&self, out: &mut [u8]) -> FrameRead {
        let inner = &self.inner;
        let _guard = match inner.consumer.try_lock() {
            Ok(g) => g,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return FrameRead::default(),
        };
        let Some(format) = self.format() else {
            return FrameRead::default();
        };
        let wanted = out.len() / format.frame_bytes();
        let finished = inner.finished.load(Ordering::Acquire);
        let frames = inner.ring.pop(out);

        let mut position = inner.position.load(Ordering::Acquire) + frames as u64;
        let loop_end = inner.loop_end.load(Ordering::Acquire);
        let looped = frames > 0 && loop_end != 0 && position >= loop_end;
        if looped {
            position -= loop_end;
            inner.loop_end.store(0, Ordering::Release);
        }
        inner.position.store(position, Ordering::Release);

        FrameRead {
            frames,
            looped,
            drained: finished && frames < wanted,
        }
    }

    /// Move playback to `position_ms`.
    ///
    /// Targets inside the buffered horizon are reached by draining the ring. Anything
    /// else stops decoding, seeks the container to the preceding keyframe and decodes
    /// forward, discarding frames before the target.
    pub fn seek(&self, position_ms: u64) -> Result<()> {
        let inner = &self.inner;
        let format = self
            .format()
            .filter(|_| self.is_opened())
            .ok_or_else(|| anyhow!("seek on a decoder that was never opened"))?;
        let target = position_ms * u64::from(format.sample_rate) / 1000;

        {
            let _guard = lock(&inner.consumer);
            let position = inner.position.load(Ordering::Acquire);
            let buffered = inner.ring.len() as u64;
            if target >= position && target - position < buffered {
                inner.ring.drain((target - position) as usize);
                inner.position.store(target, Ordering::Release);
                return Ok(());
            }
        }

        let mut pipeline = lock(&inner.pipeline);
        {
            let _guard = lock(&inner.consumer);
            inner.ring.clear();
            inner.position.store(target, Ordering::Release);
            inner.write_pos.store(target, Ordering::Release);
            inner.loop_end.store(0, Ordering::Release);
            inner.finished.store(false, Ordering::Release);
        }

        // Retrying: the reconnect loop resumes at the new write position.
        let Some(p) = pipeline.as_mut() else {
            return Ok(());
        };
        match p.seek_to_frame(target) {
            Ok(()) => {}
            Err(SymphoniaError::SeekError(SeekErrorKind::OutOfRange)) => {
                p.eos = true;
                return Ok(());
            }
            Err(e) => return Err(e).context("container seek"),
        }

        while inner.ring.is_empty() {
            match inner.step(p, usize::MAX) {
                Step::Pushed | Step::Prefetched => {}
                Step::Full | Step::EndOfStream => break,
                Step::Failed(end) => {
                    tracing::warn!(track = %inner.label(), error = ?end, "decode after seek failed");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Stop every thread, release the pipeline and free the ring. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    pub(crate) fn retain(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }
}

impl Drop for TrackDecoder {
    fn drop(&mut self) {
        self.inner.close();
    }
}

enum Step {
    Pushed,
    Prefetched,
    Full,
    EndOfStream,
    Failed(StreamEnd),
}

impl DecoderInner {
    fn label(&self) -> String {
        match &self.identity.local_path {
            Some(path) if self.identity.server_url.is_empty() => path.display().to_string(),
            _ => self.identity.cache_key(),
        }
    }

    fn frames_to_ms(&self, frames: u64) -> u64 {
        match StreamFormat::unpack(self.format.load(Ordering::Acquire)) {
            Some(f) => frames * 1000 / u64::from(f.sample_rate),
            None => 0,
        }
    }

    fn set_state(&self, state: DecoderState) {
        let mut current = lock(&self.state);
        if !self.closing.load(Ordering::Acquire) {
            *current = state;
            self.settled.notify_all();
        }
    }

    fn open(self: &Arc<Self>, auth_token: &str) -> Result<()> {
        let _open = lock(&self.open_lock);
        match *lock(&self.state) {
            DecoderState::Opened | DecoderState::Retrying => return Ok(()),
            DecoderState::Error => bail!("decoder for {} already failed", self.label()),
            DecoderState::Closed | DecoderState::Opening => {}
        }
        if self.closing.load(Ordering::Acquire) {
            bail!("decoder for {} is closed", self.label());
        }
        *lock(&self.auth_token) = auth_token.to_string();
        self.set_state(DecoderState::Opening);

        let permit = self
            .gate
            .acquire(&|| self.closing.load(Ordering::Acquire))
            .ok_or_else(|| anyhow!("decoder for {} closed while waiting to open", self.label()))?;

        let pipeline = loop {
            match Pipeline::open(&self.identity, self.provider.as_ref(), auth_token) {
                Ok(p) => break p,
                Err(e) if is_transient(&e) && !self.closing.load(Ordering::Acquire) => {
                    tracing::warn!(track = %self.label(), error = %e, "open failed, retrying");
                    if self.stop.wait_timeout(self.settings.reconnect_interval) {
                        bail!("decoder for {} closed while reconnecting", self.label());
                    }
                }
                Err(e) => {
                    tracing::error!(track = %self.label(), error = %e, "open failed");
                    self.set_state(DecoderState::Error);
                    return Err(e);
                }
            }
        };

        let format = pipeline.output;
        let capacity = format.sample_rate as usize * self.settings.ring_seconds as usize;
        self.ring.init(format, capacity)?;
        self.format.store(format.pack(), Ordering::Release);
        self.duration_frames
            .store(pipeline.duration_frames.unwrap_or(0), Ordering::Release);
        *lock(&self.permit) = Some(permit);
        *lock(&self.pipeline) = Some(pipeline);

        {
            let mut state = lock(&self.state);
            if self.closing.load(Ordering::Acquire) {
                drop(state);
                *lock(&self.pipeline) = None;
                bail!("decoder for {} closed during open", self.label());
            }
            *state = DecoderState::Opened;
            self.settled.notify_all();
        }
        tracing::info!(track = %self.label(), format = %format, "decoder opened");
        self.spawn("decode", |inner| inner.decode_loop());
        Ok(())
    }

    /// Spawn a helper thread unless the decoder is closing.
    fn spawn(self: &Arc<Self>, name: &str, f: impl FnOnce(Arc<Self>) + Send + 'static) {
        let state = lock(&self.state);
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        let inner = self.clone();
        match thread::Builder::new()
            .name(format!("track-{name}"))
            .spawn(move || f(inner))
        {
            Ok(handle) => lock(&self.threads).push(handle),
            Err(e) => tracing::error!(error = %e, "failed to spawn decoder thread"),
        }
        drop(state);
    }

    fn decode_loop(self: Arc<Self>) {
        let high_mark = (self.ring.capacity() / 2).max(1);
        loop {
            if self.closing.load(Ordering::Acquire) {
                return;
            }
            // End-of-stream and teardown are settled under the pipeline lock so a
            // concurrent seek cannot be overwritten by a stale outcome.
            let outcome = {
                let mut guard = lock(&self.pipeline);
                let Some(p) = guard.as_mut() else {
                    return;
                };
                let step = self.step(p, high_mark);
                match &step {
                    Step::EndOfStream | Step::Failed(StreamEnd::EndOfStream) => {
                        p.eos = true;
                        self.on_end_of_stream();
                    }
                    Step::Failed(StreamEnd::Transient(_)) => *guard = None,
                    _ => {}
                }
                step
            };
            match outcome {
                Step::Pushed | Step::Prefetched => {}
                Step::Full => {
                    self.ring.wait_for_room(high_mark, self.settings.fill_wait);
                }
                Step::EndOfStream | Step::Failed(StreamEnd::EndOfStream) => {
                    self.stop.wait_timeout(self.settings.fill_wait);
                }
                Step::Failed(StreamEnd::Transient(e)) => {
                    self.begin_reconnect(e);
                    return;
                }
                Step::Failed(StreamEnd::Fatal(e)) => {
                    tracing::error!(track = %self.label(), error = %e, "decode failed");
                    self.set_state(DecoderState::Error);
                    self.finished.store(true, Ordering::Release);
                    return;
                }
            }
        }
    }

    /// Read ahead or decode one packet.
    ///
    /// Above `high_mark` buffered frames only read-ahead happens, bounded by the
    /// preload budget.
    fn step(&self, p: &mut Pipeline, high_mark: usize) -> Step {
        if self.ring.len() >= high_mark {
            if p.eos || p.pending_bytes >= self.preload_bytes.load(Ordering::Relaxed) {
                return Step::Full;
            }
            return match p.next_packet() {
                Ok(Some(packet)) => {
                    p.pending_bytes += packet.buf().len();
                    p.pending.push_back(packet);
                    Step::Prefetched
                }
                Ok(None) => Step::Full,
                Err(end) => Step::Failed(end),
            };
        }

        let packet = match p.pending.pop_front() {
            Some(packet) => {
                p.pending_bytes -= packet.buf().len();
                packet
            }
            None if p.eos => return Step::EndOfStream,
            None => match p.next_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => return Step::EndOfStream,
                Err(end) => return Step::Failed(end),
            },
        };

        match p.decode(&packet) {
            Ok(bytes) => {
                let pushed = self.ring.push(bytes);
                self.write_pos.fetch_add(pushed as u64, Ordering::AcqRel);
                Step::Pushed
            }
            Err(end) => Step::Failed(end),
        }
    }

    fn on_end_of_stream(self: &Arc<Self>) {
        if self.looping.load(Ordering::Acquire) && self.write_pos.load(Ordering::Acquire) > 0 {
            // Wait for the consumer to pass the previous loop point before marking another.
            if self.loop_end.load(Ordering::Acquire) == 0 {
                self.mark_loop_point();
                self.spawn_restart();
            }
            return;
        }
        if !self.finished.swap(true, Ordering::AcqRel) {
            tracing::debug!(track = %self.label(), "finished reading");
        }
    }

    fn mark_loop_point(&self) {
        let end = self.write_pos.load(Ordering::Acquire);
        if end > 0 {
            self.loop_end.store(end, Ordering::Release);
        }
    }

    fn spawn_restart(self: &Arc<Self>) {
        if self
            .restarting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.spawn("loop", |inner| {
            inner.restart_from_zero();
            inner.restarting.store(false, Ordering::Release);
        });
    }

    /// Rewind the pipeline to the top without touching buffered frames.
    fn restart_from_zero(&self) {
        let mut pipeline = lock(&self.pipeline);
        // A seek since the loop point was marked owns the cursor now.
        if self.loop_end.load(Ordering::Acquire) == 0 {
            return;
        }
        let rewound = match pipeline.as_mut() {
            Some(p) => p.seek_to_frame(0).map_err(anyhow::Error::from),
            None => Err(anyhow!("no pipeline")),
        };
        if let Err(e) = rewound {
            tracing::debug!(track = %self.label(), error = %e, "rewind failed, reopening");
            let token = lock(&self.auth_token).clone();
            match Pipeline::open(&self.identity, self.provider.as_ref(), &token) {
                Ok(p) => *pipeline = Some(p),
                Err(e) => {
                    tracing::warn!(track = %self.label(), error = %e, "loop restart failed");
                    self.loop_end.store(0, Ordering::Release);
                    self.finished.store(true, Ordering::Release);
                    return;
                }
            }
        }
        self.write_pos.store(0, Ordering::Release);
        self.finished.store(false, Ordering::Release);
    }

    /// Tear down the pipeline, keep the ring, and reopen in the background.
    fn begin_reconnect(self: &Arc<Self>, cause: SymphoniaError) {
        tracing::warn!(
            track = %self.label(),
            error = %cause,
            resume_frame = self.write_pos.load(Ordering::Acquire),
            "stream interrupted, reconnecting"
        );
        self.set_state(DecoderState::Retrying);
        self.spawn("reconnect", |inner| inner.reconnect_loop());
    }

    fn reconnect_loop(self: Arc<Self>) {
        let mut attempt = 0u32;
        loop {
            if self.stop.wait_timeout(self.settings.reconnect_interval) {
                return;
            }
            attempt += 1;
            let token = lock(&self.auth_token).clone();
            let reopened = Pipeline::open(&self.identity, self.provider.as_ref(), &token);
            let mut pipeline = match reopened {
                Ok(p) => p,
                Err(e) if is_transient(&e) => {
                    tracing::warn!(track = %self.label(), attempt, error = %e, "reconnect failed");
                    continue;
                }
                Err(e) => {
                    tracing::error!(track = %self.label(), error = %e, "reconnect gave up");
                    self.set_state(DecoderState::Error);
                    self.finished.store(true, Ordering::Release);
                    return;
                }
            };

            let mut slot = lock(&self.pipeline);
            // Read under the pipeline lock so a concurrent seek's target wins.
            let resume = self.write_pos.load(Ordering::Acquire);
            if resume > 0 {
                if let Err(e) = pipeline.seek_to_frame(resume) {
                    tracing::warn!(track = %self.label(), error = %e, "resume seek failed");
                    drop(slot);
                    continue;
                }
            }
            *slot = Some(pipeline);
            drop(slot);

            tracing::info!(track = %self.label(), attempt, resume_frame = resume, "reconnected");
            self.set_state(DecoderState::Opened);
            self.spawn("decode", |inner| inner.decode_loop());
            return;
        }
    }

    fn close(&self) {
        {
            let mut state = lock(&self.state);
            self.closing.store(true, Ordering::Release);
            *state = DecoderState::Closed;
            self.settled.notify_all();
        }
        self.stop.raise();
        self.gate.interrupt();
        self.ring.free();
        loop {
            let handles = std::mem::take(&mut *lock(&self.threads));
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.join().is_err() {
                    tracing::error!(track = %self.label(), "decoder thread panicked");
                }
            }
        }
        *lock(&self.pipeline) = None;
        *lock(&self.permit) = None;
    }
}

/// Demuxer, codec and packing scratch for one opened source.
struct Pipeline {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    output: StreamFormat,
    duration_frames: Option<u64>,
    packer: Option<Packer>,
    pending: VecDeque<Packet>,
    pending_bytes: usize,
    eos: bool,
    /// Discard decoded frames before this track frame (set by seeks).
    trim_until: Option<u64>,
}

impl Pipeline {
    fn open(identity: &TrackIdentity, provider: &dyn SourceProvider, auth_token: &str) -> Result<Self> {
        let source = provider.open(identity, auth_token).context("open source")?;
        let mss = MediaSourceStream::new(source, Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &identity.hint(),
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .context("probe container")?;
        let format = probed.format;

        let track = format
            .default_track()
            .filter(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .or_else(|| {
                format
                    .tracks()
                    .iter()
                    .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            })
            .ok_or_else(|| anyhow!("no audio stream"))?;
        let params: CodecParameters = track.codec_params.clone();
        let track_id = track.id;

        let sample_rate = params
            .sample_rate
            .filter(|r| *r > 0)
            .ok_or_else(|| anyhow!("unknown sample rate"))?;
        let channels = params
            .channels
            .map(|c| c.count())
            .filter(|c| *c > 0)
            .ok_or_else(|| anyhow!("unknown channel layout"))?;
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .context("create decoder")?;

        let sample_format = SampleFormat::for_source(params.sample_format, params.bits_per_sample);
        let output = StreamFormat::new(sample_format, channels as u16, sample_rate);

        Ok(Self {
            format,
            decoder,
            track_id,
            time_base: params.time_base,
            output,
            duration_frames: params.n_frames,
            packer: None,
            pending: VecDeque::new(),
            pending_bytes: 0,
            eos: false,
            trim_until: None,
        })
    }

    /// Next packet of our track; `None` at end of stream.
    fn next_packet(&mut self) -> Result<Option<Packet>, StreamEnd> {
        loop {
            match self.format.next_packet() {
                Ok(packet) if packet.track_id() != self.track_id => continue,
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => {
                    return match StreamEnd::from_read_error(e) {
                        StreamEnd::EndOfStream => {
                            self.eos = true;
                            Ok(None)
                        }
                        other => Err(other),
                    };
                }
            }
        }
    }

    /// Decode `packet` into packed output bytes, minus any frames before the trim point.
    fn decode(&mut self, packet: &Packet) -> Result<&[u8], StreamEnd> {
        let decoded = match self.decoder.decode(packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!(error = e, "skipping undecodable packet");
                return Ok(&[]);
            }
            Err(e) => return Err(StreamEnd::from_read_error(e)),
        };
        let spec = *decoded.spec();
        if spec.channels.count() != self.output.channels as usize {
            tracing::warn!(channels = spec.channels.count(), "skipping packet with changed layout");
            return Ok(&[]);
        }

        let frames = decoded.frames() as u64;
        let skip = match self.trim_until {
            Some(target) => {
                let start = ts_to_frame(self.time_base, self.output.sample_rate, packet.ts());
                if start + frames <= target {
                    return Ok(&[]);
                }
                self.trim_until = None;
                target.saturating_sub(start).min(frames)
            }
            None => 0,
        };

        let capacity = decoded.capacity() as u64;
        let reuse = self
            .packer
            .as_ref()
            .is_some_and(|p| p.frames >= capacity && p.spec == spec);
        if !reuse {
            self.packer = Some(Packer::new(self.output.sample_format, capacity, spec));
        }
        let Some(packer) = self.packer.as_mut() else {
            return Ok(&[]);
        };
        let bytes = packer.pack(decoded);
        let offset = (skip as usize * self.output.frame_bytes()).min(bytes.len());
        Ok(&bytes[offset..])
    }

    /// Container seek to the keyframe at or before `frame`, then trim forward to it.
    fn seek_to_frame(&mut self, frame: u64) -> Result<(), SymphoniaError> {
        let ts = frame_to_ts(self.time_base, self.output.sample_rate, frame);
        self.format.seek(
            SeekMode::Accurate,
            SeekTo::TimeStamp {
                ts,
                track_id: self.track_id,
            },
        )?;
        self.decoder.reset();
        self.pending.clear();
        self.pending_bytes = 0;
        self.eos = false;
        self.trim_until = (frame > 0).then_some(frame);
        Ok(())
    }
}

fn ts_to_frame(time_base: Option<TimeBase>, sample_rate: u32, ts: u64) -> u64 {
    match time_base {
        Some(tb) => {
            let time = tb.calc_time(ts);
            ((time.seconds as f64 + time.frac) * f64::from(sample_rate)).round() as u64
        }
        None => ts,
    }
}

fn frame_to_ts(time_base: Option<TimeBase>, sample_rate: u32, frame: u64) -> u64 {
    match time_base {
        Some(tb) => {
            let rate = u64::from(sample_rate);
            let time = Time::new(frame / rate, (frame % rate) as f64 / rate as f64);
            tb.calc_timestamp(time)
        }
        None => frame,
    }
}

/// Interleaving converter into one of the packed output formats.
struct Packer {
    frames: u64,
    spec: SignalSpec,
    buf: PackedBuffer,
}

enum PackedBuffer {
    U8(RawSampleBuffer<u8>),
    S16(RawSampleBuffer<i16>),
    S32(RawSampleBuffer<i32>),
    F32(RawSampleBuffer<f32>),
}

impl Packer {
    fn new(format: SampleFormat, frames: u64, spec: SignalSpec) -> Self {
        let buf = match format {
            SampleFormat::U8 => PackedBuffer::U8(RawSampleBuffer::new(frames, spec)),
            SampleFormat::S16 => PackedBuffer::S16(RawSampleBuffer::new(frames, spec)),
            SampleFormat::S32 => PackedBuffer::S32(RawSampleBuffer::new(frames, spec)),
            SampleFormat::F32 => PackedBuffer::F32(RawSampleBuffer::new(frames, spec)),
        };
        Self { frames, spec, buf }
    }

    fn pack(&mut self, decoded: AudioBufferRef<'_>) -> &[u8] {
        match &mut self.buf {
            PackedBuffer::U8(b) => {
                b.copy_interleaved_ref(decoded);
                b.as_bytes()
            }
            PackedBuffer::S16(b) => {
                b.copy_interleaved_ref(decoded);
                b.as_bytes()
            }
            PackedBuffer::S32(b) => {
                b.copy_interleaved_ref(decoded);
                b.as_bytes()
            }
            PackedBuffer::F32(b) => {
                b.copy_interleaved_ref(decoded);
                b.as_bytes()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        FlakyProvider, MemoryProvider, drain_frames, s16_values, wait_until, wav_ramp,
    };

    fn settings() -> DecoderSettings {
        DecoderSettings {
            ring_seconds: 1,
            preload_bytes: 64 * 1024,
            reconnect_interval: Duration::from_millis(10),
            fill_wait: Duration::from_millis(2),
        }
    }

    fn decoder(provider: Arc<dyn SourceProvider>, name: &str) -> TrackDecoder {
        TrackDecoder::new(
            TrackIdentity::local(name),
            provider,
            OpenGate::new(4),
            settings(),
        )
    }

    fn opened(frames: usize) -> TrackDecoder {
        let provider = MemoryProvider::new().with_track("a.wav", wav_ramp(8_000, 1, frames));
        let d = decoder(Arc::new(provider), "a.wav");
        d.open("").unwrap();
        d
    }

    #[test]
    fn open_reports_packed_format() {
        let d = opened(800);
        assert!(d.is_opened());
        assert_eq!(
            d.format(),
            Some(StreamFormat::new(SampleFormat::S16, 1, 8_000))
        );
        assert_eq!(d.duration_ms(), Some(100));
    }

    #[test]
    fn open_missing_track_is_terminal() {
        let d = decoder(Arc::new(MemoryProvider::new()), "missing.wav");
        assert!(d.open("").is_err());
        assert!(d.is_error());
    }

    #[test]
    fn garbage_input_fails_probe() {
        let provider = MemoryProvider::new().with_track("bad.wav", vec![7u8; 512]);
        let d = decoder(Arc::new(provider), "bad.wav");
        assert!(d.open("").is_err());
        assert_eq!(d.state(), DecoderState::Error);
    }

    #[test]
    fn decodes_every_frame_in_order_then_drains() {
        let d = opened(3_000);
        let samples = drain_frames(&d, 3_000);
        assert_eq!(samples, (0..3_000).map(|i| i as i16).collect::<Vec<_>>());
        assert!(wait_until(Duration::from_secs(2), || d.finished_reading()));
        let mut out = [0u8; 64];
        let read = d.read_frames(&mut out);
        assert_eq!(read.frames, 0);
        assert!(read.drained);
        assert_eq!(d.playback_time_ms(), 375);
    }

    #[test]
    fn seek_within_buffer_drains_ring() {
        let d = opened(6_000);
        assert!(wait_until(Duration::from_secs(2), || d.buffered_frames() >= 2_000));
        d.seek(100).unwrap();
        assert_eq!(d.playback_time_ms(), 100);
        assert_eq!(drain_frames(&d, 4)[0], 800);
    }

    #[test]
    fn consecutive_buffered_seeks_match_single_seek() {
        let a = opened(6_000);
        let b = opened(6_000);
        assert!(wait_until(Duration::from_secs(2), || {
            a.buffered_frames() >= 3_000 && b.buffered_frames() >= 3_000
        }));
        a.seek(50).unwrap();
        a.seek(150).unwrap();
        b.seek(150).unwrap();
        assert_eq!(a.playback_time_ms(), b.playback_time_ms());
        assert_eq!(drain_frames(&a, 8), drain_frames(&b, 8));
    }

    #[test]
    fn seek_beyond_buffer_is_sample_accurate() {
        let d = opened(40_000);
        d.seek(4_000).unwrap();
        assert_eq!(d.playback_time_ms(), 4_000);
        let samples = drain_frames(&d, 16);
        assert_eq!(samples, (32_000..32_016).map(|i| i as i16).collect::<Vec<_>>());
    }

    #[test]
    fn backward_seek_restarts_from_target() {
        let d = opened(4_000);
        drain_frames(&d, 2_000);
        d.seek(0).unwrap();
        assert_eq!(drain_frames(&d, 3), vec![0, 1, 2]);
    }

    #[test]
    fn seek_before_open_fails() {
        let d = decoder(Arc::new(MemoryProvider::new()), "x.wav");
        assert!(d.seek(10).is_err());
    }

    #[test]
    fn looping_wraps_position_and_reports_once() {
        let d = opened(400);
        d.set_looping(true);
        let mut out = vec![0u8; 2 * 100];
        let mut consumed = 0usize;
        let mut loops = 0;
        let mut values = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while consumed < 600 && std::time::Instant::now() < deadline {
            let read = d.read_frames(&mut out);
            if read.looped {
                loops += 1;
            }
            values.extend(s16_values(&out[..read.frames * 2]));
            consumed += read.frames;
            if read.frames == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        assert_eq!(loops, 1);
        assert_eq!(values[399], 399);
        assert_eq!(values[400], 0);
        assert_eq!(d.playback_time_ms(), (consumed as u64 - 400) * 1000 / 8_000);
    }

    #[test]
    fn enabling_loop_after_end_restarts() {
        let d = opened(200);
        drain_frames(&d, 200);
        assert!(wait_until(Duration::from_secs(2), || d.finished_reading()));
        d.set_looping(true);
        assert!(wait_until(Duration::from_secs(2), || d.buffered_frames() > 0));
        let mut out = [0u8; 2];
        let read = d.read_frames(&mut out);
        assert_eq!(read.frames, 1);
        assert!(read.looped);
        assert_eq!(s16_values(&out), vec![0]);
    }

    #[test]
    fn transient_open_failures_are_retried() {
        let provider = FlakyProvider::new(wav_ramp(8_000, 1, 800), 2, None);
        let d = decoder(provider.clone(), "a.wav");
        d.open("token").unwrap();
        assert!(d.is_opened());
        assert_eq!(provider.opens(), 3);
        assert_eq!(provider.last_token(), "token");
    }

    #[test]
    fn mid_stream_reset_reconnects_and_resumes() {
        let provider = FlakyProvider::new(wav_ramp(8_000, 1, 20_000), 0, Some(12_000));
        let d = decoder(provider.clone(), "a.wav");
        d.open("").unwrap();
        let samples = drain_frames(&d, 20_000);
        assert_eq!(samples.len(), 20_000);
        assert!(samples.iter().enumerate().all(|(i, v)| *v == i as i16));
        assert!(provider.opens() >= 2);
    }

    #[test]
    fn close_is_idempotent_and_stops_output() {
        let d = opened(4_000);
        d.close();
        d.close();
        assert_eq!(d.state(), DecoderState::Closed);
        assert!(!d.claim_open());
        let mut out = [0u8; 32];
        assert_eq!(d.read_frames(&mut out).frames, 0);
    }

    #[test]
    fn waiter_sees_open_settle() {
        let provider = MemoryProvider::new().with_track("a.wav", wav_ramp(8_000, 1, 800));
        let d = Arc::new(decoder(Arc::new(provider), "a.wav"));
        assert!(d.claim_open());
        let opener = {
            let d = d.clone();
            std::thread::spawn(move || d.open(""))
        };
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut state = d.state();
        while state != DecoderState::Opened && std::time::Instant::now() < deadline {
            state = d.wait_open_settled(Duration::from_millis(50));
        }
        opener.join().unwrap().unwrap();
        assert_eq!(state, DecoderState::Opened);
        assert!(d.is_opened());
    }

    #[test]
    fn only_one_caller_claims_an_open() {
        let d = decoder(Arc::new(MemoryProvider::new()), "x.wav");
        assert!(d.claim_open());
        assert!(!d.claim_open());
    }

    #[test]
    fn timestamp_conversion_is_exact_for_sample_timebase() {
        let tb = Some(TimeBase::new(1, 44_100));
        assert_eq!(frame_to_ts(tb, 44_100, 88_200), 88_200);
        assert_eq!(ts_to_frame(tb, 44_100, 22_050), 22_050);
        assert_eq!(ts_to_frame(None, 44_100, 5), 5);
    }
}
