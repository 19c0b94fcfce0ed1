//! Fixed-capacity sample ring between a decode thread and the audio callback.
//!
//! Frames are stored as packed bytes in the owning decoder's [`StreamFormat`], so the
//! callback copies them straight into the device buffer. The ring never grows:
//! a push that does not fit first discards the oldest frames, which keeps a stalled
//! consumer from ever blocking the producer (and vice versa).
//!
//! One mutex serializes every operation. Both sides only hold it for a bounded
//! `memcpy`, which is what makes it usable from the real-time callback.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};

use crate::format::StreamFormat;

/// Overwrite-on-overflow ring of interleaved frames.
pub struct SampleRingBuffer {
    inner: Mutex<RingInner>,
    room: Condvar,
}

#[derive(Default)]
struct RingInner {
    data: Vec<u8>,
    frame_bytes: usize,
    /// Capacity in frames.
    capacity: usize,
    /// Frame index of the oldest buffered frame.
    head: usize,
    /// Buffered frames.
    len: usize,
    /// Level a waiting producer wants the ring to fall to.
    low_mark: Option<usize>,
}

impl RingInner {
    fn copy_in(&mut self, src: &[u8]) {
        let fb = self.frame_bytes;
        let frames = src.len() / fb;
        let tail = (self.head + self.len) % self.capacity;
        let first = frames.min(self.capacity - tail);
        self.data[tail * fb..(tail + first) * fb].copy_from_slice(&src[..first * fb]);
        let rest = frames - first;
        if rest > 0 {
            self.data[..rest * fb].copy_from_slice(&src[first * fb..frames * fb]);
        }
        self.len += frames;
    }

    fn copy_out(&mut self, dst: &mut [u8], frames: usize) {
        let fb = self.frame_bytes;
        let first = frames.min(self.capacity - self.head);
        dst[..first * fb].copy_from_slice(&self.data[self.head * fb..(self.head + first) * fb]);
        let rest = frames - first;
        if rest > 0 {
            dst[first * fb..frames * fb].copy_from_slice(&self.data[..rest * fb]);
        }
        self.discard(frames);
    }

    fn discard(&mut self, frames: usize) {
        if self.capacity == 0 {
            return;
        }
        self.head = (self.head + frames) % self.capacity;
        self.len -= frames;
    }

    /// Whether shrinking from `before` frames crossed the producer's low mark.
    fn crossed_low_mark(&self, before: usize) -> bool {
        self.low_mark
            .is_some_and(|mark| before > mark && self.len <= mark)
    }
}

impl SampleRingBuffer {
    /// Create an unallocated ring. Call [`SampleRingBuffer::init`] before use.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RingInner::default()),
            room: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (Re)allocate for `capacity_frames` frames of `format`, dropping any content.
    pub fn init(&self, format: StreamFormat, capacity_frames: usize) -> Result<()> {
        if capacity_frames == 0 || format.channels == 0 {
            bail!("ring buffer needs a non-zero capacity and channel count");
        }
        let frame_bytes = format.frame_bytes();
        let mut g = self.lock();
        g.data = vec![0u8; capacity_frames * frame_bytes];
        g.frame_bytes = frame_bytes;
        g.capacity = capacity_frames;
        g.head = 0;
        g.len = 0;
        drop(g);
        self.room.notify_all();
        Ok(())
    }

    /// Release the backing storage. The ring behaves as empty afterwards.
    pub fn free(&self) {
        let mut g = self.lock();
        *g = RingInner::default();
        drop(g);
        self.room.notify_all();
    }

    /// Append whole frames from `bytes`, discarding the oldest frames on overflow.
    ///
    /// When more than `capacity` frames are pushed at once, only the newest
    /// `capacity` survive. Returns the number of frames stored.
    pub fn push(&self, bytes: &[u8]) -> usize {
        let mut g = self.lock();
        if g.capacity == 0 {
            return 0;
        }
        let fb = g.frame_bytes;
        let mut frames = bytes.len() / fb;
        let mut src = &bytes[..frames * fb];
        if frames > g.capacity {
            src = &src[(frames - g.capacity) * fb..];
            frames = g.capacity;
        }
        let free = g.capacity - g.len;
        if frames > free {
            let overflow = (frames - free).min(g.len);
            g.discard(overflow);
        }
        g.copy_in(src);
        frames
    }

    /// Copy up to `out.len() / frame_bytes` frames into `out`. Never blocks on data.
    pub fn pop(&self, out: &mut [u8]) -> usize {
        let mut g = self.lock();
        if g.capacity == 0 {
            return 0;
        }
        let frames = (out.len() / g.frame_bytes).min(g.len);
        if frames == 0 {
            return 0;
        }
        let before = g.len;
        g.copy_out(out, frames);
        let wake = g.crossed_low_mark(before);
        drop(g);
        if wake {
            self.room.notify_all();
        }
        frames
    }

    /// Discard up to `frames` of the oldest frames without copying them.
    pub fn drain(&self, frames: usize) -> usize {
        let mut g = self.lock();
        let frames = frames.min(g.len);
        let before = g.len;
        g.discard(frames);
        let wake = g.crossed_low_mark(before);
        drop(g);
        if wake {
            self.room.notify_all();
        }
        frames
    }

    /// Drop every buffered frame.
    pub fn clear(&self) {
        let mut g = self.lock();
        g.head = 0;
        g.len = 0;
        drop(g);
        self.room.notify_all();
    }

    /// Buffered frames.
    pub fn len(&self) -> usize {
        self.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity in frames (0 before `init`).
    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Block until at most `mark` frames are buffered or `timeout` elapses.
    ///
    /// Returns `true` when the ring is at or below the mark on return.
    pub fn wait_for_room(&self, mark: usize, timeout: Duration) -> bool {
        let mut g = self.lock();
        if g.len <= mark {
            return true;
        }
        g.low_mark = Some(mark);
        let (mut g, _) = self
            .room
            .wait_timeout_while(g, timeout, |inner| inner.len > mark)
            .unwrap_or_else(PoisonError::into_inner);
        g.low_mark = None;
        g.len <= mark
    }
}

impl Default for SampleRingBuffer {
    fn default() -> Self {
        Self::new()
    }
}
