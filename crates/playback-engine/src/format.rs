//! Packed PCM formats carried between decoders, the engine and the output device.
//!
//! Decoders emit interleaved frames in one of four packed sample formats. The
//! engine only hot-swaps between decoders whose [`StreamFormat`] matches the one the
//! device was started with, so the bytes can be copied straight through.

use std::fmt;

use serde::Serialize;
use symphonia::core::sample::SampleFormat as SourceSampleFormat;

/// Packed sample formats a decoder can produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::F32 => 4,
        }
    }

    /// Narrowest packed format that keeps the source sample family.
    ///
    /// Codecs that do not advertise a sample format (FLAC, ALAC) are judged by their
    /// bit depth; lossy codecs and anything unusual decode to `F32`.
    pub fn for_source(format: Option<SourceSampleFormat>, bits_per_sample: Option<u32>) -> Self {
        match format {
            Some(SourceSampleFormat::U8) => SampleFormat::U8,
            Some(SourceSampleFormat::S16) => SampleFormat::S16,
            Some(SourceSampleFormat::S32) => SampleFormat::S32,
            Some(_) => SampleFormat::F32,
            None => match bits_per_sample {
                Some(1..=16) => SampleFormat::S16,
                Some(17..=32) => SampleFormat::S32,
                _ => SampleFormat::F32,
            },
        }
    }

    /// Matching CPAL sample format for raw (byte-copy) streams.
    pub fn to_cpal(self) -> cpal::SampleFormat {
        match self {
            SampleFormat::U8 => cpal::SampleFormat::U8,
            SampleFormat::S16 => cpal::SampleFormat::I16,
            SampleFormat::S32 => cpal::SampleFormat::I32,
            SampleFormat::F32 => cpal::SampleFormat::F32,
        }
    }

    fn code(self) -> u8 {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S32 => 3,
            SampleFormat::F32 => 4,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(SampleFormat::U8),
            2 => Some(SampleFormat::S16),
            3 => Some(SampleFormat::S32),
            4 => Some(SampleFormat::F32),
            _ => None,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S16 => "s16",
            SampleFormat::S32 => "s32",
            SampleFormat::F32 => "f32",
        };
        f.write_str(name)
    }
}

/// Sample format, channel count and rate of an interleaved PCM stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct StreamFormat {
    pub sample_format: SampleFormat,
    pub channels: u16,
    pub sample_rate: u32,
}

impl StreamFormat {
    pub fn new(sample_format: SampleFormat, channels: u16, sample_rate: u32) -> Self {
        Self {
            sample_format,
            channels,
            sample_rate,
        }
    }

    /// Bytes occupied by one interleaved frame.
    pub fn frame_bytes(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channels as usize
    }

    /// Pack into a single word so it can live in an atomic.
    pub(crate) fn pack(&self) -> u64 {
        (u64::from(self.sample_format.code()) << 56)
            | (u64::from(self.channels) << 32)
            | u64::from(self.sample_rate)
    }

    pub(crate) fn unpack(word: u64) -> Option<Self> {
        let sample_format = SampleFormat::from_code((word >> 56) as u8)?;
        let channels = ((word >> 32) & 0xffff) as u16;
        let sample_rate = (word & 0xffff_ffff) as u32;
        if channels == 0 || sample_rate == 0 {
            return None;
        }
        Some(Self::new(sample_format, channels, sample_rate))
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}ch/{}Hz",
            self.sample_format, self.channels, self.sample_rate
        )
    }
}

/// Fill `out` with digital silence for `format`.
pub fn fill_silence(format: SampleFormat, out: &mut [u8]) {
    let value = match format {
        SampleFormat::U8 => 0x80,
        _ => 0,
    };
    out.fill(value);
}

/// Scale every sample in `buf` by `gain` in place.
pub fn apply_gain(format: SampleFormat, buf: &mut [u8], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    let gain = gain.clamp(0.0, 1.0);
    match format {
        SampleFormat::U8 => {
            for b in buf.iter_mut() {
                let centered = f32::from(*b) - 128.0;
                *b = (centered * gain + 128.0).round().clamp(0.0, 255.0) as u8;
            }
        }
        SampleFormat::S16 => {
            for chunk in buf.chunks_exact_mut(2) {
                let v = i16::from_ne_bytes([chunk[0], chunk[1]]);
                let scaled = (f32::from(v) * gain).round() as i16;
                chunk.copy_from_slice(&scaled.to_ne_bytes());
            }
        }
        SampleFormat::S32 => {
            for chunk in buf.chunks_exact_mut(4) {
                let v = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let scaled = (f64::from(v) * f64::from(gain)).round() as i32;
                chunk.copy_from_slice(&scaled.to_ne_bytes());
            }
        }
        SampleFormat::F32 => {
            for chunk in buf.chunks_exact_mut(4) {
                let v = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                chunk.copy_from_slice(&(v * gain).to_ne_bytes());
            }
        }
    }
}

/// Convert packed samples in `bytes` to normalized `f32` in `out`.
///
/// Returns the number of samples written, bounded by both buffers.
pub fn decode_to_f32(format: SampleFormat, bytes: &[u8], out: &mut [f32]) -> usize {
    let width = format.bytes_per_sample();
    let mut written = 0;
    for (chunk, slot) in bytes.chunks_exact(width).zip(out.iter_mut()) {
        *slot = match format {
            SampleFormat::U8 => (f32::from(chunk[0]) - 128.0) / 128.0,
            SampleFormat::S16 => f32::from(i16::from_ne_bytes([chunk[0], chunk[1]])) / 32_768.0,
            SampleFormat::S32 => {
                i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f32
                    / 2_147_483_648.0
            }
            SampleFormat::F32 => f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
        };
        written += 1;
    }
    written
}
