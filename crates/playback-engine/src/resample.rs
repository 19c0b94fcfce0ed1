//! Format conversion for devices that cannot play a decoder's format directly.
//!
//! [`StreamConverter`] pulls fixed-size chunks of packed frames from a render
//! callback, converts them to `f32`, resamples with Rubato when the rates differ and
//! maps channels to the device layout. Every buffer is allocated up front so the
//! converter can run inside the audio callback.

use anyhow::{Context, Result};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::format::{StreamFormat, decode_to_f32};

/// Default converter input chunk in frames.
pub const DEFAULT_CHUNK_FRAMES: usize = 1024;

pub struct StreamConverter {
    source: StreamFormat,
    dst_channels: usize,
    chunk_frames: usize,
    resampler: Option<Async<f32>>,
    indexing: Indexing,
    /// One chunk of packed source frames.
    raw: Vec<u8>,
    /// The same chunk as `f32`.
    input: Vec<f32>,
    /// Converted frames at the source channel count.
    output: Vec<f32>,
    out_frames: usize,
    out_pos: usize,
}

impl StreamConverter {
    /// Converter from `source` to `dst_rate` / `dst_channels`.
    pub fn new(
        source: StreamFormat,
        dst_rate: u32,
        dst_channels: usize,
        chunk_frames: usize,
    ) -> Result<Self> {
        let channels = source.channels as usize;
        let chunk_frames = chunk_frames.max(1);
        let ratio = f64::from(dst_rate) / f64::from(source.sample_rate);

        let resampler = if dst_rate == source.sample_rate {
            None
        } else {
            let sinc_len = 128;
            let window = WindowFunction::BlackmanHarris2;
            let params = SincInterpolationParameters {
                sinc_len,
                f_cutoff: calculate_cutoff(sinc_len, window),
                interpolation: SincInterpolationType::Cubic,
                oversampling_factor: 256,
                window,
            };
            let resampler = Async::<f32>::new_sinc(
                ratio,
                1.1,
                &params,
                chunk_frames,
                channels,
                FixedAsync::Input,
            )
            .context("create resampler")?;
            Some(resampler)
        };

        let out_capacity = (chunk_frames as f64 * ratio * 1.1).ceil() as usize + 64;
        Ok(Self {
            source,
            dst_channels: dst_channels.max(1),
            chunk_frames,
            resampler,
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
            raw: vec![0; chunk_frames * source.frame_bytes()],
            input: vec![0.0; chunk_frames * channels],
            output: vec![0.0; out_capacity.max(chunk_frames) * channels],
            out_frames: 0,
            out_pos: 0,
        })
    }

    pub fn source(&self) -> StreamFormat {
        self.source
    }

    pub fn is_resampling(&self) -> bool {
        self.resampler.is_some()
    }

    /// Fill `out` (interleaved at the device layout), pulling chunks from `render`.
    ///
    /// `render` must fill the whole buffer it is given, with silence if need be.
    pub fn fill<F>(&mut self, out: &mut [f32], mut render: F)
    where
        F: FnMut(&mut [u8]),
    {
        let frames = out.len() / self.dst_channels;
        for frame in 0..frames {
            let mut attempts = 0;
            while self.out_pos >= self.out_frames {
                attempts += 1;
                if attempts > 4 || !self.refill(&mut render) {
                    out[frame * self.dst_channels..].fill(0.0);
                    return;
                }
            }
            for ch in 0..self.dst_channels {
                out[frame * self.dst_channels + ch] = self.mapped_sample(ch);
            }
            self.out_pos += 1;
        }
    }

    fn refill<F>(&mut self, render: &mut F) -> bool
    where
        F: FnMut(&mut [u8]),
    {
        render(&mut self.raw);
        let channels = self.source.channels as usize;
        decode_to_f32(self.source.sample_format, &self.raw, &mut self.input);
        self.out_pos = 0;

        let Some(resampler) = self.resampler.as_mut() else {
            let len = self.input.len();
            self.output[..len].copy_from_slice(&self.input);
            self.out_frames = self.chunk_frames;
            return true;
        };

        let Ok(input) = InterleavedSlice::new(&self.input, channels, self.chunk_frames) else {
            return false;
        };
        let capacity = self.output.len() / channels;
        let Ok(mut output) = InterleavedSlice::new_mut(&mut self.output, channels, capacity) else {
            return false;
        };
        self.indexing.input_offset = 0;
        self.indexing.output_offset = 0;
        match resampler.process_into_buffer(&input, &mut output, Some(&self.indexing)) {
            Ok((_, produced)) => {
                self.out_frames = produced;
                true
            }
            Err(_) => {
                self.out_frames = 0;
                false
            }
        }
    }

    /// Mono is duplicated, stereo folds to mono by averaging, anything else clamps.
    fn mapped_sample(&self, dst_ch: usize) -> f32 {
        let src_channels = self.source.channels as usize;
        let base = self.out_pos * src_channels;
        let get = |ch: usize| self.output.get(base + ch).copied().unwrap_or(0.0);
        match (src_channels, self.dst_channels) {
            (2, 1) => 0.5 * (get(0) + get(1)),
            (1, _) => get(0),
            _ => get(dst_ch.min(src_channels - 1)),
        }
    }
}
