//! CPAL output streams.
//!
//! Two shapes of stream:
//! - raw: the device runs at the decoder's exact format and the callback copies
//!   rendered bytes straight into the device buffer
//! - converting: the callback runs a [`StreamConverter`] and writes the device's
//!   sample type
//!
//! Both apply the master gain in the callback. Neither locks, allocates in steady
//! state or logs from the data callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use crate::engine::Renderer;
use crate::format::{StreamFormat, apply_gain};
use crate::resample::StreamConverter;

/// Largest callback buffer the converting stream preallocates for.
const MAX_CALLBACK_FRAMES: usize = 16_384;

fn gain_of(gain: &AtomicU32) -> f32 {
    f32::from_bits(gain.load(Ordering::Relaxed))
}

/// Stream that plays `format` byte-for-byte.
pub(crate) fn build_raw_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: StreamFormat,
    renderer: Renderer,
    gain: Arc<AtomicU32>,
) -> Result<cpal::Stream> {
    let sample_format = format.sample_format;
    let err_fn = |err| tracing::warn!("stream error: {err}");
    let stream = device.build_output_stream_raw(
        config,
        sample_format.to_cpal(),
        move |data: &mut cpal::Data, _: &cpal::OutputCallbackInfo| {
            let bytes = data.bytes_mut();
            renderer.render(bytes);
            apply_gain(sample_format, bytes, gain_of(&gain));
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Stream in the device's preferred config, converting from the renderer's format.
pub(crate) fn build_converting_stream(
    device: &cpal::Device,
    supported: &cpal::SupportedStreamConfig,
    converter: StreamConverter,
    renderer: Renderer,
    gain: Arc<AtomicU32>,
) -> Result<cpal::Stream> {
    let config = supported.config();
    match supported.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, &config, converter, renderer, gain),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, &config, converter, renderer, gain),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, &config, converter, renderer, gain),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, &config, converter, renderer, gain),
        cpal::SampleFormat::U8 => build_stream::<u8>(device, &config, converter, renderer, gain),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut converter: StreamConverter,
    renderer: Renderer,
    gain: Arc<AtomicU32>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let mut scratch = vec![0.0f32; MAX_CALLBACK_FRAMES * config.channels as usize];
    let err_fn = |err| tracing::warn!("stream error: {err}");
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            if scratch.len() < data.len() {
                scratch.resize(data.len(), 0.0);
            }
            let samples = &mut scratch[..data.len()];
            converter.fill(samples, |buf| renderer.render(buf));
            let gain = gain_of(&gain);
            for (out, sample) in data.iter_mut().zip(samples.iter()) {
                *out = <T as cpal::Sample>::from_sample::<f32>(sample * gain);
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}
