//! Output device discovery and configuration selection.
//!
//! Thin wrappers around CPAL for:
//! - selecting the default device or a device by name substring
//! - finding a config that plays a decoder's format byte-for-byte
//! - falling back to the best config for conversion
//! - listing devices for the CLI

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

use crate::format::StreamFormat;

/// Pick the first output device whose name contains `needle` (case-insensitive), or the
/// host default when `needle` is `None`.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .map(|desc| matches_device_name(&desc.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

pub fn device_name(device: &cpal::Device) -> String {
    device
        .description()
        .map(|d| d.name().to_string())
        .unwrap_or_else(|_| "<unknown>".to_string())
}

/// A stream config that takes `format` unchanged, if the device supports one.
pub fn exact_config(device: &cpal::Device, format: StreamFormat) -> Result<Option<cpal::StreamConfig>> {
    let wanted = format.sample_format.to_cpal();
    let found = device
        .supported_output_configs()
        .context("query output configs")?
        .find(|range| {
            range_accepts(
                range.sample_format(),
                range.channels(),
                range.min_sample_rate(),
                range.max_sample_rate(),
                wanted,
                format,
            )
        })
        .map(|range| range.with_sample_rate(format.sample_rate).config());
    Ok(found)
}

fn range_accepts(
    range_format: cpal::SampleFormat,
    channels: u16,
    min_rate: u32,
    max_rate: u32,
    wanted: cpal::SampleFormat,
    format: StreamFormat,
) -> bool {
    range_format == wanted
        && channels == format.channels
        && (min_rate..=max_rate).contains(&format.sample_rate)
}

/// Pick the best supported output config for conversion.
///
/// Prefers the highest supported rate at or below `target_rate`, else the lowest rate
/// above it; ties go to the better sample format.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<(bool, u32, u8, cpal::SupportedStreamConfig)> = None;

    for range in device.supported_output_configs()? {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let below = target_rate.is_none_or(|t| rate <= t);
        let rank = sample_format_rank(range.sample_format());
        let replace = match &best {
            None => true,
            Some((b_below, b_rate, b_rank, _)) => {
                is_better_candidate(below, rate, rank, *b_below, *b_rate, *b_rank)
            }
        };
        if replace {
            best = Some((below, rate, rank, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, _, _, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) => target.clamp(min, max.max(min)),
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        cpal::SampleFormat::U8 => 4,
        _ => 10,
    }
}

fn is_better_candidate(
    below: bool,
    rate: u32,
    format_rank: u8,
    best_below: bool,
    best_rate: u32,
    best_rank: u8,
) -> bool {
    if below != best_below {
        below
    } else if rate != best_rate {
        // Below target: closer to target is higher. Above target: closer is lower.
        if below { rate > best_rate } else { rate < best_rate }
    } else {
        format_rank < best_rank
    }
}

/// Output device metadata for `--list-devices`.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub min_rate: u32,
    pub max_rate: u32,
    pub max_channels: u16,
    pub is_default: bool,
}

pub fn list_devices(host: &cpal::Host) -> Result<Vec<DeviceInfo>> {
    let default_name = host.default_output_device().map(|d| device_name(&d));
    let mut out = Vec::new();
    for device in host.output_devices().context("No output devices")? {
        let name = device_name(&device);
        let mut info = DeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            min_rate: u32::MAX,
            max_rate: 0,
            max_channels: 0,
        };
        match device.supported_output_configs() {
            Ok(ranges) => {
                for range in ranges {
                    info.min_rate = info.min_rate.min(range.min_sample_rate());
                    info.max_rate = info.max_rate.max(range.max_sample_rate());
                    info.max_channels = info.max_channels.max(range.channels());
                }
            }
            Err(e) => tracing::debug!(device = %info.name, error = %e, "no config ranges"),
        }
        if info.max_rate == 0 {
            tracing::warn!(device = %info.name, "skipping device without usable configs");
            continue;
        }
        out.push(info);
    }
    Ok(out)
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
