//! Player configuration file.
//!
//! Every table is optional; missing keys fall back to the engine defaults.

use std::path::Path;

use anyhow::{Context, Result};
use playback_engine::{CacheConfig, EngineConfig, OutputConfig};
use serde::Deserialize;

use crate::cli::Args;

/// Top-level player configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlayerConfig {
    pub engine: EngineConfig,
    pub cache: CacheConfig,
    pub output: OutputConfig,
}

impl PlayerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str::<PlayerConfig>(raw)?)
    }

    /// File values (or defaults), with command-line flags on top.
    pub fn resolve(args: &Args) -> Result<Self> {
        let mut cfg = match args.config.as_deref() {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(device) = args.device.as_ref() {
            cfg.output.device = Some(device.clone());
        }
        if let Some(frames) = args.chunk_frames {
            cfg.output.chunk_frames = Some(frames);
        }
        Ok(cfg)
    }
}
