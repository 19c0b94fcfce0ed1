use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "player", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// TOML file with [engine], [cache] and [output] tables
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Resampler input chunk size in frames, used when the device needs conversion
    #[arg(long)]
    pub chunk_frames: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Queue local files and play them in order
    Files {
        /// Audio files (FLAC, MP3, WAV, ...)
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Queue tracks streamed from a music server through the disk cache
    Stream {
        /// Server base URL, e.g. http://music.local:8000/
        #[arg(long)]
        server: String,

        /// Directory for per-track block caches
        #[arg(long)]
        cache: PathBuf,

        /// Session cookie sent with every range request
        #[arg(long)]
        token: Option<String>,

        /// Rendition requested from the server
        #[arg(long, default_value = "max")]
        quality: String,

        /// Server track ids
        #[arg(required = true)]
        track_ids: Vec<i64>,
    },
}
