//! Audio output abstraction and the CPAL-backed implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use cpal::traits::StreamTrait;
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

use crate::config::OutputConfig;
use crate::device::{device_name, exact_config, pick_device, pick_output_config};
use crate::engine::Renderer;
use crate::format::StreamFormat;
use crate::playback::{build_converting_stream, build_raw_stream};
use crate::resample::{DEFAULT_CHUNK_FRAMES, StreamConverter};

/// A device the engine can render into.
///
/// `start` opens a stream in `format` whose callback calls [`Renderer::render`];
/// `stop` must not return until that callback can no longer run.
pub trait AudioOutput: Send {
    fn start(&mut self, format: StreamFormat, renderer: Renderer) -> Result<()>;
    fn stop(&mut self);
    fn set_paused(&mut self, paused: bool);
    /// Master gain in `[0, 1]`.
    fn set_volume(&mut self, volume: f32);
    fn is_running(&self) -> bool;
}

enum Command {
    Start {
        format: StreamFormat,
        renderer: Renderer,
        reply: Sender<Result<()>>,
    },
    Stop {
        reply: Sender<()>,
    },
    Pause(bool),
    Shutdown,
}

/// Output on a CPAL device.
///
/// CPAL streams are not `Send` on every host, so a dedicated thread owns the host and
/// the stream and takes commands over a channel.
pub struct CpalOutput {
    tx: Sender<Command>,
    gain: Arc<AtomicU32>,
    running: bool,
    worker: Option<JoinHandle<()>>,
}

impl CpalOutput {
    pub fn new(config: OutputConfig) -> Result<Self> {
        let (tx, rx) = unbounded();
        let gain = Arc::new(AtomicU32::new(1.0f32.to_bits()));
        let gain_thread = gain.clone();
        let worker = thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || run_device_thread(rx, config, gain_thread))
            .context("spawn output thread")?;
        Ok(Self {
            tx,
            gain,
            running: false,
            worker: Some(worker),
        })
    }
}

impl AudioOutput for CpalOutput {
    fn start(&mut self, format: StreamFormat, renderer: Renderer) -> Result<()> {
        let (reply, rx) = bounded(1);
        self.tx
            .send(Command::Start {
                format,
                renderer,
                reply,
            })
            .map_err(|_| anyhow!("output thread is gone"))?;
        let result = rx.recv().map_err(|_| anyhow!("output thread is gone"))?;
        self.running = result.is_ok();
        result
    }

    fn stop(&mut self) {
        let (reply, rx) = bounded(1);
        if self.tx.send(Command::Stop { reply }).is_ok() {
            let _ = rx.recv();
        }
        self.running = false;
    }

    fn set_paused(&mut self, paused: bool) {
        let _ = self.tx.send(Command::Pause(paused));
    }

    fn set_volume(&mut self, volume: f32) {
        self.gain
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("output thread panicked");
            }
        }
    }
}

fn run_device_thread(rx: Receiver<Command>, config: OutputConfig, gain: Arc<AtomicU32>) {
    let host = cpal::default_host();
    let mut stream: Option<cpal::Stream> = None;
    for command in rx {
        match command {
            Command::Start {
                format,
                renderer,
                reply,
            } => {
                stream = None;
                let result = open_stream(&host, &config, format, renderer, gain.clone())
                    .map(|s| stream = Some(s));
                if let Err(e) = &result {
                    tracing::error!(format = %format, error = %e, "failed to start output");
                }
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                if stream.take().is_some() {
                    tracing::debug!("output stream stopped");
                }
                let _ = reply.send(());
            }
            Command::Pause(paused) => {
                let Some(s) = &stream else { continue };
                let result = if paused {
                    s.pause().map_err(anyhow::Error::from)
                } else {
                    s.play().map_err(anyhow::Error::from)
                };
                if let Err(e) = result {
                    tracing::debug!(paused, error = %e, "stream pause toggle not supported");
                }
            }
            Command::Shutdown => break,
        }
    }
}

fn open_stream(
    host: &cpal::Host,
    config: &OutputConfig,
    format: StreamFormat,
    renderer: Renderer,
    gain: Arc<AtomicU32>,
) -> Result<cpal::Stream> {
    let device = pick_device(host, config.device.as_deref())?;
    let name = device_name(&device);

    let stream = match exact_config(&device, format)? {
        Some(stream_config) => {
            tracing::info!(device = %name, format = %format, "opening bit-exact output stream");
            build_raw_stream(&device, &stream_config, format, renderer, gain)?
        }
        None => {
            let supported = pick_output_config(&device, Some(format.sample_rate))?;
            let converter = StreamConverter::new(
                format,
                supported.sample_rate(),
                supported.channels() as usize,
                config.chunk_frames.unwrap_or(DEFAULT_CHUNK_FRAMES),
            )?;
            tracing::info!(
                device = %name,
                source = %converter.source(),
                rate = supported.sample_rate(),
                channels = supported.channels(),
                sample_format = ?supported.sample_format(),
                resampling = converter.is_resampling(),
                "opening converting output stream"
            );
            build_converting_stream(&device, &supported, converter, renderer, gain)?
        }
    };
    stream.play().context("start output stream")?;
    Ok(stream)
}
