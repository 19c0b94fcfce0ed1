//! Player: a terminal front end for the gapless playback engine.
//!
//! Queues local files or server tracks, starts playback and then reads transport
//! commands from stdin (`play`, `pause`, `next`, `prev`, `seek <ms>`,
//! `volume <0..1>`, `loop <none|one|all>`, `status`, `quit`).
//!
//! With stdin closed the player runs until the queue completes or Ctrl-C.

mod cli;
mod config;
mod control;
mod sink;

use std::io::BufRead;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, bounded, select, unbounded};
use playback_engine::device::list_devices;
use playback_engine::{TrackIdentity, Transport};
use tracing_subscriber::EnvFilter;

use config::PlayerConfig;
use sink::LogSink;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,playback_engine=info,player=info")
        }))
        .init();

    if args.list_devices {
        for device in list_devices(&cpal::default_host())? {
            println!(
                "{}{}  {}-{} Hz, up to {} ch",
                if device.is_default { "* " } else { "  " },
                device.name,
                device.min_rate,
                device.max_rate,
                device.max_channels
            );
        }
        return Ok(());
    }

    let Some(cmd) = args.cmd.as_ref() else {
        anyhow::bail!("nothing to play; use `player files` or `player stream` (see --help)");
    };
    let cfg = PlayerConfig::resolve(&args)?;
    let (queue, token) = build_queue(cmd)?;

    let (completed_tx, completed_rx) = bounded(1);
    let transport = Transport::new(
        cfg.engine,
        cfg.cache,
        cfg.output,
        Arc::new(LogSink::new(completed_tx)),
    )
    .context("start playback engine")?;
    if let Some(token) = token {
        transport.set_auth_token(token);
    }

    let mut queue = queue.into_iter();
    let first: Vec<TrackIdentity> = queue.by_ref().take(1).collect();
    let rest: Vec<TrackIdentity> = queue.collect();
    tracing::info!(tracks = first.len() + rest.len(), "queue loaded");
    transport.set_audios(first, rest);
    transport.play();

    let (interrupt_tx, interrupt_rx) = bounded(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    }) {
        tracing::warn!(error = %e, "failed to install Ctrl-C handler");
    }

    run(&transport, spawn_stdin_reader()?, interrupt_rx, completed_rx);
    transport.shutdown();
    Ok(())
}

fn build_queue(cmd: &cli::Command) -> Result<(Vec<TrackIdentity>, Option<String>)> {
    match cmd {
        cli::Command::Files { paths } => {
            let mut queue = Vec::with_capacity(paths.len());
            for path in paths {
                let path = path
                    .canonicalize()
                    .with_context(|| format!("resolve {:?}", path))?;
                queue.push(TrackIdentity::local(path));
            }
            Ok((queue, None))
        }
        cli::Command::Stream {
            server,
            cache,
            token,
            quality,
            track_ids,
        } => {
            std::fs::create_dir_all(cache)
                .with_context(|| format!("create cache dir {:?}", cache))?;
            let server = if server.ends_with('/') {
                server.clone()
            } else {
                format!("{server}/")
            };
            let queue = track_ids
                .iter()
                .map(|id| {
                    TrackIdentity::remote(server.as_str(), cache.as_path(), *id, quality.as_str(), "")
                })
                .collect();
            Ok((queue, token.clone()))
        }
    }
}

/// Forward stdin lines; the channel disconnects at end of input.
fn spawn_stdin_reader() -> Result<Receiver<String>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "stdin read failed");
                        return;
                    }
                }
            }
        })
        .context("spawn stdin reader")?;
    Ok(rx)
}

fn run(
    transport: &Transport,
    lines: Receiver<String>,
    interrupt: Receiver<()>,
    completed: Receiver<()>,
) {
    let never = crossbeam_channel::never();
    let mut stdin_open = true;
    loop {
        let input = if stdin_open { &lines } else { &never };
        select! {
            recv(input) -> line => match line {
                Ok(line) => {
                    if !handle_line(transport, &line) {
                        return;
                    }
                }
                Err(_) => {
                    tracing::info!("stdin closed; playing until the queue completes");
                    stdin_open = false;
                }
            },
            recv(interrupt) -> _ => {
                tracing::info!("interrupted");
                return;
            }
            recv(completed) -> _ => {
                if !stdin_open {
                    return;
                }
            }
        }
    }
}

/// Returns `false` once the player should exit.
fn handle_line(transport: &Transport, line: &str) -> bool {
    match control::parse_line(line) {
        Ok(Some(control)) => match control::apply(transport, control) {
            Ok(keep_going) => keep_going,
            Err(e) => {
                tracing::warn!("{control:?} failed: {e:#}");
                true
            }
        },
        Ok(None) => true,
        Err(e) => {
            tracing::warn!("{e:#}");
            true
        }
    }
}
