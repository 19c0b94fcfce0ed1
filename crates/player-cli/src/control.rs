//! Line-based transport commands read from stdin.

use anyhow::{Context, Result, anyhow, bail};
use playback_engine::{LoopMode, Transport};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Control {
    Play,
    Pause,
    Next,
    Prev,
    Seek(u64),
    Volume(f32),
    Loop(LoopMode),
    Status,
    Quit,
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Control>> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();
    let control = match cmd.to_ascii_lowercase().as_str() {
        "play" | "p" => Control::Play,
        "pause" => Control::Pause,
        "next" | "n" => Control::Next,
        "prev" | "b" => Control::Prev,
        "seek" => {
            let ms = arg.ok_or_else(|| anyhow!("seek needs a position in ms"))?;
            Control::Seek(ms.parse().with_context(|| format!("bad position {ms:?}"))?)
        }
        "volume" | "vol" => {
            let v = arg.ok_or_else(|| anyhow!("volume needs a value between 0 and 1"))?;
            Control::Volume(v.parse().with_context(|| format!("bad volume {v:?}"))?)
        }
        "loop" => {
            let mode = arg.ok_or_else(|| anyhow!("loop needs none, one or all"))?;
            Control::Loop(mode.parse()?)
        }
        "status" | "s" => Control::Status,
        "quit" | "q" | "exit" => Control::Quit,
        other => bail!("unknown command {other:?}"),
    };
    Ok(Some(control))
}

/// Apply `control` to the transport. Returns `false` once the player should exit.
pub fn apply(transport: &Transport, control: Control) -> Result<bool> {
    match control {
        Control::Play => transport.play(),
        Control::Pause => transport.pause(),
        Control::Next => transport.next(),
        Control::Prev => transport.prev()?,
        Control::Seek(ms) => transport.seek(ms)?,
        Control::Volume(v) => transport.set_volume(v),
        Control::Loop(mode) => transport.set_loop_mode(mode),
        Control::Status => {
            let status = transport.status();
            tracing::info!(
                playing = status.playing,
                track = status.track_index,
                position_ms = status.position_ms,
                buffered_ms = status.buffered_position_ms,
                duration_ms = ?status.duration_ms,
                state = %status.state,
                loop_mode = %status.loop_mode,
                volume = status.volume,
                format = ?status.output_format,
                "status"
            );
        }
        Control::Quit => return Ok(false),
    }
    Ok(true)
}
