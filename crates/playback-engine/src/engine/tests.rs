use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::format::{SampleFormat, StreamFormat};
use crate::test_support::{
    FlakyProvider, ManualOutput, MemoryProvider, RecordingSink, s16_values, wait_until, wav_ramp,
    wav_ramp_from,
};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> EngineConfig {
    EngineConfig {
        ring_seconds: 1,
        reconnect_interval_ms: 10,
        fill_wait_ms: 2,
        ..EngineConfig::default()
    }
}

struct Harness {
    engine: PlaybackEngine,
    output: ManualOutput,
    sink: Arc<RecordingSink>,
}

fn harness(provider: Arc<dyn SourceProvider>, config: EngineConfig) -> Harness {
    let output = ManualOutput::default();
    let sink = Arc::new(RecordingSink::default());
    let engine =
        PlaybackEngine::new(config, provider, Box::new(output.clone()), sink.clone()).unwrap();
    Harness {
        engine,
        output,
        sink,
    }
}

fn id(name: &str) -> TrackIdentity {
    TrackIdentity::local(name)
}

fn ids(names: &[&str]) -> Vec<TrackIdentity> {
    names.iter().map(|n| id(n)).collect()
}

fn mono(rate: u32) -> StreamFormat {
    StreamFormat::new(SampleFormat::S16, 1, rate)
}

impl Harness {
    fn slots(&self) -> std::sync::MutexGuard<'_, Slots> {
        lock(&self.engine.inner.slots)
    }

    /// Current track committed and its next neighbour fully decoded.
    fn wait_window_buffered(&self) -> bool {
        wait_until(WAIT, || {
            let slots = self.slots();
            let current_done = slots
                .current
                .as_ref()
                .is_some_and(|c| c.finished_reading());
            let next_done = slots
                .next
                .as_ref()
                .is_some_and(|n| n.is_opened() && n.finished_reading());
            current_done && next_done
        })
    }

    /// First callback cycle that is not pure silence. A cycle that loses the slot
    /// lock to another thread renders silence, so those are skipped.
    fn pull_audible(&self, frames: usize) -> Vec<i16> {
        let deadline = std::time::Instant::now() + WAIT;
        while std::time::Instant::now() < deadline {
            if let Some(bytes) = self.output.pull(frames) {
                let values = s16_values(&bytes);
                if values.iter().any(|v| *v != 0) {
                    return values;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Vec::new()
    }

    /// Pull callback cycles until `cond` holds.
    fn pull_until(&self, frames: usize, cond: impl Fn() -> bool) -> Vec<i16> {
        let mut values = Vec::new();
        let deadline = std::time::Instant::now() + WAIT;
        while !cond() && std::time::Instant::now() < deadline {
            if let Some(bytes) = self.output.pull(frames) {
                values.extend(s16_values(&bytes));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        values
    }
}

#[test]
fn starts_idle_and_paused() {
    let h = harness(Arc::new(MemoryProvider::new()), config());
    assert_eq!(h.engine.state(), ProcessingState::Idle);
    assert!(!h.engine.is_playing());
    assert_eq!(h.engine.current_track_index(), -1);
    assert_eq!(h.engine.position_ms(), 0);
    assert_eq!(h.engine.duration_ms(), None);
    assert!(h.output.starts().is_empty());
}

#[test]
fn set_audios_commits_current_and_starts_output() {
    let provider = MemoryProvider::new().with_track("a.wav", wav_ramp(8_000, 1, 4_000));
    let h = harness(Arc::new(provider), config());
    h.engine.set_audios(ids(&["a.wav"]), Vec::new());

    assert!(wait_until(WAIT, || h.output.format() == Some(mono(8_000))));
    assert!(wait_until(WAIT, || h.sink.audio_changes() == vec![0]));
    assert_eq!(h.engine.current_track_index(), 0);
    assert!(h.output.paused());
    // Paused, so readiness is reported without the callback running.
    assert!(wait_until(WAIT, || h.engine.state() == ProcessingState::Ready));
    assert_eq!(h.engine.status().output_format, Some(mono(8_000)));
}

#[test]
fn gapless_handover_is_sample_exact() {
    let provider = MemoryProvider::new()
        .with_track("a.wav", wav_ramp_from(8_000, 1, 800, 1))
        .with_track("b.wav", wav_ramp_from(8_000, 1, 800, 1_001));
    let h = harness(Arc::new(provider), config());
    h.engine.set_audios(ids(&["a.wav"]), ids(&["b.wav"]));
    assert!(wait_until(WAIT, || h.output.format().is_some()));
    assert!(h.wait_window_buffered());
    h.engine.play();

    let values = h.pull_audible(2_000);
    let expected: Vec<i16> = (1..=800).chain(1_001..=1_800).collect();
    assert_eq!(&values[..1_600], expected.as_slice());
    assert!(values[1_600..].iter().all(|v| *v == 0));

    assert!(wait_until(WAIT, || h.sink.audio_changes() == vec![0, 1]));
    assert_eq!(h.engine.current_track_index(), 1);
    assert_eq!(h.engine.state(), ProcessingState::Completed);
    assert_eq!(h.output.starts().len(), 1);
}

#[test]
fn rapid_requests_coalesce_to_the_last() {
    let provider = MemoryProvider::new()
        .with_track("a.wav", wav_ramp(8_000, 1, 800))
        .with_track("b.wav", wav_ramp(8_000, 1, 800))
        .with_track("c.wav", wav_ramp(8_000, 1, 800))
        .with_delay(Duration::from_millis(50));
    let h = harness(Arc::new(provider), config());

    h.engine.set_audios(ids(&["a.wav"]), ids(&["b.wav", "c.wav"]));
    h.engine.set_audios(ids(&["a.wav", "b.wav"]), ids(&["c.wav"]));
    h.engine.set_audios(ids(&["a.wav", "b.wav", "c.wav"]), Vec::new());

    assert!(wait_until(WAIT, || h.output.format().is_some()));
    assert!(wait_until(WAIT, || h.engine.current_track_index() == 2));
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(h.sink.audio_changes(), vec![2]);
    assert_eq!(h.output.starts().len(), 1);
}

#[test]
fn format_change_restarts_output_between_tracks() {
    let provider = MemoryProvider::new()
        .with_track("a.wav", wav_ramp(8_000, 1, 800))
        .with_track("b.wav", wav_ramp(16_000, 1, 1_600));
    let h = harness(Arc::new(provider), config());
    h.engine.set_audios(ids(&["a.wav"]), ids(&["b.wav"]));
    assert!(wait_until(WAIT, || h.output.format() == Some(mono(8_000))));
    assert!(h.wait_window_buffered());
    h.engine.play();

    let first = h.pull_audible(2_000);
    assert_eq!(first[799], 799);
    assert!(first[800..].iter().all(|v| *v == 0));

    assert!(wait_until(WAIT, || h.output.format() == Some(mono(16_000))));
    assert_eq!(h.output.starts(), vec![mono(8_000), mono(16_000)]);
    assert!(wait_until(WAIT, || h.sink.audio_changes() == vec![0, 1]));
    assert_eq!(h.engine.current_track_index(), 1);

    let second = h.pull_audible(4);
    assert_eq!(second, vec![0, 1, 2, 3]);
}

#[test]
fn window_evicts_tracks_outside_retention() {
    let names = ["t0.wav", "t1.wav", "t2.wav", "t3.wav", "t4.wav", "t5.wav"];
    let provider = names.iter().fold(MemoryProvider::new(), |p, name| {
        p.with_track(name, wav_ramp(8_000, 1, 400))
    });
    let h = harness(
        Arc::new(provider),
        EngineConfig {
            retain_previous: 1,
            retain_next: 1,
            ..config()
        },
    );
    let cache = &h.engine.inner.cache;

    h.engine.set_audios(ids(&names[..4]), ids(&names[4..]));
    assert!(wait_until(WAIT, || {
        let slots = h.slots();
        slots.previous.as_ref().is_some_and(|p| p.is_opened())
            && slots.next.as_ref().is_some_and(|n| n.is_opened())
    }));
    assert!(cache.contains(&id("t2.wav")));
    assert!(cache.contains(&id("t3.wav")));
    assert!(cache.contains(&id("t4.wav")));
    assert!(!cache.contains(&id("t0.wav")));

    h.engine.set_audios(ids(&names[..1]), ids(&names[1..]));
    assert!(wait_until(WAIT, || {
        cache.contains(&id("t0.wav"))
            && cache.contains(&id("t1.wav"))
            && !cache.contains(&id("t2.wav"))
            && !cache.contains(&id("t3.wav"))
            && !cache.contains(&id("t4.wav"))
    }));
    assert!(!cache.contains(&id("t5.wav")));
}

#[test]
fn loop_one_reports_each_wrap() {
    let provider = MemoryProvider::new().with_track("a.wav", wav_ramp(8_000, 1, 400));
    let h = harness(Arc::new(provider), config());
    h.engine.set_loop_mode(LoopMode::One);
    h.engine.set_audios(ids(&["a.wav"]), Vec::new());
    assert!(wait_until(WAIT, || h.sink.audio_changes() == vec![0]));
    h.engine.play();

    let values = h.pull_until(200, || h.sink.audio_changes().len() >= 3);
    assert_eq!(&h.sink.audio_changes()[..3], &[0, 0, 0]);
    let wrap = values.windows(2).position(|w| w[0] == 399 && w[1] == 0);
    assert!(wrap.is_some());
    assert!(!h.sink.states().contains(&ProcessingState::Completed));
}

#[test]
fn loop_all_wraps_single_track_queue() {
    let provider = MemoryProvider::new().with_track("a.wav", wav_ramp(8_000, 1, 400));
    let h = harness(Arc::new(provider), config());
    h.engine.set_loop_mode(LoopMode::All);
    h.engine.set_audios(ids(&["a.wav"]), Vec::new());
    assert!(wait_until(WAIT, || h.output.format().is_some()));
    assert!(wait_until(WAIT, || h.slots().current.as_ref().is_some_and(|c| c.is_looping())));
    h.engine.play();

    h.pull_until(200, || h.sink.audio_changes().len() >= 2);
    assert_eq!(&h.sink.audio_changes()[..2], &[0, 0]);
}

#[test]
fn volume_is_clamped_and_forwarded() {
    let h = harness(Arc::new(MemoryProvider::new()), config());
    h.engine.set_volume(1.5);
    assert_eq!(h.engine.volume(), 1.0);
    assert_eq!(h.output.volume(), 1.0);
    h.engine.set_volume(-0.5);
    assert_eq!(h.engine.volume(), 0.0);
    h.engine.set_volume(f32::NAN);
    assert_eq!(h.engine.volume(), 0.0);
    h.engine.set_volume(0.4);
    assert_eq!(h.output.volume(), 0.4);
}

#[test]
fn play_and_pause_drive_the_output() {
    let h = harness(Arc::new(MemoryProvider::new()), config());
    h.engine.play();
    assert!(h.engine.is_playing());
    assert!(!h.output.paused());
    h.engine.pause();
    assert!(!h.engine.is_playing());
    assert!(h.output.paused());
}

#[test]
fn seek_moves_the_current_track() {
    let provider = MemoryProvider::new().with_track("a.wav", wav_ramp(8_000, 1, 8_000));
    let h = harness(Arc::new(provider), config());
    h.engine.set_audios(ids(&["a.wav"]), Vec::new());
    assert!(wait_until(WAIT, || h.output.format().is_some()));
    h.engine.play();

    h.engine.seek(500).unwrap();
    assert_eq!(h.engine.position_ms(), 500);
    assert_eq!(h.engine.state(), ProcessingState::Ready);
    let values = h.pull_audible(4);
    assert_eq!(values, vec![4_000, 4_001, 4_002, 4_003]);
}

#[test]
fn seek_while_opening_applies_on_commit() {
    let provider = MemoryProvider::new()
        .with_track("a.wav", wav_ramp(8_000, 1, 8_000))
        .with_delay(Duration::from_millis(200));
    let h = harness(Arc::new(provider), config());
    h.engine.set_audios(ids(&["a.wav"]), Vec::new());
    assert!(wait_until(WAIT, || h.slots().pending.is_some()));

    h.engine.seek(250).unwrap();
    assert!(wait_until(WAIT, || h.output.format().is_some()));
    assert_eq!(h.engine.position_ms(), 250);
    h.engine.play();
    assert_eq!(h.pull_audible(2), vec![2_000, 2_001]);
}

#[test]
fn next_and_prev_follow_queue_bounds() {
    let provider = MemoryProvider::new()
        .with_track("a.wav", wav_ramp(8_000, 1, 400))
        .with_track("b.wav", wav_ramp(8_000, 1, 400))
        .with_track("c.wav", wav_ramp(8_000, 1, 400));
    let h = harness(Arc::new(provider), config());
    let at = |index: i64| wait_until(WAIT, || h.engine.current_track_index() == index);

    h.engine.set_audios(ids(&["a.wav"]), ids(&["b.wav", "c.wav"]));
    assert!(at(0));
    h.engine.next();
    assert!(at(1));
    h.engine.next();
    assert!(at(2));

    // End of queue without looping stays put.
    h.engine.next();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(h.engine.current_track_index(), 2);

    h.engine.set_loop_mode(LoopMode::All);
    h.engine.next();
    assert!(at(0));
    h.engine.prev().unwrap();
    assert!(at(2));

    h.engine.set_loop_mode(LoopMode::None);
    h.engine.prev().unwrap();
    assert!(at(1));
    h.engine.prev().unwrap();
    assert!(at(0));

    // First track without looping restarts instead of moving.
    assert!(wait_until(WAIT, || h.output.format().is_some()
        && h.slots().current.as_ref().is_some_and(|c| c.is_opened())));
    h.engine.prev().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(h.engine.current_track_index(), 0);
    assert_eq!(h.engine.position_ms(), 0);
}

#[test]
fn missing_track_reports_error() {
    let h = harness(Arc::new(MemoryProvider::new()), config());
    h.engine.set_audios(ids(&["missing.wav"]), Vec::new());
    assert!(wait_until(WAIT, || h.engine.state() == ProcessingState::Error));
    let states = h.sink.states();
    assert_eq!(states.first(), Some(&ProcessingState::Buffering));
    assert!(h.output.starts().is_empty());
}

#[test]
fn failed_next_track_completes_the_queue() {
    let provider = MemoryProvider::new().with_track("a.wav", wav_ramp_from(8_000, 1, 400, 1));
    let h = harness(Arc::new(provider), config());
    h.engine.set_audios(ids(&["a.wav"]), ids(&["missing.wav"]));
    assert!(wait_until(WAIT, || {
        h.slots().next.as_ref().is_some_and(|n| n.is_error())
    }));
    h.engine.play();

    let values = h.pull_until(256, || h.engine.state() == ProcessingState::Completed);
    assert_eq!(h.engine.state(), ProcessingState::Completed);
    let audible: Vec<i16> = values.into_iter().filter(|v| *v != 0).collect();
    assert_eq!(audible, (1..=400).collect::<Vec<i16>>());
    assert_eq!(h.engine.current_track_index(), 0);
    assert_eq!(h.sink.audio_changes(), vec![0]);
    assert!(!h.sink.states().contains(&ProcessingState::Error));
}

#[test]
fn mid_stream_reset_only_buffers() {
    let provider = FlakyProvider::new(wav_ramp_from(8_000, 1, 20_000, 1), 0, Some(12_000));
    let h = harness(provider.clone(), config());
    h.engine.set_audios(ids(&["a.wav"]), Vec::new());
    assert!(wait_until(WAIT, || h.output.format().is_some()));
    h.engine.play();

    let values = h.pull_until(256, || h.engine.state() == ProcessingState::Completed);
    assert_eq!(h.engine.state(), ProcessingState::Completed);
    let audible: Vec<i16> = values.into_iter().filter(|v| *v != 0).collect();
    assert_eq!(audible, (1..=20_000).collect::<Vec<i16>>());
    assert!(provider.opens() >= 2);
    assert!(!h.sink.states().contains(&ProcessingState::Error));
}

#[test]
fn play_after_completion_restarts_track() {
    let provider = MemoryProvider::new().with_track("a.wav", wav_ramp(8_000, 1, 400));
    let h = harness(Arc::new(provider), config());
    h.engine.set_audios(ids(&["a.wav"]), Vec::new());
    assert!(wait_until(WAIT, || h.output.format().is_some()));
    h.engine.play();

    h.pull_until(256, || h.engine.state() == ProcessingState::Completed);
    assert_eq!(h.engine.state(), ProcessingState::Completed);
    assert_eq!(h.engine.position_ms(), 50);

    h.engine.pause();
    h.engine.play();
    assert_eq!(h.engine.position_ms(), 0);
    assert_eq!(h.engine.state(), ProcessingState::Ready);
    assert_eq!(h.pull_audible(2), vec![0, 1]);
}

#[test]
fn empty_queue_stops_output_and_goes_idle() {
    let provider = MemoryProvider::new().with_track("a.wav", wav_ramp(8_000, 1, 400));
    let h = harness(Arc::new(provider), config());
    h.engine.set_audios(ids(&["a.wav"]), Vec::new());
    assert!(wait_until(WAIT, || h.output.format().is_some()));

    h.engine.set_audios(Vec::new(), Vec::new());
    assert!(wait_until(WAIT, || h.engine.state() == ProcessingState::Idle));
    assert_eq!(h.engine.current_track_index(), -1);
    assert_eq!(h.output.format(), None);
    assert_eq!(h.output.stops(), 1);
}

#[test]
fn auth_token_reaches_provider() {
    let provider = FlakyProvider::new(wav_ramp(8_000, 1, 400), 0, None);
    let h = harness(provider.clone(), config());
    h.engine.set_auth_token("secret");
    h.engine.set_audios(ids(&["a.wav"]), Vec::new());
    assert!(wait_until(WAIT, || h.output.format().is_some()));
    assert_eq!(provider.last_token(), "secret");
}

#[test]
fn shutdown_is_idempotent_and_closes_decoders() {
    let provider = MemoryProvider::new()
        .with_track("a.wav", wav_ramp(8_000, 1, 400))
        .with_track("b.wav", wav_ramp(8_000, 1, 400));
    let h = harness(Arc::new(provider), config());
    h.engine.set_audios(ids(&["a.wav"]), ids(&["b.wav"]));
    assert!(wait_until(WAIT, || h.output.format().is_some()));

    h.engine.shutdown();
    h.engine.shutdown();
    assert!(h.engine.inner.cache.is_empty());
    assert_eq!(h.output.format(), None);
    assert_eq!(h.engine.current_track_index(), 0);
    let keep: HashSet<TrackIdentity> = HashSet::new();
    assert_eq!(h.engine.inner.cache.evict_unreferenced(&keep), 0);
}
