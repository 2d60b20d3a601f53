use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use sound_tile_core::drawloop::FramePacer;
use sound_tile_core::modulation::ModKey;
use sound_tile_core::render::HeadlessBackend;
use sound_tile_core::timeline::{ManualTime, PLAYBACK_TIME};
use sound_tile_core::{
    DebugLevel, FrameLoop, PerfMetrics, PlaybackClock, RenderBackend, RenderSettings,
    RendererHost, Song, Target, Transform,
};

const PHASE: ModKey<f64> = ModKey::new("phase");

struct NoWait;

impl FramePacer for NoWait {
    fn wait(&mut self, _visible: bool) {}
}

fn headless() -> Box<dyn RenderBackend> {
    Box::new(HeadlessBackend::new())
}

fn settings(bars: usize) -> RenderSettings {
    RenderSettings::new(Some(Song::new(4.0, 4, 4, bars)), 1)
}

#[test]
fn worker_table_is_readable_from_other_threads() {
    let host = RendererHost::new(settings(2), true, Duration::ZERO, headless).unwrap();
    assert!(host.is_worker());
    let table = host.table();
    let ticks = thread::spawn(move || table.load().unwrap().lookup(6.0))
        .join()
        .unwrap();
    assert_eq!(ticks, 24.0);
}

#[test]
fn frame_loop_drives_playback_through_the_worker() {
    let time = ManualTime::new();
    let host = RendererHost::new(settings(2), true, Duration::ZERO, headless).unwrap();
    let mut frame_loop = FrameLoop::new(
        host,
        PlaybackClock::new(time.clone()),
        NoWait,
        PerfMetrics::new(Duration::from_secs(10), Duration::from_secs(1)),
    );
    frame_loop.set_debug_level(DebugLevel::Detailed);
    frame_loop.clock_mut().start();

    time.advance(5.0);
    assert!(frame_loop.step().unwrap());
    let overlay = frame_loop.overlay();
    assert_eq!(overlay[0], "Worker (asynchronous) renderer");
    assert!(overlay.iter().any(|line| line == "Tick: 20.00 (bar 2, beat 2)"));

    time.advance(10.0);
    frame_loop.step().unwrap();
    assert!(!frame_loop.clock().is_playing());
    assert_eq!(frame_loop.clock().current_time(), 8.0);
}

#[test]
fn playback_time_reaches_tiles_through_the_modulation_graph() {
    let time = ManualTime::new();
    let host = RendererHost::new(settings(4), false, Duration::ZERO, headless).unwrap();
    let mut frame_loop = FrameLoop::new(
        host,
        PlaybackClock::new(time.clone()),
        NoWait,
        PerfMetrics::new(Duration::from_secs(10), Duration::from_secs(1)),
    );
    let tile = Target::new("Tile").with_slot(PHASE, 0.0);
    assert!(frame_loop.global().source().connect_with(
        &tile,
        PLAYBACK_TIME,
        PHASE,
        vec![Transform::Linear(0.5, 1.0)],
    ));

    frame_loop.clock_mut().start();
    time.advance(4.0);
    let stop = AtomicBool::new(false);
    assert_eq!(frame_loop.run_until(&stop, Some(1)).unwrap(), 1);
    assert_eq!(tile.get(PHASE), Some(3.0));

    frame_loop.global().source().disconnect_target(&tile);
    time.advance(2.0);
    frame_loop.step().unwrap();
    assert_eq!(tile.get(PHASE), Some(3.0));
    assert!(!tile.connected(PHASE));
}

#[test]
fn corrupt_song_renders_nothing_instead_of_failing() {
    let mut song = Song::new(4.0, 4, 4, 1);
    song.bar_length = 0;
    let host = RendererHost::new(
        RenderSettings::new(Some(song), 1),
        false,
        Duration::ZERO,
        headless,
    )
    .unwrap();
    assert_eq!(host.load_result().song_length, 0.0);
    assert!(host.table().load().unwrap().is_empty());
}
