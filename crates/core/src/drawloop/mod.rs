//! Frame driver for the song visualiser.
//!
//! Each iteration waits for the next refresh slot, advances the playback
//! clock, publishes the global modulation values and, while the output is
//! visible and a song is loaded, asks the renderer for a frame.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::config::RenderConfig;
use crate::render::{RenderSettings, RendererHost};
use crate::timeline::{GlobalModulator, PlaybackClock};
use crate::Result;

/// How much diagnostic text is collected per frame.
///
/// Serialised as its numeric level (0, 1 or 2).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DebugLevel {
    #[default]
    Off,
    Basic,
    Detailed,
}

impl DebugLevel {
    pub fn next(self) -> Self {
        match self {
            Self::Off => Self::Basic,
            Self::Basic => Self::Detailed,
            Self::Detailed => Self::Off,
        }
    }

    /// Levels above 2 saturate at [`DebugLevel::Detailed`].
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Off,
            1 => Self::Basic,
            _ => Self::Detailed,
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }
}

impl Serialize for DebugLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.level())
    }
}

impl<'de> Deserialize<'de> for DebugLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            level @ 0..=2 => Ok(Self::from_level(level)),
            other => Err(de::Error::custom(format!(
                "debug level {other} is not one of 0, 1 or 2"
            ))),
        }
    }
}

/// A key press together with its modifier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyChord {
    pub key: char,
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
}

/// Reserved chord cycling the debug level.
pub const DEBUG_TOGGLE: KeyChord = KeyChord::new('d', true, true, false);

impl KeyChord {
    pub const fn new(key: char, ctrl: bool, alt: bool, shift: bool) -> Self {
        Self {
            key,
            ctrl,
            alt,
            shift,
        }
    }

    /// Letters compare case-insensitively; modifiers must match exactly.
    pub fn matches(&self, pressed: &KeyChord) -> bool {
        self.key.eq_ignore_ascii_case(&pressed.key)
            && self.ctrl == pressed.ctrl
            && self.alt == pressed.alt
            && self.shift == pressed.shift
    }
}

/// Blocks until the next frame may start.
pub trait FramePacer {
    fn wait(&mut self, visible: bool);
}

/// Paces frames at a fixed refresh interval, or a longer fixed delay while
/// the output is hidden.
#[derive(Debug, Clone)]
pub struct IntervalPacer {
    interval: Duration,
    hidden_delay: Duration,
    next_frame: Option<Instant>,
}

impl IntervalPacer {
    pub fn new(interval: Duration, hidden_delay: Duration) -> Self {
        Self {
            interval,
            hidden_delay,
            next_frame: None,
        }
    }

    pub fn from_config(config: &RenderConfig) -> Self {
        Self::new(
            Duration::from_secs_f64(1.0 / f64::from(config.refresh_rate_hz.max(1))),
            Duration::from_millis(config.hidden_delay_ms),
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl FramePacer for IntervalPacer {
    fn wait(&mut self, visible: bool) {
        if !visible {
            self.next_frame = None;
            thread::sleep(self.hidden_delay);
            return;
        }
        let now = Instant::now();
        let slot = self.next_frame.unwrap_or(now);
        if slot > now {
            thread::sleep(slot - now);
        }
        // A late frame starts a fresh schedule instead of bursting to catch up.
        self.next_frame = Some(slot.max(now) + self.interval);
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameSample {
    at: Instant,
    render_ms: f64,
    total_ms: f64,
    fps: usize,
}

/// Current value of a rolling metric plus its statistics over the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Stats {
    pub current: f64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
}

impl Stats {
    fn collect(values: impl Iterator<Item = f64>) -> Option<Self> {
        let mut stats: Option<Self> = None;
        let mut count = 0usize;
        let mut sum = 0.0;
        for value in values {
            count += 1;
            sum += value;
            stats = Some(match stats {
                None => Self {
                    current: value,
                    average: value,
                    min: value,
                    max: value,
                },
                Some(s) => Self {
                    current: value,
                    average: 0.0,
                    min: s.min.min(value),
                    max: s.max.max(value),
                },
            });
        }
        stats.map(|s| Self {
            average: sum / count as f64,
            ..s
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSummary {
    /// Frames drawn in the trailing FPS slice.
    pub frames: usize,
    pub fps: Stats,
    pub total_ms: Stats,
    pub render_ms: Stats,
}

/// Rolling frame statistics.
#[derive(Debug, Clone)]
pub struct PerfMetrics {
    window: Duration,
    slice: Duration,
    samples: VecDeque<FrameSample>,
}

impl PerfMetrics {
    pub fn new(window: Duration, slice: Duration) -> Self {
        Self {
            window: window.max(slice),
            slice,
            samples: VecDeque::new(),
        }
    }

    pub fn from_config(config: &RenderConfig) -> Self {
        Self::new(
            Duration::from_secs(config.metrics_window_secs),
            Duration::from_millis(config.fps_slice_ms),
        )
    }

    pub fn record(&mut self, now: Instant, render_ms: f64, total_ms: f64) {
        while self
            .samples
            .front()
            .is_some_and(|sample| sample.at + self.window <= now)
        {
            self.samples.pop_front();
        }
        let in_slice = self
            .samples
            .iter()
            .rev()
            .take_while(|sample| sample.at + self.slice > now)
            .count();
        self.samples.push_back(FrameSample {
            at: now,
            render_ms,
            total_ms,
            fps: in_slice + 1,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn summary(&self) -> Option<MetricsSummary> {
        let last = self.samples.back()?;
        Some(MetricsSummary {
            frames: last.fps,
            fps: Stats::collect(self.samples.iter().map(|s| s.fps as f64))?,
            total_ms: Stats::collect(self.samples.iter().map(|s| s.total_ms))?,
            render_ms: Stats::collect(self.samples.iter().map(|s| s.render_ms))?,
        })
    }

    /// Overlay lines for the basic debug level.
    pub fn debug_text(&self, is_worker: bool, playing: bool) -> Vec<String> {
        let mut text = vec![
            if is_worker {
                "Worker (asynchronous) renderer".to_string()
            } else {
                "Fallback (synchronous) renderer".to_string()
            },
            format!("Playing: {playing}"),
        ];
        if let Some(summary) = self.summary() {
            text.push(format!(
                "FPS: {} ({:.1} / [{} - {}])",
                summary.frames, summary.fps.average, summary.fps.min, summary.fps.max
            ));
            text.push(format!("Total:  {}", format_timing(&summary.total_ms)));
            text.push(format!("Render: {}", format_timing(&summary.render_ms)));
        }
        text
    }
}

fn format_timing(stats: &Stats) -> String {
    format!(
        "{:.1}ms ({:.1}ms / [{:.1}ms - {:.1}ms])",
        stats.current, stats.average, stats.min, stats.max
    )
}

/// Drives the clock, the global modulator and the renderer frame by frame.
pub struct FrameLoop<P = IntervalPacer> {
    host: RendererHost,
    clock: PlaybackClock,
    global: GlobalModulator,
    pacer: P,
    metrics: PerfMetrics,
    debug: DebugLevel,
    visible: bool,
    overlay: Vec<String>,
    frames: u64,
}

impl<P: FramePacer> FrameLoop<P> {
    pub fn new(host: RendererHost, mut clock: PlaybackClock, pacer: P, metrics: PerfMetrics) -> Self {
        clock.set_duration(host.load_result().song_length);
        Self {
            host,
            clock,
            global: GlobalModulator::new(),
            pacer,
            metrics,
            debug: DebugLevel::Off,
            visible: true,
            overlay: Vec::new(),
            frames: 0,
        }
    }

    pub fn host(&self) -> &RendererHost {
        &self.host
    }

    pub fn clock(&self) -> &PlaybackClock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut PlaybackClock {
        &mut self.clock
    }

    pub fn global(&self) -> &GlobalModulator {
        &self.global
    }

    pub fn metrics(&self) -> &PerfMetrics {
        &self.metrics
    }

    pub fn debug_level(&self) -> DebugLevel {
        self.debug
    }

    pub fn set_debug_level(&mut self, level: DebugLevel) {
        self.debug = level;
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Debug overlay of the last drawn frame.
    pub fn overlay(&self) -> &[String] {
        &self.overlay
    }

    /// Frames drawn so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Returns true if the chord was consumed.
    pub fn handle_key(&mut self, pressed: KeyChord) -> bool {
        if !DEBUG_TOGGLE.matches(&pressed) {
            return false;
        }
        self.debug = self.debug.next();
        tracing::info!(level = self.debug.level(), "debug level changed");
        true
    }

    pub fn set_settings(&mut self, settings: RenderSettings) -> Result<()> {
        if let Some(load) = self.host.set_settings(settings, Instant::now())? {
            self.clock.set_duration(load.song_length);
        }
        Ok(())
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.host.resize(width, height)
    }

    /// Runs one iteration; returns whether a frame was drawn.
    pub fn step(&mut self) -> Result<bool> {
        self.pacer.wait(self.visible);
        let started = Instant::now();
        if let Some(load) = self.host.poll(started)? {
            self.clock.set_duration(load.song_length);
        }
        let time = self.clock.update();
        self.global.update(&self.clock);
        if !self.visible || !self.host.has_song() {
            return Ok(false);
        }

        let playing = self.clock.is_playing();
        let render_ms = self.host.draw(time, playing, self.debug)?.render_time;
        let finished = Instant::now();
        let total_ms = finished.duration_since(started).as_secs_f64() * 1000.0;
        self.metrics.record(finished, render_ms, total_ms);
        self.frames += 1;

        self.overlay.clear();
        if self.debug > DebugLevel::Off {
            self.overlay = self.metrics.debug_text(self.host.is_worker(), playing);
            self.overlay
                .extend(self.host.frame_result().debug_text.iter().cloned());
            self.overlay
                .push(format!("Load: {:.2}ms", self.host.load_result().load_time));
        }
        Ok(true)
    }

    /// Steps until `stop` is raised or `frame_limit` iterations have run.
    /// Returns the number of frames drawn.
    pub fn run_until(&mut self, stop: &AtomicBool, frame_limit: Option<u64>) -> Result<u64> {
        let drawn_before = self.frames;
        let mut iterations = 0u64;
        while !stop.load(Ordering::Acquire) && frame_limit.map_or(true, |limit| iterations < limit)
        {
            self.step()?;
            iterations += 1;
        }
        tracing::debug!(
            iterations,
            drawn = self.frames - drawn_before,
            "frame loop stopped"
        );
        Ok(self.frames - drawn_before)
    }
}

impl<P> std::fmt::Debug for FrameLoop<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameLoop")
            .field("host", &self.host)
            .field("clock", &self.clock)
            .field("debug", &self.debug)
            .field("visible", &self.visible)
            .field("frames", &self.frames)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{HeadlessBackend, RenderBackend};
    use crate::song::Song;
    use crate::timeline::{ManualTime, PLAYBACK_TIME, PLAYING};

    #[derive(Default)]
    struct CountingPacer {
        visible_waits: u32,
        hidden_waits: u32,
    }

    impl FramePacer for CountingPacer {
        fn wait(&mut self, visible: bool) {
            if visible {
                self.visible_waits += 1;
            } else {
                self.hidden_waits += 1;
            }
        }
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn headless() -> Box<dyn RenderBackend> {
        Box::new(HeadlessBackend::new())
    }

    fn frame_loop(song: Option<Song>) -> (FrameLoop<CountingPacer>, ManualTime) {
        let time = ManualTime::new();
        let host = RendererHost::new(RenderSettings::new(song, 1), false, ms(0), headless).unwrap();
        let frame_loop = FrameLoop::new(
            host,
            PlaybackClock::new(time.clone()),
            CountingPacer::default(),
            PerfMetrics::new(Duration::from_secs(10), Duration::from_secs(1)),
        );
        (frame_loop, time)
    }

    #[test]
    fn debug_level_cycles() {
        assert_eq!(DebugLevel::Off.next(), DebugLevel::Basic);
        assert_eq!(DebugLevel::Detailed.next(), DebugLevel::Off);
        assert_eq!(DebugLevel::from_level(7), DebugLevel::Detailed);
        assert_eq!(DebugLevel::Basic.level(), 1);
    }

    #[test]
    fn debug_level_serialises_as_number() {
        assert_eq!(serde_json::to_string(&DebugLevel::Detailed).unwrap(), "2");
        let level: DebugLevel = serde_json::from_str("1").unwrap();
        assert_eq!(level, DebugLevel::Basic);
        assert!(serde_json::from_str::<DebugLevel>("3").is_err());
        assert!(serde_json::from_str::<DebugLevel>("\"detailed\"").is_err());
    }

    #[test]
    fn debug_chord_ignores_letter_case() {
        assert!(DEBUG_TOGGLE.matches(&KeyChord::new('D', true, true, false)));
        assert!(!DEBUG_TOGGLE.matches(&KeyChord::new('d', true, false, false)));
        assert!(!DEBUG_TOGGLE.matches(&KeyChord::new('d', true, true, true)));
    }

    #[test]
    fn fps_counts_frames_in_trailing_slice() {
        let start = Instant::now();
        let mut metrics = PerfMetrics::new(Duration::from_secs(10), Duration::from_secs(1));
        for i in 0..4 {
            metrics.record(start + ms(i * 100), 2.0, 4.0);
        }
        assert_eq!(metrics.summary().unwrap().frames, 4);

        metrics.record(start + ms(1_250), 6.0, 8.0);
        let summary = metrics.summary().unwrap();
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.fps.min, 1.0);
        assert_eq!(summary.fps.max, 4.0);
        assert_eq!(summary.render_ms.current, 6.0);
        assert_eq!(summary.render_ms.max, 6.0);
        assert!((summary.total_ms.average - 4.8).abs() < 1e-9);
    }

    #[test]
    fn metrics_forget_samples_outside_window() {
        let start = Instant::now();
        let mut metrics = PerfMetrics::new(Duration::from_secs(2), Duration::from_secs(1));
        metrics.record(start, 100.0, 100.0);
        metrics.record(start + Duration::from_secs(3), 1.0, 1.0);
        let summary = metrics.summary().unwrap();
        assert_eq!(summary.render_ms.max, 1.0);
        assert_eq!(summary.fps.average, 1.0);
    }

    #[test]
    fn metrics_text_lists_renderer_kind_and_timings() {
        let start = Instant::now();
        let mut metrics = PerfMetrics::new(Duration::from_secs(10), Duration::from_secs(1));
        metrics.record(start, 1.5, 2.5);
        let text = metrics.debug_text(true, false);
        assert_eq!(
            text,
            vec![
                "Worker (asynchronous) renderer".to_string(),
                "Playing: false".to_string(),
                "FPS: 1 (1.0 / [1 - 1])".to_string(),
                "Total:  2.5ms (2.5ms / [2.5ms - 2.5ms])".to_string(),
                "Render: 1.5ms (1.5ms / [1.5ms - 1.5ms])".to_string(),
            ]
        );
    }

    #[test]
    fn hidden_output_skips_drawing() {
        let (mut frame_loop, _time) = frame_loop(Some(Song::new(4.0, 4, 4, 1)));
        frame_loop.set_visible(false);
        assert!(!frame_loop.step().unwrap());
        assert_eq!(frame_loop.pacer.hidden_waits, 1);
        assert!(frame_loop.metrics().is_empty());

        frame_loop.set_visible(true);
        assert!(frame_loop.step().unwrap());
        assert_eq!(frame_loop.pacer.visible_waits, 1);
        assert_eq!(frame_loop.frames(), 1);
    }

    #[test]
    fn nothing_is_drawn_without_a_song() {
        let (mut frame_loop, _time) = frame_loop(None);
        assert!(!frame_loop.step().unwrap());
        assert_eq!(frame_loop.frames(), 0);
    }

    #[test]
    fn overlay_follows_debug_level() {
        let (mut frame_loop, time) = frame_loop(Some(Song::new(4.0, 4, 4, 2)));
        assert_eq!(frame_loop.clock().duration(), 8.0);
        frame_loop.clock_mut().start();
        time.advance(1.0);
        frame_loop.step().unwrap();
        assert!(frame_loop.overlay().is_empty());

        assert!(frame_loop.handle_key(KeyChord::new('d', true, true, false)));
        assert!(frame_loop.handle_key(KeyChord::new('d', true, true, false)));
        assert_eq!(frame_loop.debug_level(), DebugLevel::Detailed);
        frame_loop.step().unwrap();
        let overlay = frame_loop.overlay();
        assert_eq!(overlay[0], "Fallback (synchronous) renderer");
        assert_eq!(overlay[1], "Playing: true");
        assert!(overlay.iter().any(|line| line == "Tick: 4.00 (bar 1, beat 2)"));
        assert!(overlay.last().unwrap().starts_with("Load: "));
        assert!(!frame_loop.handle_key(KeyChord::new('x', true, true, false)));
    }

    #[test]
    fn global_modulator_tracks_the_clock() {
        let (mut frame_loop, time) = frame_loop(Some(Song::new(4.0, 4, 4, 2)));
        time.set(3.0);
        frame_loop.step().unwrap();
        let source = frame_loop.global().source();
        assert_eq!(source.get(PLAYING), Some(false));
        assert_eq!(source.get(PLAYBACK_TIME), Some(3.0));

        frame_loop.clock_mut().start();
        time.advance(0.5);
        frame_loop.step().unwrap();
        let source = frame_loop.global().source();
        assert_eq!(source.get(PLAYING), Some(true));
        assert_eq!(source.get(PLAYBACK_TIME), Some(0.5));
    }

    #[test]
    fn settings_change_updates_clock_duration() {
        let (mut frame_loop, _time) = frame_loop(Some(Song::new(4.0, 4, 4, 1)));
        frame_loop
            .set_settings(RenderSettings::new(Some(Song::new(4.0, 4, 4, 3)), 2))
            .unwrap();
        assert_eq!(frame_loop.clock().duration(), 24.0);
    }

    #[test]
    fn run_until_honours_limit_and_stop_flag() {
        let (mut frame_loop, _time) = frame_loop(Some(Song::new(4.0, 4, 4, 1)));
        let stop = AtomicBool::new(false);
        assert_eq!(frame_loop.run_until(&stop, Some(5)).unwrap(), 5);
        stop.store(true, Ordering::Release);
        assert_eq!(frame_loop.run_until(&stop, None).unwrap(), 0);
    }

    #[test]
    fn interval_pacer_waits_for_next_slot() {
        let mut pacer = IntervalPacer::new(ms(20), ms(30));
        let started = Instant::now();
        pacer.wait(true);
        pacer.wait(true);
        assert!(started.elapsed() >= ms(20));

        let hidden = Instant::now();
        pacer.wait(false);
        assert!(hidden.elapsed() >= ms(30));
    }
}
